//! Linear undo/redo history over a story's content. One cursor per
//! story; writing after an undo truncates the redo branch.

use chrono::Utc;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::{HistoryEntry, HistoryPosition, MAX_HISTORY, Storage};

#[derive(Debug, Clone, Copy)]
pub struct HistoryStatus {
    pub can_undo: bool,
    pub can_redo: bool,
}

/// Records `content` as a new history entry unless it's identical to
/// the entry at the current cursor. Truncates any entries after the
/// cursor (the redo branch), appends, advances the cursor, and prunes
/// down to `MAX_HISTORY`.
pub fn save_to_history(
    storage: &dyn Storage,
    story_id: Uuid,
    content: &str,
    word_count: u32,
) -> Result<()> {
    let position = storage.get_history_position(story_id)?;
    let entries = storage.list_history(story_id)?;

    if let Some(pos) = position
        && let Some(current) = entries.iter().find(|e| e.id == pos.history_entry_id)
        && current.content == content
    {
        return Ok(());
    }

    if let Some(pos) = position {
        storage.delete_history_after(story_id, pos.history_entry_id)?;
    }

    let inserted = storage.insert_history_entry(HistoryEntry {
        id: 0,
        story_id,
        content: content.to_string(),
        word_count,
        created: Utc::now(),
    })?;

    storage.set_history_position(HistoryPosition {
        story_id,
        history_entry_id: inserted.id,
    })?;

    storage.prune_history(story_id, MAX_HISTORY)?;
    Ok(())
}

/// Applies a content edit to a story and snapshots both sides of it:
/// the content as it stood before the write (a no-op if that's already
/// the entry at the cursor — e.g. the story's freshly-created seed, or
/// the previous call's post-write snapshot) and the content after. This
/// is the only path that should be used to write story content outside
/// of `undo`/`redo`, since it's what keeps every write individually
/// undoable back to the seed.
pub fn write_story_content(
    storage: &dyn Storage,
    story_id: Uuid,
    new_content: String,
) -> Result<crate::storage::Story> {
    let story = storage.get_story(story_id)?;
    save_to_history(storage, story_id, &story.content, story.word_count)?;

    let updated = storage.update_story_content(story_id, new_content)?;
    save_to_history(storage, story_id, &updated.content, updated.word_count)?;

    Ok(updated)
}

/// Moves the cursor to the entry immediately before the current one
/// and applies its content to the story, without recording a new
/// history entry. Returns `None` if there is nothing to undo to.
pub fn undo(storage: &dyn Storage, story_id: Uuid) -> Result<Option<String>> {
    let entries = sorted_entries(storage, story_id)?;
    let position = storage.get_history_position(story_id)?;
    let Some(pos) = position else { return Ok(None) };

    let target = entries.iter().filter(|e| e.id < pos.history_entry_id).next_back();
    let Some(target) = target else { return Ok(None) };

    storage.set_history_position(HistoryPosition {
        story_id,
        history_entry_id: target.id,
    })?;
    storage.update_story_content(story_id, target.content.clone())?;
    Ok(Some(target.content.clone()))
}

/// Analogous to `undo`, moving to the least-id entry greater than the
/// current cursor.
pub fn redo(storage: &dyn Storage, story_id: Uuid) -> Result<Option<String>> {
    let entries = sorted_entries(storage, story_id)?;
    let position = storage.get_history_position(story_id)?;
    let Some(pos) = position else { return Ok(None) };

    let target = entries.iter().find(|e| e.id > pos.history_entry_id);
    let Some(target) = target else { return Ok(None) };

    storage.set_history_position(HistoryPosition {
        story_id,
        history_entry_id: target.id,
    })?;
    storage.update_story_content(story_id, target.content.clone())?;
    Ok(Some(target.content.clone()))
}

/// Reports whether undo/redo are currently possible. If the story has
/// content but no history rows yet, auto-seeds one entry from the
/// current content first.
pub fn get_history_status(storage: &dyn Storage, story_id: Uuid) -> Result<HistoryStatus> {
    let mut entries = storage.list_history(story_id)?;
    if entries.is_empty() {
        let story = storage.get_story(story_id)?;
        if !story.content.is_empty() {
            save_to_history(storage, story_id, &story.content, story.word_count)?;
            entries = storage.list_history(story_id)?;
        }
    }

    let position = storage.get_history_position(story_id)?;
    let Some(pos) = position else {
        return Ok(HistoryStatus { can_undo: false, can_redo: false });
    };
    let before = entries.iter().filter(|e| e.id < pos.history_entry_id).count();
    let after = entries.iter().filter(|e| e.id > pos.history_entry_id).count();
    Ok(HistoryStatus { can_undo: before > 0, can_redo: after > 0 })
}

fn sorted_entries(storage: &dyn Storage, story_id: Uuid) -> Result<Vec<HistoryEntry>> {
    let mut entries = storage.list_history(story_id)?;
    entries.sort_by_key(|e| e.id);
    Ok(entries)
}
