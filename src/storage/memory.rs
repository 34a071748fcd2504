//! An in-memory `Storage` implementation used by tests (and available
//! to callers who don't want a SQLite file on disk). Mirrors the
//! invariants of `sqlite::SqliteStorage` exactly; `orchestrator`/
//! `history` tests run against this backend.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use super::model::*;
use crate::error::{Error, Result};
use crate::storage::Storage;

#[derive(Default)]
struct State {
    stories: HashMap<Uuid, Story>,
    characters: HashMap<Uuid, Character>,
    lorebooks: HashMap<Uuid, Lorebook>,
    presets: HashMap<Uuid, Preset>,
    settings: Option<Settings>,
    story_characters: Vec<(Uuid, Uuid)>,
    story_lorebooks: Vec<(Uuid, Uuid)>,
    history: HashMap<Uuid, Vec<HistoryEntry>>,
    history_positions: HashMap<Uuid, HistoryPosition>,
    next_entry_id: i64,
}

pub struct MemoryStorage {
    state: Mutex<State>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

fn not_found(what: &str, id: Uuid) -> Error {
    Error::NotFound(format!("{what} {id} not found"))
}

/// Recomputes a story's auto-managed title (S4) from its currently
/// attached characters, if the title hasn't been customized.
fn retitle_story(state: &mut State, story_id: Uuid) {
    let names: Vec<String> = state
        .story_characters
        .iter()
        .filter(|(s, _)| *s == story_id)
        .filter_map(|(_, c)| state.characters.get(c).map(|ch| ch.name.clone()))
        .collect();
    if let Some(story) = state.stories.get_mut(&story_id)
        && is_auto_title(&story.title)
    {
        story.title = auto_title(&names);
    }
}

impl Storage for MemoryStorage {
    fn create_story(&self, story: Story) -> Result<Story> {
        let mut state = self.state.lock().unwrap();
        state.stories.insert(story.id, story.clone());
        Ok(story)
    }

    fn get_story(&self, id: Uuid) -> Result<Story> {
        let state = self.state.lock().unwrap();
        state.stories.get(&id).cloned().ok_or_else(|| not_found("story", id))
    }

    fn list_stories(&self) -> Result<Vec<Story>> {
        let state = self.state.lock().unwrap();
        Ok(state.stories.values().cloned().collect())
    }

    fn update_story_content(&self, id: Uuid, content: String) -> Result<Story> {
        let mut state = self.state.lock().unwrap();
        let story = state.stories.get_mut(&id).ok_or_else(|| not_found("story", id))?;
        story.word_count = count_words(&content);
        story.content = content;
        story.modified = chrono::Utc::now();
        Ok(story.clone())
    }

    fn update_story_metadata(&self, story: Story) -> Result<Story> {
        let mut state = self.state.lock().unwrap();
        if !state.stories.contains_key(&story.id) {
            return Err(not_found("story", story.id));
        }
        state.stories.insert(story.id, story.clone());
        Ok(story)
    }

    fn delete_story(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stories.remove(&id).ok_or_else(|| not_found("story", id))?;
        state.story_characters.retain(|(s, _)| *s != id);
        state.story_lorebooks.retain(|(s, _)| *s != id);
        state.history.remove(&id);
        state.history_positions.remove(&id);
        Ok(())
    }

    fn add_story_character(&self, story_id: Uuid, character_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.story_characters.contains(&(story_id, character_id)) {
            state.story_characters.push((story_id, character_id));
        }
        retitle_story(&mut state, story_id);
        Ok(())
    }

    fn remove_story_character(&self, story_id: Uuid, character_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.story_characters.retain(|(s, c)| !(*s == story_id && *c == character_id));
        if let Some(story) = state.stories.get_mut(&story_id)
            && story.persona_character_id == Some(character_id)
        {
            story.persona_character_id = None;
        }
        retitle_story(&mut state, story_id);
        Ok(())
    }

    fn list_story_characters(&self, story_id: Uuid) -> Result<Vec<Character>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .story_characters
            .iter()
            .filter(|(s, _)| *s == story_id)
            .filter_map(|(_, c)| state.characters.get(c).cloned())
            .collect())
    }

    fn add_story_lorebook(&self, story_id: Uuid, lorebook_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.story_lorebooks.contains(&(story_id, lorebook_id)) {
            state.story_lorebooks.push((story_id, lorebook_id));
        }
        Ok(())
    }

    fn remove_story_lorebook(&self, story_id: Uuid, lorebook_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.story_lorebooks.retain(|(s, l)| !(*s == story_id && *l == lorebook_id));
        Ok(())
    }

    fn list_story_lorebooks(&self, story_id: Uuid) -> Result<Vec<Lorebook>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .story_lorebooks
            .iter()
            .filter(|(s, _)| *s == story_id)
            .filter_map(|(_, l)| state.lorebooks.get(l).cloned())
            .collect())
    }

    fn create_character(&self, character: Character) -> Result<Character> {
        let mut state = self.state.lock().unwrap();
        state.characters.insert(character.id, character.clone());
        Ok(character)
    }

    fn get_character(&self, id: Uuid) -> Result<Character> {
        let state = self.state.lock().unwrap();
        state.characters.get(&id).cloned().ok_or_else(|| not_found("character", id))
    }

    fn list_characters(&self) -> Result<Vec<Character>> {
        let state = self.state.lock().unwrap();
        Ok(state.characters.values().cloned().collect())
    }

    fn update_character(&self, character: Character) -> Result<Character> {
        let mut state = self.state.lock().unwrap();
        if !state.characters.contains_key(&character.id) {
            return Err(not_found("character", character.id));
        }
        state.characters.insert(character.id, character.clone());
        Ok(character)
    }

    fn delete_character(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.characters.remove(&id).ok_or_else(|| not_found("character", id))?;
        state.story_characters.retain(|(_, c)| *c != id);
        for story in state.stories.values_mut() {
            if story.persona_character_id == Some(id) {
                story.persona_character_id = None;
            }
        }
        Ok(())
    }

    fn create_lorebook(&self, lorebook: Lorebook) -> Result<Lorebook> {
        let mut state = self.state.lock().unwrap();
        state.lorebooks.insert(lorebook.id, lorebook.clone());
        Ok(lorebook)
    }

    fn get_lorebook(&self, id: Uuid) -> Result<Lorebook> {
        let state = self.state.lock().unwrap();
        state.lorebooks.get(&id).cloned().ok_or_else(|| not_found("lorebook", id))
    }

    fn list_lorebooks(&self) -> Result<Vec<Lorebook>> {
        let state = self.state.lock().unwrap();
        Ok(state.lorebooks.values().cloned().collect())
    }

    fn save_lorebook(&self, mut lorebook: Lorebook) -> Result<Lorebook> {
        let mut state = self.state.lock().unwrap();
        if !state.lorebooks.contains_key(&lorebook.id) {
            return Err(not_found("lorebook", lorebook.id));
        }
        // delete-all-then-reinsert: entry ids restart at 1 per lorebook
        // every save, matching SqliteStorage so id-based tie-breaks in
        // lorebook::order_and_budget agree across both backends.
        for (i, entry) in lorebook.entries.iter_mut().enumerate() {
            entry.id = i as i64 + 1;
        }
        state.lorebooks.insert(lorebook.id, lorebook.clone());
        Ok(lorebook)
    }

    fn delete_lorebook(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.lorebooks.remove(&id).ok_or_else(|| not_found("lorebook", id))?;
        state.story_lorebooks.retain(|(_, l)| *l != id);
        Ok(())
    }

    fn create_preset(&self, preset: Preset) -> Result<Preset> {
        let mut state = self.state.lock().unwrap();
        if preset.is_default {
            for p in state.presets.values_mut() {
                p.is_default = false;
            }
        }
        state.presets.insert(preset.id, preset.clone());
        Ok(preset)
    }

    fn get_preset(&self, id: Uuid) -> Result<Preset> {
        let state = self.state.lock().unwrap();
        state.presets.get(&id).cloned().ok_or_else(|| not_found("preset", id))
    }

    fn list_presets(&self) -> Result<Vec<Preset>> {
        let state = self.state.lock().unwrap();
        Ok(state.presets.values().cloned().collect())
    }

    fn save_preset(&self, preset: Preset) -> Result<Preset> {
        let mut state = self.state.lock().unwrap();
        if !state.presets.contains_key(&preset.id) {
            return Err(not_found("preset", preset.id));
        }
        if preset.is_default {
            for p in state.presets.values_mut() {
                p.is_default = false;
            }
        }
        state.presets.insert(preset.id, preset.clone());
        Ok(preset)
    }

    fn delete_preset(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.presets.remove(&id).ok_or_else(|| not_found("preset", id))?;
        Ok(())
    }

    fn default_preset(&self) -> Result<Option<Preset>> {
        let state = self.state.lock().unwrap();
        Ok(state.presets.values().find(|p| p.is_default).cloned())
    }

    fn get_settings(&self) -> Result<Settings> {
        let mut state = self.state.lock().unwrap();
        Ok(state.settings.get_or_insert_with(Settings::default).clone())
    }

    fn update_settings(&self, settings: Settings) -> Result<Settings> {
        let mut state = self.state.lock().unwrap();
        state.settings = Some(settings.clone());
        Ok(settings)
    }

    fn list_history(&self, story_id: Uuid) -> Result<Vec<HistoryEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.history.get(&story_id).cloned().unwrap_or_default())
    }

    fn insert_history_entry(&self, mut entry: HistoryEntry) -> Result<HistoryEntry> {
        let mut state = self.state.lock().unwrap();
        state.next_entry_id += 1;
        entry.id = state.next_entry_id;
        state.history.entry(entry.story_id).or_default().push(entry.clone());
        Ok(entry)
    }

    fn delete_history_after(&self, story_id: Uuid, entry_id: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(entries) = state.history.get_mut(&story_id) {
            entries.retain(|e| e.id <= entry_id);
        }
        Ok(())
    }

    fn prune_history(&self, story_id: Uuid, keep: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(entries) = state.history.get_mut(&story_id) {
            entries.sort_by_key(|e| e.id);
            if entries.len() > keep {
                let excess = entries.len() - keep;
                entries.drain(0..excess);
            }
        }
        Ok(())
    }

    fn get_history_position(&self, story_id: Uuid) -> Result<Option<HistoryPosition>> {
        let state = self.state.lock().unwrap();
        Ok(state.history_positions.get(&story_id).copied())
    }

    fn set_history_position(&self, position: HistoryPosition) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.history_positions.insert(position.story_id, position);
        Ok(())
    }
}
