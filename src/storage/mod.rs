//! The storage service: CRUD for stories, characters, lorebooks,
//! presets, settings, and history, plus the join tables between
//! stories/characters/lorebooks. Treated as an opaque collaborator by
//! the rest of the crate — callers only see the `Storage` trait.

pub mod memory;
pub mod model;
pub mod sqlite;

use uuid::Uuid;

use crate::error::Result;
pub use model::*;

/// Enumerated storage operations. Both backends (`memory::MemoryStorage`
/// for tests, `sqlite::SqliteStorage` for the running server) implement
/// the same invariants (I1–I6).
pub trait Storage: Send + Sync {
    // --- stories ---
    fn create_story(&self, story: Story) -> Result<Story>;
    fn get_story(&self, id: Uuid) -> Result<Story>;
    fn list_stories(&self) -> Result<Vec<Story>>;
    /// Recomputes `word_count` and `modified`; does not itself append to
    /// history (see `history::save_to_history`).
    fn update_story_content(&self, id: Uuid, content: String) -> Result<Story>;
    fn update_story_metadata(&self, story: Story) -> Result<Story>;
    fn delete_story(&self, id: Uuid) -> Result<()>;

    // --- story <-> character / lorebook joins ---
    fn add_story_character(&self, story_id: Uuid, character_id: Uuid) -> Result<()>;
    fn remove_story_character(&self, story_id: Uuid, character_id: Uuid) -> Result<()>;
    fn list_story_characters(&self, story_id: Uuid) -> Result<Vec<Character>>;
    fn add_story_lorebook(&self, story_id: Uuid, lorebook_id: Uuid) -> Result<()>;
    fn remove_story_lorebook(&self, story_id: Uuid, lorebook_id: Uuid) -> Result<()>;
    fn list_story_lorebooks(&self, story_id: Uuid) -> Result<Vec<Lorebook>>;

    // --- characters ---
    fn create_character(&self, character: Character) -> Result<Character>;
    fn get_character(&self, id: Uuid) -> Result<Character>;
    fn list_characters(&self) -> Result<Vec<Character>>;
    fn update_character(&self, character: Character) -> Result<Character>;
    /// Deletes the character, clears `persona_character_id` on any story
    /// pointing at it (I1/I7), and removes its story/character joins.
    fn delete_character(&self, id: Uuid) -> Result<()>;

    // --- lorebooks ---
    fn create_lorebook(&self, lorebook: Lorebook) -> Result<Lorebook>;
    fn get_lorebook(&self, id: Uuid) -> Result<Lorebook>;
    fn list_lorebooks(&self) -> Result<Vec<Lorebook>>;
    /// Replaces name/description/settings and entries in one
    /// transaction. Entries are saved delete-all-then-reinsert: ids are
    /// reassigned, callers must refetch after saving.
    fn save_lorebook(&self, lorebook: Lorebook) -> Result<Lorebook>;
    fn delete_lorebook(&self, id: Uuid) -> Result<()>;

    // --- presets ---
    fn create_preset(&self, preset: Preset) -> Result<Preset>;
    fn get_preset(&self, id: Uuid) -> Result<Preset>;
    fn list_presets(&self) -> Result<Vec<Preset>>;
    /// Saves the preset; if `is_default` is set, clears the flag on
    /// every other preset first (I6).
    fn save_preset(&self, preset: Preset) -> Result<Preset>;
    fn delete_preset(&self, id: Uuid) -> Result<()>;
    fn default_preset(&self) -> Result<Option<Preset>>;

    // --- settings (singleton) ---
    fn get_settings(&self) -> Result<Settings>;
    fn update_settings(&self, settings: Settings) -> Result<Settings>;

    // --- history ---
    fn list_history(&self, story_id: Uuid) -> Result<Vec<HistoryEntry>>;
    fn insert_history_entry(&self, entry: HistoryEntry) -> Result<HistoryEntry>;
    fn delete_history_after(&self, story_id: Uuid, entry_id: i64) -> Result<()>;
    fn prune_history(&self, story_id: Uuid, keep: usize) -> Result<()>;
    fn get_history_position(&self, story_id: Uuid) -> Result<Option<HistoryPosition>>;
    fn set_history_position(&self, position: HistoryPosition) -> Result<()>;
}
