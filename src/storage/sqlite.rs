//! `rusqlite`-backed `Storage` implementation. Nested structures
//! (`CharacterData`, lorebook settings, preset configuration) are kept
//! as JSON text columns — the SQL dialect itself is not load-bearing,
//! so only the columns needed for invariants and joins are broken out
//! relationally.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::model::*;
use crate::error::{Error, Result};
use crate::storage::Storage;

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Internal(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        let storage = Self { conn: Mutex::new(conn) };
        storage.migrate()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn: Mutex::new(conn) };
        storage.migrate()?;
        Ok(storage)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS stories (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                content TEXT NOT NULL,
                created TEXT NOT NULL,
                modified TEXT NOT NULL,
                persona_character_id TEXT,
                config_preset_id TEXT,
                needs_rewrite_prompt INTEGER NOT NULL,
                word_count INTEGER NOT NULL,
                avatar_windows TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS characters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                image BLOB,
                thumbnail BLOB
            );
            CREATE TABLE IF NOT EXISTS lorebooks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                scan_depth INTEGER,
                token_budget INTEGER,
                recursive_scanning INTEGER NOT NULL,
                extensions TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS lorebook_entries (
                lorebook_id TEXT NOT NULL,
                entry_id INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (lorebook_id, entry_id)
            );
            CREATE TABLE IF NOT EXISTS presets (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                is_default INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS story_characters (
                story_id TEXT NOT NULL,
                character_id TEXT NOT NULL,
                PRIMARY KEY (story_id, character_id)
            );
            CREATE TABLE IF NOT EXISTS story_lorebooks (
                story_id TEXT NOT NULL,
                lorebook_id TEXT NOT NULL,
                PRIMARY KEY (story_id, lorebook_id)
            );
            CREATE TABLE IF NOT EXISTS history_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                story_id TEXT NOT NULL,
                content TEXT NOT NULL,
                word_count INTEGER NOT NULL,
                created TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS history_positions (
                story_id TEXT PRIMARY KEY,
                history_entry_id INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

fn parse_uuid(s: String) -> Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| Error::Internal(e.to_string()))
}

fn not_found(what: &str, id: Uuid) -> Error {
    Error::NotFound(format!("{what} {id} not found"))
}

fn row_to_story(row: &rusqlite::Row) -> rusqlite::Result<Story> {
    let id: String = row.get(0)?;
    let persona: Option<String> = row.get(6)?;
    let preset: Option<String> = row.get(7)?;
    let avatar_windows: String = row.get(10)?;
    Ok(Story {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        title: row.get(1)?,
        description: row.get(2)?,
        content: row.get(3)?,
        created: row.get::<_, String>(4)?.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        modified: row.get::<_, String>(5)?.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        persona_character_id: persona.and_then(|s| Uuid::parse_str(&s).ok()),
        config_preset_id: preset.and_then(|s| Uuid::parse_str(&s).ok()),
        needs_rewrite_prompt: row.get::<_, i64>(8)? != 0,
        word_count: row.get::<_, i64>(9)? as u32,
        avatar_windows: serde_json::from_str(&avatar_windows).unwrap_or(serde_json::Value::Null),
    })
}

const STORY_COLUMNS: &str = "id, title, description, content, created, modified, \
    persona_character_id, config_preset_id, needs_rewrite_prompt, word_count, avatar_windows";

impl Storage for SqliteStorage {
    fn create_story(&self, story: Story) -> Result<Story> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO stories (id, title, description, content, created, modified, \
             persona_character_id, config_preset_id, needs_rewrite_prompt, word_count, avatar_windows) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                story.id.to_string(),
                story.title,
                story.description,
                story.content,
                story.created.to_rfc3339(),
                story.modified.to_rfc3339(),
                story.persona_character_id.map(|u| u.to_string()),
                story.config_preset_id.map(|u| u.to_string()),
                story.needs_rewrite_prompt as i64,
                story.word_count as i64,
                serde_json::to_string(&story.avatar_windows)?,
            ],
        )?;
        Ok(story)
    }

    fn get_story(&self, id: Uuid) -> Result<Story> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {STORY_COLUMNS} FROM stories WHERE id = ?1"),
            params![id.to_string()],
            row_to_story,
        )
        .optional()?
        .ok_or_else(|| not_found("story", id))
    }

    fn list_stories(&self) -> Result<Vec<Story>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT {STORY_COLUMNS} FROM stories"))?;
        let rows = stmt.query_map([], row_to_story)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn update_story_content(&self, id: Uuid, content: String) -> Result<Story> {
        let conn = self.conn.lock().unwrap();
        let word_count = count_words(&content);
        let modified = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE stories SET content = ?1, word_count = ?2, modified = ?3 WHERE id = ?4",
            params![content, word_count as i64, modified, id.to_string()],
        )?;
        if updated == 0 {
            return Err(not_found("story", id));
        }
        drop(conn);
        self.get_story(id)
    }

    fn update_story_metadata(&self, story: Story) -> Result<Story> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE stories SET title = ?1, description = ?2, persona_character_id = ?3, \
             config_preset_id = ?4, needs_rewrite_prompt = ?5, avatar_windows = ?6, modified = ?7 \
             WHERE id = ?8",
            params![
                story.title,
                story.description,
                story.persona_character_id.map(|u| u.to_string()),
                story.config_preset_id.map(|u| u.to_string()),
                story.needs_rewrite_prompt as i64,
                serde_json::to_string(&story.avatar_windows)?,
                Utc::now().to_rfc3339(),
                story.id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(not_found("story", story.id));
        }
        drop(conn);
        self.get_story(story.id)
    }

    fn delete_story(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM stories WHERE id = ?1", params![id.to_string()])?;
        if deleted == 0 {
            return Err(not_found("story", id));
        }
        tx.execute("DELETE FROM story_characters WHERE story_id = ?1", params![id.to_string()])?;
        tx.execute("DELETE FROM story_lorebooks WHERE story_id = ?1", params![id.to_string()])?;
        tx.execute("DELETE FROM history_entries WHERE story_id = ?1", params![id.to_string()])?;
        tx.execute("DELETE FROM history_positions WHERE story_id = ?1", params![id.to_string()])?;
        tx.commit()?;
        Ok(())
    }

    fn add_story_character(&self, story_id: Uuid, character_id: Uuid) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO story_characters (story_id, character_id) VALUES (?1, ?2)",
            params![story_id.to_string(), character_id.to_string()],
        )?;
        retitle_story(&tx, story_id)?;
        tx.commit()?;
        Ok(())
    }

    fn remove_story_character(&self, story_id: Uuid, character_id: Uuid) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM story_characters WHERE story_id = ?1 AND character_id = ?2",
            params![story_id.to_string(), character_id.to_string()],
        )?;
        tx.execute(
            "UPDATE stories SET persona_character_id = NULL \
             WHERE id = ?1 AND persona_character_id = ?2",
            params![story_id.to_string(), character_id.to_string()],
        )?;
        retitle_story(&tx, story_id)?;
        tx.commit()?;
        Ok(())
    }

    fn list_story_characters(&self, story_id: Uuid) -> Result<Vec<Character>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, c.data, c.image, c.thumbnail FROM characters c \
             JOIN story_characters sc ON sc.character_id = c.id WHERE sc.story_id = ?1",
        )?;
        let rows = stmt.query_map(params![story_id.to_string()], row_to_character)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn add_story_lorebook(&self, story_id: Uuid, lorebook_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO story_lorebooks (story_id, lorebook_id) VALUES (?1, ?2)",
            params![story_id.to_string(), lorebook_id.to_string()],
        )?;
        Ok(())
    }

    fn remove_story_lorebook(&self, story_id: Uuid, lorebook_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM story_lorebooks WHERE story_id = ?1 AND lorebook_id = ?2",
            params![story_id.to_string(), lorebook_id.to_string()],
        )?;
        Ok(())
    }

    fn list_story_lorebooks(&self, story_id: Uuid) -> Result<Vec<Lorebook>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT lorebook_id FROM story_lorebooks WHERE story_id = ?1",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![story_id.to_string()], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);
        ids.into_iter()
            .map(|id| self.get_lorebook(parse_uuid(id)?))
            .collect()
    }

    fn create_character(&self, character: Character) -> Result<Character> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO characters (id, name, data, image, thumbnail) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                character.id.to_string(),
                character.name,
                serde_json::to_string(&character.data)?,
                character.image,
                character.thumbnail,
            ],
        )?;
        Ok(character)
    }

    fn get_character(&self, id: Uuid) -> Result<Character> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, data, image, thumbnail FROM characters WHERE id = ?1",
            params![id.to_string()],
            row_to_character,
        )
        .optional()?
        .ok_or_else(|| not_found("character", id))
    }

    fn list_characters(&self) -> Result<Vec<Character>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name, data, image, thumbnail FROM characters")?;
        let rows = stmt.query_map([], row_to_character)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn update_character(&self, character: Character) -> Result<Character> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE characters SET name = ?1, data = ?2, image = ?3, thumbnail = ?4 WHERE id = ?5",
            params![
                character.name,
                serde_json::to_string(&character.data)?,
                character.image,
                character.thumbnail,
                character.id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(not_found("character", character.id));
        }
        Ok(character)
    }

    fn delete_character(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM characters WHERE id = ?1", params![id.to_string()])?;
        if deleted == 0 {
            return Err(not_found("character", id));
        }
        tx.execute(
            "DELETE FROM story_characters WHERE character_id = ?1",
            params![id.to_string()],
        )?;
        tx.execute(
            "UPDATE stories SET persona_character_id = NULL WHERE persona_character_id = ?1",
            params![id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn create_lorebook(&self, lorebook: Lorebook) -> Result<Lorebook> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        insert_lorebook(&tx, &lorebook)?;
        tx.commit()?;
        Ok(lorebook)
    }

    fn get_lorebook(&self, id: Uuid) -> Result<Lorebook> {
        let conn = self.conn.lock().unwrap();
        let (name, description, scan_depth, token_budget, recursive_scanning, extensions): (
            String,
            String,
            Option<i64>,
            Option<i64>,
            i64,
            String,
        ) = conn
            .query_row(
                "SELECT name, description, scan_depth, token_budget, recursive_scanning, extensions \
                 FROM lorebooks WHERE id = ?1",
                params![id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
            )
            .optional()?
            .ok_or_else(|| not_found("lorebook", id))?;

        let mut stmt = conn.prepare(
            "SELECT data FROM lorebook_entries WHERE lorebook_id = ?1 ORDER BY entry_id",
        )?;
        let entries: Vec<LorebookEntry> = stmt
            .query_map(params![id.to_string()], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|s| serde_json::from_str(&s))
            .collect::<serde_json::Result<Vec<_>>>()?;

        Ok(Lorebook {
            id,
            name,
            description,
            scan_depth: scan_depth.map(|v| v as i32),
            token_budget: token_budget.map(|v| v as i32),
            recursive_scanning: recursive_scanning != 0,
            extensions: serde_json::from_str(&extensions)?,
            entries,
        })
    }

    fn list_lorebooks(&self) -> Result<Vec<Lorebook>> {
        let ids: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT id FROM lorebooks")?;
            stmt.query_map([], |r| r.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?
        };
        ids.into_iter().map(|id| self.get_lorebook(parse_uuid(id)?)).collect()
    }

    fn save_lorebook(&self, mut lorebook: Lorebook) -> Result<Lorebook> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM lorebooks WHERE id = ?1",
            params![lorebook.id.to_string()],
            |r| r.get(0),
        )?;
        if exists == 0 {
            return Err(not_found("lorebook", lorebook.id));
        }
        tx.execute(
            "UPDATE lorebooks SET name = ?1, description = ?2, scan_depth = ?3, token_budget = ?4, \
             recursive_scanning = ?5, extensions = ?6 WHERE id = ?7",
            params![
                lorebook.name,
                lorebook.description,
                lorebook.scan_depth,
                lorebook.token_budget,
                lorebook.recursive_scanning as i64,
                serde_json::to_string(&lorebook.extensions)?,
                lorebook.id.to_string(),
            ],
        )?;
        // delete-all-then-reinsert: ids reassigned on every save.
        tx.execute(
            "DELETE FROM lorebook_entries WHERE lorebook_id = ?1",
            params![lorebook.id.to_string()],
        )?;
        for (i, entry) in lorebook.entries.iter_mut().enumerate() {
            entry.id = i as i64 + 1;
            tx.execute(
                "INSERT INTO lorebook_entries (lorebook_id, entry_id, data) VALUES (?1, ?2, ?3)",
                params![lorebook.id.to_string(), entry.id, serde_json::to_string(entry)?],
            )?;
        }
        tx.commit()?;
        Ok(lorebook)
    }

    fn delete_lorebook(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM lorebooks WHERE id = ?1", params![id.to_string()])?;
        if deleted == 0 {
            return Err(not_found("lorebook", id));
        }
        tx.execute("DELETE FROM lorebook_entries WHERE lorebook_id = ?1", params![id.to_string()])?;
        tx.execute("DELETE FROM story_lorebooks WHERE lorebook_id = ?1", params![id.to_string()])?;
        tx.commit()?;
        Ok(())
    }

    fn create_preset(&self, preset: Preset) -> Result<Preset> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        if preset.is_default {
            tx.execute("UPDATE presets SET is_default = 0", [])?;
        }
        tx.execute(
            "INSERT INTO presets (id, name, is_default, data) VALUES (?1, ?2, ?3, ?4)",
            params![preset.id.to_string(), preset.name, preset.is_default as i64, serde_json::to_string(&preset)?],
        )?;
        tx.commit()?;
        Ok(preset)
    }

    fn get_preset(&self, id: Uuid) -> Result<Preset> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT data FROM presets WHERE id = ?1",
            params![id.to_string()],
            |r| r.get::<_, String>(0),
        )
        .optional()?
        .ok_or_else(|| not_found("preset", id))
        .and_then(|s| serde_json::from_str(&s).map_err(Error::from))
    }

    fn list_presets(&self) -> Result<Vec<Preset>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM presets")?;
        let rows: Vec<String> = stmt.query_map([], |r| r.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter().map(|s| serde_json::from_str(s).map_err(Error::from)).collect()
    }

    fn save_preset(&self, preset: Preset) -> Result<Preset> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM presets WHERE id = ?1",
            params![preset.id.to_string()],
            |r| r.get(0),
        )?;
        if exists == 0 {
            return Err(not_found("preset", preset.id));
        }
        if preset.is_default {
            tx.execute("UPDATE presets SET is_default = 0", [])?;
        }
        tx.execute(
            "UPDATE presets SET name = ?1, is_default = ?2, data = ?3 WHERE id = ?4",
            params![preset.name, preset.is_default as i64, serde_json::to_string(&preset)?, preset.id.to_string()],
        )?;
        tx.commit()?;
        Ok(preset)
    }

    fn delete_preset(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM presets WHERE id = ?1", params![id.to_string()])?;
        if deleted == 0 {
            return Err(not_found("preset", id));
        }
        Ok(())
    }

    fn default_preset(&self) -> Result<Option<Preset>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT data FROM presets WHERE is_default = 1 LIMIT 1",
            [],
            |r| r.get::<_, String>(0),
        )
        .optional()?
        .map(|s| serde_json::from_str(&s).map_err(Error::from))
        .transpose()
    }

    fn get_settings(&self) -> Result<Settings> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row("SELECT data FROM settings WHERE id = 0", [], |r| r.get(0))
            .optional()?;
        match existing {
            Some(s) => Ok(serde_json::from_str(&s)?),
            None => {
                let defaults = Settings::default();
                conn.execute(
                    "INSERT INTO settings (id, data) VALUES (0, ?1)",
                    params![serde_json::to_string(&defaults)?],
                )?;
                Ok(defaults)
            }
        }
    }

    fn update_settings(&self, settings: Settings) -> Result<Settings> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (id, data) VALUES (0, ?1) \
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            params![serde_json::to_string(&settings)?],
        )?;
        Ok(settings)
    }

    fn list_history(&self, story_id: Uuid) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, story_id, content, word_count, created FROM history_entries \
             WHERE story_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![story_id.to_string()], row_to_history_entry)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn insert_history_entry(&self, entry: HistoryEntry) -> Result<HistoryEntry> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO history_entries (story_id, content, word_count, created) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.story_id.to_string(),
                entry.content,
                entry.word_count as i64,
                entry.created.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(HistoryEntry { id, ..entry })
    }

    fn delete_history_after(&self, story_id: Uuid, entry_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM history_entries WHERE story_id = ?1 AND id > ?2",
            params![story_id.to_string(), entry_id],
        )?;
        Ok(())
    }

    fn prune_history(&self, story_id: Uuid, keep: usize) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM history_entries WHERE story_id = ?1 AND id NOT IN \
             (SELECT id FROM history_entries WHERE story_id = ?1 ORDER BY id DESC LIMIT ?2)",
            params![story_id.to_string(), keep as i64],
        )?;
        Ok(())
    }

    fn get_history_position(&self, story_id: Uuid) -> Result<Option<HistoryPosition>> {
        let conn = self.conn.lock().unwrap();
        let entry_id: Option<i64> = conn
            .query_row(
                "SELECT history_entry_id FROM history_positions WHERE story_id = ?1",
                params![story_id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(entry_id.map(|history_entry_id| HistoryPosition { story_id, history_entry_id }))
    }

    fn set_history_position(&self, position: HistoryPosition) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO history_positions (story_id, history_entry_id) VALUES (?1, ?2) \
             ON CONFLICT(story_id) DO UPDATE SET history_entry_id = excluded.history_entry_id",
            params![position.story_id.to_string(), position.history_entry_id],
        )?;
        Ok(())
    }
}

/// Recomputes a story's auto-managed title (S4) from its currently
/// attached characters, if the title hasn't been customized.
fn retitle_story(tx: &rusqlite::Transaction, story_id: Uuid) -> Result<()> {
    let title: Option<String> = tx
        .query_row("SELECT title FROM stories WHERE id = ?1", params![story_id.to_string()], |r| r.get(0))
        .optional()?;
    let Some(title) = title else { return Ok(()) };
    if !is_auto_title(&title) {
        return Ok(());
    }

    let mut stmt = tx.prepare(
        "SELECT c.name FROM characters c \
         JOIN story_characters sc ON sc.character_id = c.id WHERE sc.story_id = ?1",
    )?;
    let names: Vec<String> =
        stmt.query_map(params![story_id.to_string()], |r| r.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let new_title = auto_title(&names);
    if new_title != title {
        tx.execute(
            "UPDATE stories SET title = ?1 WHERE id = ?2",
            params![new_title, story_id.to_string()],
        )?;
    }
    Ok(())
}

fn insert_lorebook(tx: &rusqlite::Transaction, lorebook: &Lorebook) -> Result<()> {
    tx.execute(
        "INSERT INTO lorebooks (id, name, description, scan_depth, token_budget, \
         recursive_scanning, extensions) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            lorebook.id.to_string(),
            lorebook.name,
            lorebook.description,
            lorebook.scan_depth,
            lorebook.token_budget,
            lorebook.recursive_scanning as i64,
            serde_json::to_string(&lorebook.extensions)?,
        ],
    )?;
    for entry in &lorebook.entries {
        tx.execute(
            "INSERT INTO lorebook_entries (lorebook_id, entry_id, data) VALUES (?1, ?2, ?3)",
            params![lorebook.id.to_string(), entry.id, serde_json::to_string(entry)?],
        )?;
    }
    Ok(())
}

fn row_to_character(row: &rusqlite::Row) -> rusqlite::Result<Character> {
    let id: String = row.get(0)?;
    let data: String = row.get(2)?;
    Ok(Character {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        name: row.get(1)?,
        data: serde_json::from_str(&data).unwrap_or_else(|_| CharacterData {
            name: String::new(),
            description: String::new(),
            personality: String::new(),
            scenario: String::new(),
            first_mes: String::new(),
            mes_example: String::new(),
            creator_notes: String::new(),
            system_prompt: String::new(),
            post_history_instructions: String::new(),
            alternate_greetings: Vec::new(),
            tags: Vec::new(),
            creator: String::new(),
            character_version: String::new(),
            extensions: Extensions::new(),
            character_book: None,
        }),
        image: row.get(3)?,
        thumbnail: row.get(4)?,
    })
}

fn row_to_history_entry(row: &rusqlite::Row) -> rusqlite::Result<HistoryEntry> {
    let story_id: String = row.get(1)?;
    Ok(HistoryEntry {
        id: row.get(0)?,
        story_id: Uuid::parse_str(&story_id).unwrap_or_default(),
        content: row.get(2)?,
        word_count: row.get::<_, i64>(3)? as u32,
        created: row.get::<_, String>(4)?.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_fetch_story_round_trips() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let story = Story::new("T".to_string(), "".to_string());
        let id = story.id;
        storage.create_story(story).unwrap();
        let fetched = storage.get_story(id).unwrap();
        assert_eq!(fetched.title, "T");
    }

    #[test]
    fn deleting_character_clears_persona_reference() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut story = Story::new("T".to_string(), "".to_string());
        let character = Character {
            id: Uuid::new_v4(),
            name: "Alice".to_string(),
            data: CharacterData {
                name: "Alice".to_string(),
                description: String::new(),
                personality: String::new(),
                scenario: String::new(),
                first_mes: String::new(),
                mes_example: String::new(),
                creator_notes: String::new(),
                system_prompt: String::new(),
                post_history_instructions: String::new(),
                alternate_greetings: Vec::new(),
                tags: Vec::new(),
                creator: String::new(),
                character_version: String::new(),
                extensions: Extensions::new(),
                character_book: None,
            },
            image: None,
            thumbnail: None,
        };
        story.persona_character_id = Some(character.id);
        let story_id = story.id;
        storage.create_story(story.clone()).unwrap();
        storage.update_story_metadata(story).unwrap();
        storage.create_character(character.clone()).unwrap();
        storage.delete_character(character.id).unwrap();
        let fetched = storage.get_story(story_id).unwrap();
        assert_eq!(fetched.persona_character_id, None);
    }

    #[test]
    fn lorebook_save_reassigns_entry_ids() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut lorebook = Lorebook::new("Test".to_string(), String::new());
        lorebook.entries.push(LorebookEntry {
            keys: vec!["dragon".to_string()],
            content: "Dragons breathe fire".to_string(),
            ..Default::default()
        });
        let id = lorebook.id;
        storage.create_lorebook(lorebook).unwrap();
        let mut fetched = storage.get_lorebook(id).unwrap();
        assert_eq!(fetched.entries[0].id, 0);
        fetched.entries.push(LorebookEntry {
            keys: vec!["wyrm".to_string()],
            content: "Small dragons".to_string(),
            ..Default::default()
        });
        let saved = storage.save_lorebook(fetched).unwrap();
        assert_eq!(saved.entries[0].id, 1);
        assert_eq!(saved.entries[1].id, 2);
    }

    #[test]
    fn attaching_characters_auto_renames_an_untitled_story() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let story = Story::new(UNTITLED_STORY.to_string(), String::new());
        let story_id = story.id;
        storage.create_story(story).unwrap();
        let alice = test_character("Alice");
        let bob = test_character("Bob");
        storage.create_character(alice.clone()).unwrap();
        storage.create_character(bob.clone()).unwrap();

        storage.add_story_character(story_id, alice.id).unwrap();
        assert_eq!(storage.get_story(story_id).unwrap().title, "A Story with Alice");

        storage.add_story_character(story_id, bob.id).unwrap();
        assert_eq!(storage.get_story(story_id).unwrap().title, "A Story with Alice and Bob");

        storage.remove_story_character(story_id, alice.id).unwrap();
        assert_eq!(storage.get_story(story_id).unwrap().title, "A Story with Bob");

        storage.remove_story_character(story_id, bob.id).unwrap();
        assert_eq!(storage.get_story(story_id).unwrap().title, UNTITLED_STORY);
    }

    #[test]
    fn custom_titled_story_is_never_auto_renamed() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let story = Story::new("My Custom Adventure".to_string(), String::new());
        let story_id = story.id;
        storage.create_story(story).unwrap();
        let alice = test_character("Alice");
        storage.create_character(alice.clone()).unwrap();

        storage.add_story_character(story_id, alice.id).unwrap();
        assert_eq!(storage.get_story(story_id).unwrap().title, "My Custom Adventure");
    }

    fn test_character(name: &str) -> Character {
        Character {
            id: Uuid::new_v4(),
            name: name.to_string(),
            data: CharacterData {
                name: name.to_string(),
                description: String::new(),
                personality: String::new(),
                scenario: String::new(),
                first_mes: String::new(),
                mes_example: String::new(),
                creator_notes: String::new(),
                system_prompt: String::new(),
                post_history_instructions: String::new(),
                alternate_greetings: Vec::new(),
                tags: Vec::new(),
                creator: String::new(),
                character_version: String::new(),
                extensions: Extensions::new(),
                character_book: None,
            },
            image: None,
            thumbnail: None,
        }
    }

    #[test]
    fn only_one_preset_may_be_default() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let preset_a = test_preset("A", true);
        let preset_b = test_preset("B", true);
        storage.create_preset(preset_a.clone()).unwrap();
        storage.create_preset(preset_b.clone()).unwrap();
        let fetched_a = storage.get_preset(preset_a.id).unwrap();
        let fetched_b = storage.get_preset(preset_b.id).unwrap();
        assert!(!fetched_a.is_default);
        assert!(fetched_b.is_default);
    }

    fn test_preset(name: &str, is_default: bool) -> Preset {
        Preset {
            id: Uuid::new_v4(),
            name: name.to_string(),
            provider: ProviderKind::OpenAi,
            api_config: ApiConfig::default(),
            generation_settings: GenerationSettings::default(),
            lorebook_settings: LorebookSettings::default(),
            prompt_templates: PromptTemplates::default(),
            is_default,
        }
    }
}
