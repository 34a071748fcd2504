use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form, opaque metadata. Round-tripped untouched through
/// save/load; the engine never interprets its contents.
pub type Extensions = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub content: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub persona_character_id: Option<Uuid>,
    pub config_preset_id: Option<Uuid>,
    pub needs_rewrite_prompt: bool,
    pub word_count: u32,
    pub avatar_windows: serde_json::Value,
}

impl Story {
    pub fn new(title: String, description: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title,
            description,
            content: String::new(),
            created: now,
            modified: now,
            persona_character_id: None,
            config_preset_id: None,
            needs_rewrite_prompt: false,
            word_count: 0,
            avatar_windows: serde_json::Value::Null,
        }
    }
}

/// Default title for a story with no attached characters.
pub const UNTITLED_STORY: &str = "Untitled Story";

/// Formats the auto-managed title for a story's attached character
/// names: `"A Story with Alice"`, `"A Story with Alice and Bob"`,
/// `"A Story with Alice, Bob, and Carol"` as more attach, reverting to
/// [`UNTITLED_STORY`] once none are left.
pub fn auto_title(names: &[String]) -> String {
    match names {
        [] => UNTITLED_STORY.to_string(),
        [one] => format!("A Story with {one}"),
        [first, second] => format!("A Story with {first} and {second}"),
        [rest @ .., last] => format!("A Story with {}, and {last}", rest.join(", ")),
    }
}

/// Whether `title` is one this crate generates itself and is therefore
/// safe to keep auto-updating as characters attach/detach. Any other
/// title is a user customization and is left alone.
pub fn is_auto_title(title: &str) -> bool {
    title == UNTITLED_STORY || title.starts_with("A Story with ")
}

/// Count words the way a human skimming a word-processor status bar
/// would: whitespace-delimited tokens.
pub fn count_words(content: &str) -> u32 {
    content.split_whitespace().count() as u32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: Uuid,
    pub name: String,
    pub data: CharacterData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Vec<u8>>,
}

/// Core character properties, Character Card V2 spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterData {
    pub name: String,
    pub description: String,
    pub personality: String,
    pub scenario: String,
    pub first_mes: String,
    pub mes_example: String,
    #[serde(default)]
    pub creator_notes: String,
    pub system_prompt: String,
    pub post_history_instructions: String,
    pub alternate_greetings: Vec<String>,
    pub tags: Vec<String>,
    pub creator: String,
    pub character_version: String,
    pub extensions: Extensions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_book: Option<CharacterBook>,
}

impl CharacterData {
    /// The `ursceal_lorebook_id` extension key, if present and shaped
    /// like a UUID string.
    pub fn linked_lorebook_id(&self) -> Option<Uuid> {
        self.extensions
            .get("ursceal_lorebook_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterBook {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_depth: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursive_scanning: Option<bool>,
    #[serde(default)]
    pub extensions: Extensions,
    pub entries: Vec<LorebookEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lorebook {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub scan_depth: Option<i32>,
    pub token_budget: Option<i32>,
    pub recursive_scanning: bool,
    pub extensions: Extensions,
    pub entries: Vec<LorebookEntry>,
}

impl Lorebook {
    pub fn new(name: String, description: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            description,
            scan_depth: None,
            token_budget: None,
            recursive_scanning: false,
            extensions: Extensions::new(),
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SelectiveLogic {
    AndAny = 0,
    NotAll = 1,
    NotAny = 2,
    AndAll = 3,
}

impl Default for SelectiveLogic {
    fn default() -> Self {
        SelectiveLogic::AndAny
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    BeforeChar,
    AfterChar,
    AuthorNoteBefore,
    AuthorNoteAfter,
    AtDepth,
}

impl Position {
    /// Ordering rank used when sorting activated entries: entries are
    /// grouped by position before any other tie-break.
    pub fn rank(self) -> u8 {
        match self {
            Position::BeforeChar => 0,
            Position::AfterChar => 1,
            Position::AuthorNoteBefore => 2,
            Position::AuthorNoteAfter => 3,
            Position::AtDepth => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LorebookEntry {
    pub id: i64,
    pub keys: Vec<String>,
    #[serde(default)]
    pub secondary_keys: Vec<String>,
    pub content: String,
    #[serde(default)]
    pub comment: String,
    pub enabled: bool,
    #[serde(default)]
    pub constant: bool,
    #[serde(default)]
    pub selective: bool,
    #[serde(default)]
    pub selective_logic: SelectiveLogic,
    pub insertion_order: i32,
    pub position: Position,
    #[serde(default)]
    pub depth: i32,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub match_whole_words: bool,
    #[serde(default)]
    pub use_regex: bool,
    #[serde(default = "default_probability")]
    pub probability: u8,
    #[serde(default)]
    pub use_probability: bool,
    #[serde(default)]
    pub scan_depth: Option<i32>,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub prevent_recursion: bool,
    #[serde(default)]
    pub delay_until_recursion: bool,
    #[serde(default)]
    pub display_index: i32,
    #[serde(default)]
    pub extensions: Extensions,
}

fn default_probability() -> u8 {
    100
}

impl Default for LorebookEntry {
    fn default() -> Self {
        Self {
            id: 0,
            keys: Vec::new(),
            secondary_keys: Vec::new(),
            content: String::new(),
            comment: String::new(),
            enabled: true,
            constant: false,
            selective: false,
            selective_logic: SelectiveLogic::AndAny,
            insertion_order: 0,
            position: Position::BeforeChar,
            depth: 0,
            case_sensitive: false,
            match_whole_words: false,
            use_regex: false,
            probability: 100,
            use_probability: false,
            scan_depth: None,
            group: String::new(),
            prevent_recursion: false,
            delay_until_recursion: false,
            display_index: 0,
            extensions: Extensions::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    DeepSeek,
    OpenRouter,
    Anthropic,
    Horde,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub worker_filters: WorkerFilters,
    /// OpenRouter-only provider preference list, sent as
    /// `X-OpenRouter-Provider`. Empty means no preference.
    #[serde(default)]
    pub openrouter_provider_preference: Vec<String>,
    #[serde(default, flatten)]
    pub extra: Extensions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerFilters {
    #[serde(default)]
    pub workers: Vec<String>,
    #[serde(default)]
    pub trusted_workers: bool,
    #[serde(default)]
    pub slow_workers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub max_context_tokens: u32,
    pub temperature: f32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub include_dialogue_examples: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: 300,
            max_context_tokens: 4096,
            temperature: 0.8,
            top_p: None,
            top_k: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop_sequences: Vec::new(),
            include_dialogue_examples: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LorebookSettings {
    pub scan_depth: i32,
    pub token_budget: i32,
    pub recursion_depth: i32,
    pub enable_recursion: bool,
}

impl Default for LorebookSettings {
    fn default() -> Self {
        Self {
            scan_depth: 1000,
            token_budget: 500,
            recursion_depth: 3,
            enable_recursion: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptTemplates {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub continue_instruction: Option<String>,
    #[serde(default)]
    pub character_instruction: Option<String>,
    #[serde(default)]
    pub custom_instruction: Option<String>,
    #[serde(default)]
    pub rewrite_instruction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub id: Uuid,
    pub name: String,
    pub provider: ProviderKind,
    pub api_config: ApiConfig,
    pub generation_settings: GenerationSettings,
    pub lorebook_settings: LorebookSettings,
    pub prompt_templates: PromptTemplates,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub show_reasoning: bool,
    pub auto_save: bool,
    pub show_prompt: bool,
    pub third_person: bool,
    pub filter_asterisks: bool,
    pub include_dialogue_examples: bool,
    pub lorebook_settings: LorebookSettings,
    pub default_persona_id: Option<Uuid>,
    pub default_preset_id: Option<Uuid>,
    pub onboarding_completed: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            show_reasoning: false,
            auto_save: true,
            show_prompt: false,
            third_person: false,
            filter_asterisks: false,
            include_dialogue_examples: false,
            lorebook_settings: LorebookSettings::default(),
            default_persona_id: None,
            default_preset_id: None,
            onboarding_completed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub story_id: Uuid,
    pub content: String,
    pub word_count: u32,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistoryPosition {
    pub story_id: Uuid,
    pub history_entry_id: i64,
}

pub const MAX_HISTORY: usize = 50;
