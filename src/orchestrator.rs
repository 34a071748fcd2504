//! End-to-end generation flow: load story/preset/characters/lorebooks,
//! activate lorebook entries, build prompts, dispatch to the selected
//! provider, and bridge the stream to SSE records.

use futures::stream::{BoxStream, StreamExt};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::history;
use crate::lorebook::{self, ActivationSettings};
use crate::prompt::{self, GenerationType, PersonaInfo, PromptOptions};
use crate::provider::horde::{self, HordeProvider};
use crate::provider::{GenerationRequest, Provider};
use crate::sse;
use crate::storage::{CharacterData, Storage};

pub enum RequestType {
    Continue,
    Character { character_id: Uuid },
    Custom { instruction: String },
    RewriteThirdPerson,
}

pub struct GenerateRequest {
    pub story_id: Uuid,
    pub request_type: RequestType,
}

const CHARS_PER_TOKEN: usize = 4;

/// Runs the orchestrator flow and returns an SSE-encoded byte stream
/// ready to hand to the `axum` response body.
pub async fn generate(storage: &dyn Storage, request: GenerateRequest) -> Result<BoxStream<'static, String>> {
    let story = storage.get_story(request.story_id)?;

    let preset_id = story
        .config_preset_id
        .or(storage.get_settings()?.default_preset_id)
        .ok_or_else(|| Error::Validation("no preset configured for this story".to_string()))?;
    let preset = storage.get_preset(preset_id)?;

    let settings = storage.get_settings()?;
    let persona_id = story.persona_character_id.or(settings.default_persona_id);
    let persona_character = persona_id.and_then(|id| storage.get_character(id).ok());

    let story_characters = storage.list_story_characters(request.story_id)?;
    let profile_characters: Vec<_> = story_characters
        .iter()
        .filter(|c| Some(c.id) != persona_id)
        .collect();

    let mut lorebooks = storage.list_story_lorebooks(request.story_id)?;
    for character in &story_characters {
        if let Some(linked_id) = character.data.linked_lorebook_id()
            && !lorebooks.iter().any(|l| l.id == linked_id)
            && let Ok(linked) = storage.get_lorebook(linked_id)
        {
            lorebooks.push(linked);
        }
    }

    let scan_depth = preset.lorebook_settings.scan_depth;
    let tail_chars = (scan_depth.max(0) as usize) * CHARS_PER_TOKEN;
    let story_chars: Vec<char> = story.content.chars().collect();
    let tail: String = if story_chars.len() > tail_chars {
        story_chars[story_chars.len() - tail_chars..].iter().collect()
    } else {
        story.content.clone()
    };

    let entry_refs: Vec<_> = lorebooks.iter().flat_map(|l| l.entries.iter()).collect();
    let activation = ActivationSettings {
        scan_depth_tokens: preset.lorebook_settings.scan_depth,
        token_budget: preset.lorebook_settings.token_budget,
        recursion_depth: preset.lorebook_settings.recursion_depth,
        enable_recursion: preset.lorebook_settings.enable_recursion,
    };
    let injected = lorebook::activate(&entry_refs, &tail, &activation, None);

    let character_data: Vec<&CharacterData> = profile_characters.iter().map(|c| &c.data).collect();
    let persona_info = persona_character.as_ref().map(|c| PersonaInfo {
        name: &c.data.name,
        description: &c.data.description,
        writing_style: None,
    });
    let user_name = persona_character.as_ref().map(|c| c.data.name.as_str()).unwrap_or("User");

    let options = PromptOptions {
        third_person: settings.third_person,
        filter_asterisks: settings.filter_asterisks,
        show_prompt: settings.show_prompt,
    };
    let system_prompt = prompt::build_system_prompt(
        &character_data,
        &injected,
        persona_info.as_ref(),
        &preset.generation_settings,
        &options,
        preset.prompt_templates.system_prompt.as_deref(),
        user_name,
    );

    let target_character_name = match &request.request_type {
        RequestType::Character { character_id } => Some(storage.get_character(*character_id)?.data.name),
        _ => None,
    };
    let generation_type = match &request.request_type {
        RequestType::Continue => GenerationType::Continue,
        RequestType::Character { .. } => {
            GenerationType::Character { name: target_character_name.as_deref().unwrap() }
        }
        RequestType::Custom { instruction } => {
            if instruction.is_empty() {
                return Err(Error::Validation("custom instruction must not be empty".to_string()));
            }
            GenerationType::Custom { instruction }
        }
        RequestType::RewriteThirdPerson => GenerationType::RewriteThirdPerson,
    };
    let template_override = match &request.request_type {
        RequestType::Continue => preset.prompt_templates.continue_instruction.as_deref(),
        RequestType::Character { .. } => preset.prompt_templates.character_instruction.as_deref(),
        RequestType::Custom { .. } => preset.prompt_templates.custom_instruction.as_deref(),
        RequestType::RewriteThirdPerson => preset.prompt_templates.rewrite_instruction.as_deref(),
    };

    let provider = Provider::new(preset.provider, preset.api_config.clone());
    provider.validate_config().map_err(|e| Error::Validation(e.to_string()))?;
    let char_budget_override = match &provider {
        Provider::Horde(horde_provider) => {
            dynamic_horde_char_budget(horde_provider, preset.generation_settings.max_tokens).await
        }
        _ => None,
    };

    let system_prompt_tokens = system_prompt.len().div_ceil(CHARS_PER_TOKEN);
    let user_prompt = prompt::build_user_prompt(
        &story.content,
        &generation_type,
        system_prompt_tokens,
        preset.generation_settings.max_context_tokens as usize,
        preset.generation_settings.max_tokens as usize,
        template_override,
        char_budget_override,
    );

    history::save_to_history(storage, request.story_id, &story.content, story.word_count)?;

    let gen_settings = preset.generation_settings.clone();

    Ok(run_stream(provider, system_prompt, user_prompt, gen_settings).await)
}

/// §4.8 step 6: when the preset routes to horde, queries live model and
/// worker availability to derive a character budget for the story
/// window, instead of the generic token-based estimate. Falls back to
/// `None` (letting the caller use its default budget) if the horde
/// discovery endpoints are unreachable — a flaky model list shouldn't
/// block generation outright.
async fn dynamic_horde_char_budget(provider: &HordeProvider, max_tokens: u32) -> Option<usize> {
    let models = match provider.get_available_models().await {
        Ok(models) => models,
        Err(e) => {
            log::warn!("horde: failed to list models for context budgeting: {e}");
            return None;
        }
    };
    let selected = horde::auto_select_models(&models);

    let workers = match provider.get_worker_data().await {
        Ok(workers) => workers,
        Err(e) => {
            log::warn!("horde: failed to list workers for context budgeting: {e}");
            return None;
        }
    };

    horde::calculate_dynamic_context_limit(&workers, &selected, max_tokens)
        .map(|context_len| horde::max_chars_for_context(context_len, max_tokens))
}

async fn run_stream(
    provider: Provider,
    system_prompt: String,
    user_prompt: String,
    settings: crate::storage::GenerationSettings,
) -> BoxStream<'static, String> {
    let stream = async_stream::stream! {
        let request = GenerationRequest {
            system_prompt: &system_prompt,
            user_prompt: &user_prompt,
            settings: &settings,
        };
        if provider.capabilities().streaming {
            match provider.generate_streaming(request).await {
                Ok(mut chunks) => {
                    while let Some(result) = chunks.next().await {
                        yield match result {
                            Ok(chunk) => sse::encode_chunk(&chunk),
                            Err(e) => sse::encode_error(&e.to_string()),
                        };
                    }
                    yield sse::encode_done();
                }
                Err(e) => {
                    yield sse::encode_error(&e.to_string());
                    yield sse::encode_done();
                }
            }
        } else {
            match provider.generate(request).await {
                Ok(chunk) => {
                    yield sse::encode_chunk(&chunk);
                    yield sse::encode_done();
                }
                Err(e) => {
                    yield sse::encode_error(&e.to_string());
                    yield sse::encode_done();
                }
            }
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        ApiConfig, Character, GenerationSettings, Lorebook, LorebookEntry, LorebookSettings,
        Preset, PromptTemplates, ProviderKind, Story, memory::MemoryStorage,
    };

    fn character_data(name: &str) -> CharacterData {
        CharacterData {
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
            extensions: crate::storage::Extensions::new(),
            character_book: None,
        }
    }

    #[test]
    fn rejects_empty_custom_instruction() {
        let storage = MemoryStorage::new();
        let story = Story::new("T".to_string(), String::new());
        let story_id = story.id;
        storage.create_story(story).unwrap();
        let preset = Preset {
            id: Uuid::new_v4(),
            name: "p".to_string(),
            provider: ProviderKind::OpenAi,
            api_config: ApiConfig::default(),
            generation_settings: GenerationSettings::default(),
            lorebook_settings: LorebookSettings::default(),
            prompt_templates: PromptTemplates::default(),
            is_default: true,
        };
        storage.create_preset(preset.clone()).unwrap();
        let mut story = storage.get_story(story_id).unwrap();
        story.config_preset_id = Some(preset.id);
        storage.update_story_metadata(story).unwrap();

        let request = GenerateRequest {
            story_id,
            request_type: RequestType::Custom { instruction: String::new() },
        };
        let result = futures::executor::block_on(generate(&storage, request));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn fails_without_a_configured_preset() {
        let storage = MemoryStorage::new();
        let story = Story::new("T".to_string(), String::new());
        let story_id = story.id;
        storage.create_story(story).unwrap();
        let request = GenerateRequest { story_id, request_type: RequestType::Continue };
        let result = futures::executor::block_on(generate(&storage, request));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn persona_character_is_excluded_from_character_profiles() {
        let storage = MemoryStorage::new();
        let mut story = Story::new("T".to_string(), String::new());
        let persona = Character { id: Uuid::new_v4(), name: "User".to_string(), data: character_data("User"), image: None, thumbnail: None };
        let other = Character { id: Uuid::new_v4(), name: "Bob".to_string(), data: character_data("Bob"), image: None, thumbnail: None };
        storage.create_character(persona.clone()).unwrap();
        storage.create_character(other.clone()).unwrap();
        story.persona_character_id = Some(persona.id);
        let preset = Preset {
            id: Uuid::new_v4(),
            name: "p".to_string(),
            provider: ProviderKind::OpenAi,
            api_config: ApiConfig::default(),
            generation_settings: GenerationSettings::default(),
            lorebook_settings: LorebookSettings::default(),
            prompt_templates: PromptTemplates::default(),
            is_default: true,
        };
        story.config_preset_id = Some(preset.id);
        let story_id = story.id;
        storage.create_story(story).unwrap();
        storage.create_preset(preset).unwrap();
        storage.add_story_character(story_id, persona.id).unwrap();
        storage.add_story_character(story_id, other.id).unwrap();
        storage.add_story_lorebook(story_id, Uuid::new_v4()).ok();

        let story_characters = storage.list_story_characters(story_id).unwrap();
        let profile: Vec<_> =
            story_characters.iter().filter(|c| Some(c.id) != Some(persona.id)).collect();
        assert_eq!(profile.len(), 1);
        assert_eq!(profile[0].data.name, "Bob");
        let _ = Lorebook::new("unused".to_string(), String::new());
        let _ = LorebookEntry::default();
    }

    #[test]
    fn story_title_auto_renames_as_characters_attach_and_detach() {
        let storage = MemoryStorage::new();
        let story = Story::new(crate::storage::UNTITLED_STORY.to_string(), String::new());
        let story_id = story.id;
        storage.create_story(story).unwrap();
        let alice = Character { id: Uuid::new_v4(), name: "Alice".to_string(), data: character_data("Alice"), image: None, thumbnail: None };
        let bob = Character { id: Uuid::new_v4(), name: "Bob".to_string(), data: character_data("Bob"), image: None, thumbnail: None };
        storage.create_character(alice.clone()).unwrap();
        storage.create_character(bob.clone()).unwrap();

        storage.add_story_character(story_id, alice.id).unwrap();
        assert_eq!(storage.get_story(story_id).unwrap().title, "A Story with Alice");

        storage.add_story_character(story_id, bob.id).unwrap();
        assert_eq!(storage.get_story(story_id).unwrap().title, "A Story with Alice and Bob");

        storage.remove_story_character(story_id, alice.id).unwrap();
        assert_eq!(storage.get_story(story_id).unwrap().title, "A Story with Bob");

        storage.remove_story_character(story_id, bob.id).unwrap();
        assert_eq!(storage.get_story(story_id).unwrap().title, crate::storage::UNTITLED_STORY);
    }

    #[test]
    fn custom_story_title_is_left_alone_by_character_attachment() {
        let storage = MemoryStorage::new();
        let story = Story::new("My Custom Adventure".to_string(), String::new());
        let story_id = story.id;
        storage.create_story(story).unwrap();
        let alice = Character { id: Uuid::new_v4(), name: "Alice".to_string(), data: character_data("Alice"), image: None, thumbnail: None };
        storage.create_character(alice.clone()).unwrap();

        storage.add_story_character(story_id, alice.id).unwrap();
        assert_eq!(storage.get_story(story_id).unwrap().title, "My Custom Adventure");
    }

    #[test]
    fn fails_early_when_the_preset_provider_has_no_api_key() {
        let storage = MemoryStorage::new();
        let story = Story::new("T".to_string(), String::new());
        let story_id = story.id;
        storage.create_story(story).unwrap();
        let preset = Preset {
            id: Uuid::new_v4(),
            name: "p".to_string(),
            provider: ProviderKind::OpenAi,
            api_config: ApiConfig { model: "gpt-4o".to_string(), ..ApiConfig::default() },
            generation_settings: GenerationSettings::default(),
            lorebook_settings: LorebookSettings::default(),
            prompt_templates: PromptTemplates::default(),
            is_default: true,
        };
        storage.create_preset(preset.clone()).unwrap();
        let mut story = storage.get_story(story_id).unwrap();
        story.config_preset_id = Some(preset.id);
        storage.update_story_metadata(story).unwrap();

        let request = GenerateRequest { story_id, request_type: RequestType::Continue };
        let result = futures::executor::block_on(generate(&storage, request));
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
