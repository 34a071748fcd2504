//! System- and user-prompt assembly: character/persona/lorebook
//! sections, the small `{{var}}`/`{{#if}}`/`{{#unless}}`/`{{#each}}`
//! template language used when a preset overrides the system prompt,
//! and story-window truncation to a token budget.

use crate::lorebook::InjectedEntry;
use crate::macros::{self, MacroContext};
use crate::storage::{CharacterData, GenerationSettings};

const CHARS_PER_TOKEN: usize = 4;
const SAFETY_MARGIN_TOKENS: usize = 100;

pub struct PersonaInfo<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub writing_style: Option<&'a str>,
}

pub struct PromptOptions {
    pub third_person: bool,
    pub filter_asterisks: bool,
    pub show_prompt: bool,
}

/// Builds the system prompt from characters, activated lorebook
/// entries, persona, and global settings. If `system_prompt_template`
/// is `Some`, it fully replaces the default section assembly.
pub fn build_system_prompt(
    characters: &[&CharacterData],
    lore: &[InjectedEntry],
    persona: Option<&PersonaInfo>,
    generation: &GenerationSettings,
    options: &PromptOptions,
    system_prompt_template: Option<&str>,
    user_name: &str,
) -> String {
    if let Some(template) = system_prompt_template {
        let vars = template::Vars::new()
            .set("userName", user_name)
            .set_opt("charName", characters.first().map(|c| c.name.as_str()));
        return finalize(&template::render(template, &vars), user_name, characters, options);
    }

    let mut out = String::new();
    out.push_str("You are a creative writing assistant helping to write a novel-style story.\n\n");

    out.push_str(&character_section(characters, generation));

    if !lore.is_empty() {
        out.push_str("\n=== WORLD INFORMATION ===\n\n");
        let blocks: Vec<String> = lore
            .iter()
            .map(|e| {
                if options.show_prompt && !e.comment.is_empty() {
                    format!("<!-- {} -->\n{}", e.comment, e.content)
                } else {
                    e.content.clone()
                }
            })
            .collect();
        out.push_str(&blocks.join("\n\n"));
    }

    if let Some(persona) = persona {
        out.push_str("\n=== USER CHARACTER (PERSONA) ===\n");
        out.push_str(&format!("Name: {}\n", persona.name));
        if !persona.description.is_empty() {
            out.push_str(&format!("Description: {}\n", persona.description));
        }
        if let Some(style) = persona.writing_style {
            out.push_str(&format!("Writing Style: {style}\n"));
        }
    }

    out.push_str("\n=== INSTRUCTIONS ===\n");
    out.push_str(
        "Write in an engaging, novel-like prose style with vivid descriptions. \
         Maintain consistent characterization and tone throughout. \
         Show, don't tell — favor sensory detail and action over exposition.\n",
    );

    if options.third_person {
        out.push_str(
            "\nWrite strictly in third-person, past tense. Do not break into first or \
             second person at any point.\n",
        );
    }

    if options.filter_asterisks {
        out.push_str("\nDo not use asterisks (*) anywhere in your response.\n");
    }

    finalize(&out, user_name, characters, options)
}

fn character_section(characters: &[&CharacterData], generation: &GenerationSettings) -> String {
    match characters {
        [] => String::new(),
        [only] => {
            let mut block = String::from("=== CHARACTER PROFILE ===\n");
            block.push_str(&format!("Name: {}\n", only.name));
            block.push_str(&format!("Description: {}\n", only.description));
            block.push_str(&format!("Personality: {}\n", only.personality));
            if !only.scenario.is_empty() {
                block.push_str(&format!("Current Scenario: {}\n", only.scenario));
            }
            if generation.include_dialogue_examples && !only.mes_example.is_empty() {
                block.push_str(&format!("DIALOGUE STYLE EXAMPLES:\n{}\n", only.mes_example));
            }
            block
        }
        many => {
            let mut block = String::from("=== CHARACTER PROFILES ===\n\n");
            let sub_blocks: Vec<String> = many
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let mut s = format!("Character {}: {}\n", i + 1, c.name);
                    s.push_str(&format!("Description: {}\n", c.description));
                    s.push_str(&format!("Personality: {}\n", c.personality));
                    s
                })
                .collect();
            block.push_str(&sub_blocks.join("\n---\n\n"));
            block
        }
    }
}

fn finalize(
    text: &str,
    user_name: &str,
    characters: &[&CharacterData],
    options: &PromptOptions,
) -> String {
    let char_name = characters.first().map(|c| c.name.as_str()).unwrap_or("Character");
    let ctx = MacroContext { user_name, char_name };
    let substituted = macros::process(text, &ctx);
    if options.filter_asterisks {
        substituted.replace('*', "")
    } else {
        substituted
    }
}

pub enum GenerationType<'a> {
    Continue,
    Character { name: &'a str },
    Custom { instruction: &'a str },
    RewriteThirdPerson,
}

/// Builds the user prompt: story-window context (truncated to the
/// remaining token budget, or to `char_budget_override` when the
/// provider supplies its own character budget) plus the
/// generation-type instruction.
pub fn build_user_prompt(
    story_content: &str,
    generation_type: &GenerationType,
    system_prompt_tokens: usize,
    max_context_tokens: usize,
    max_generation_tokens: usize,
    template_override: Option<&str>,
    char_budget_override: Option<usize>,
) -> String {
    let instruction = instruction_text(generation_type, template_override);

    if matches!(generation_type, GenerationType::RewriteThirdPerson) {
        return instruction;
    }

    let budget_chars = char_budget_override.unwrap_or_else(|| {
        let instruction_tokens = instruction.len().div_ceil(CHARS_PER_TOKEN);
        let remaining_tokens = max_context_tokens
            .saturating_sub(system_prompt_tokens)
            .saturating_sub(instruction_tokens)
            .saturating_sub(max_generation_tokens)
            .saturating_sub(SAFETY_MARGIN_TOKENS);
        remaining_tokens * CHARS_PER_TOKEN
    });

    let mut out = String::new();
    if !story_content.is_empty() {
        let tail = truncate_tail(story_content, budget_chars);
        out.push_str("Here is the current story so far:\n\n");
        out.push_str(&tail);
        out.push_str("\n\n---\n\n");
    }
    out.push_str(&instruction);
    out
}

fn truncate_tail(content: &str, budget_chars: usize) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= budget_chars {
        return content.to_string();
    }
    let kept: String = chars[chars.len() - budget_chars..].iter().collect();
    format!("...{kept}")
}

fn instruction_text(generation_type: &GenerationType, template_override: Option<&str>) -> String {
    let default = match generation_type {
        GenerationType::Continue => {
            "Continue the story naturally from where it left off. Write the next 2-3 \
             paragraphs maximum, maintaining the established tone and style, writing less \
             if it sets up a good opportunity for other characters."
                .to_string()
        }
        GenerationType::Character { name } => {
            format!(
                "Write the next part of the story from {name}'s perspective. Focus on \
                 their thoughts, actions, and dialogue. Write 2-3 paragraphs maximum."
            )
        }
        GenerationType::Custom { instruction } => {
            if instruction.is_empty() {
                "Continue the story.".to_string()
            } else {
                instruction.to_string()
            }
        }
        GenerationType::RewriteThirdPerson => {
            "Rewrite the preceding text strictly in third-person, past tense prose. \
             Remove all asterisks and any first-person narration."
                .to_string()
        }
    };

    match template_override {
        Some(template) => {
            let char_name = match generation_type {
                GenerationType::Character { name } => *name,
                _ => "",
            };
            let vars = template::Vars::new().set("charName", char_name).set("instruction", &default);
            template::render(template, &vars)
        }
        None => default,
    }
}

/// A small templating language: `{{var}}` substitution, `{{#if
/// var}}...{{/if}}`, `{{#unless var}}...{{/unless}}`, `{{#each
/// var}}...{{/each}}` (iterates a list variable, `{{this}}` inside the
/// block). Scoped tightly to these four constructs.
mod template {
    use std::collections::HashMap;

    pub struct Vars<'a> {
        scalars: HashMap<&'a str, String>,
        lists: HashMap<&'a str, Vec<String>>,
    }

    impl<'a> Vars<'a> {
        pub fn new() -> Self {
            Self { scalars: HashMap::new(), lists: HashMap::new() }
        }

        pub fn set(mut self, key: &'a str, value: &str) -> Self {
            self.scalars.insert(key, value.to_string());
            self
        }

        pub fn set_opt(self, key: &'a str, value: Option<&str>) -> Self {
            match value {
                Some(v) => self.set(key, v),
                None => self,
            }
        }

        #[allow(dead_code)]
        pub fn set_list(mut self, key: &'a str, values: Vec<String>) -> Self {
            self.lists.insert(key, values);
            self
        }

        fn is_truthy(&self, key: &str) -> bool {
            self.scalars.get(key).map(|v| !v.is_empty()).unwrap_or(false)
                || self.lists.get(key).map(|v| !v.is_empty()).unwrap_or(false)
        }
    }

    pub fn render(template: &str, vars: &Vars) -> String {
        let mut out = String::new();
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                break;
            };
            let tag = after[..end].trim();
            rest = &after[end + 2..];

            if let Some(var) = tag.strip_prefix("#if ") {
                let (block, remainder) = take_block(rest, "if");
                rest = remainder;
                if vars.is_truthy(var.trim()) {
                    out.push_str(&render(block, vars));
                }
            } else if let Some(var) = tag.strip_prefix("#unless ") {
                let (block, remainder) = take_block(rest, "unless");
                rest = remainder;
                if !vars.is_truthy(var.trim()) {
                    out.push_str(&render(block, vars));
                }
            } else if let Some(var) = tag.strip_prefix("#each ") {
                let (block, remainder) = take_block(rest, "each");
                rest = remainder;
                if let Some(items) = vars.lists.get(var.trim()) {
                    for item in items {
                        out.push_str(&block.replace("{{this}}", item));
                    }
                }
            } else if let Some(value) = vars.scalars.get(tag) {
                out.push_str(value);
            }
        }
        out.push_str(rest);
        out
    }

    /// Splits off the contents up to the matching `{{/name}}`,
    /// returning `(block, remainder_after_close_tag)`.
    fn take_block<'a>(rest: &'a str, name: &str) -> (&'a str, &'a str) {
        let close = format!("{{{{/{name}}}}}");
        match rest.find(&close) {
            Some(idx) => (&rest[..idx], &rest[idx + close.len()..]),
            None => (rest, ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character(name: &str) -> CharacterData {
        CharacterData {
            name: name.to_string(),
            description: "A traveler".to_string(),
            personality: "Curious".to_string(),
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
    fn single_character_uses_profile_heading() {
        let c = character("Alice");
        let prompt = build_system_prompt(
            &[&c],
            &[],
            None,
            &GenerationSettings::default(),
            &PromptOptions { third_person: false, filter_asterisks: false, show_prompt: false },
            None,
            "User",
        );
        assert!(prompt.contains("=== CHARACTER PROFILE ===\n"));
        assert!(!prompt.contains("CHARACTER PROFILES"));
    }

    #[test]
    fn multiple_characters_omit_scenario_and_use_plural_heading() {
        let a = character("Alice");
        let b = character("Bob");
        let prompt = build_system_prompt(
            &[&a, &b],
            &[],
            None,
            &GenerationSettings::default(),
            &PromptOptions { third_person: false, filter_asterisks: false, show_prompt: false },
            None,
            "User",
        );
        assert!(prompt.contains("=== CHARACTER PROFILES ===\n\n"));
        assert!(!prompt.contains("Current Scenario"));
    }

    #[test]
    fn asterisk_filtering_strips_stars_from_final_output() {
        let c = character("Alice");
        let prompt = build_system_prompt(
            &[&c],
            &[],
            None,
            &GenerationSettings::default(),
            &PromptOptions { third_person: false, filter_asterisks: true, show_prompt: false },
            None,
            "User",
        );
        assert!(!prompt.contains('*'));
        assert!(prompt.contains("Do not use asterisks"));
    }

    #[test]
    fn long_story_tail_is_truncated_with_ellipsis_prefix() {
        let content = "word ".repeat(10_000);
        let prompt = build_user_prompt(
            &content,
            &GenerationType::Continue,
            0,
            4096,
            300,
            None,
            None,
        );
        assert!(prompt.starts_with("Here is the current story so far:\n\n..."));
    }

    #[test]
    fn rewrite_third_person_replaces_context_entirely() {
        let prompt = build_user_prompt(
            "some story content",
            &GenerationType::RewriteThirdPerson,
            0,
            4096,
            300,
            None,
            None,
        );
        assert!(!prompt.contains("some story content"));
        assert!(prompt.contains("third-person"));
    }

    #[test]
    fn custom_instruction_defaults_when_empty() {
        let prompt =
            build_user_prompt("", &GenerationType::Custom { instruction: "" }, 0, 4096, 300, None, None);
        assert!(prompt.contains("Continue the story."));
    }

    #[test]
    fn char_budget_override_replaces_the_token_based_budget() {
        let content = format!("{}TAIL", "word ".repeat(10_000));
        let wide = build_user_prompt(&content, &GenerationType::Continue, 0, 4096, 300, None, None);
        let narrow =
            build_user_prompt(&content, &GenerationType::Continue, 0, 4096, 300, None, Some(4));
        assert!(narrow.len() < wide.len());
        assert!(narrow.contains("TAIL"));
    }

    #[test]
    fn template_if_and_each_render_correctly() {
        let vars = template::Vars::new()
            .set("name", "Alice")
            .set_list("items", vec!["a".to_string(), "b".to_string()]);
        let out = template::render("{{#if name}}Hi {{name}}{{/if}} {{#each items}}[{{this}}]{{/each}}", &vars);
        assert_eq!(out, "Hi Alice [a][b]");
    }
}
