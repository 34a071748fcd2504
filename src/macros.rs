//! Macro substitution language. A single left-to-right pass per macro
//! family; substituted text is never re-scanned for further macros.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use chrono::{Datelike, Timelike, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};
use regex::Regex;

/// Names substituted for `{{user}}`/`{{char}}`/`{{character}}`.
pub struct MacroContext<'a> {
    pub user_name: &'a str,
    pub char_name: &'a str,
}

static MACRO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{([^{}]*)\}\}").unwrap());

/// Runs the full macro pipeline over `text` in a single scan: every
/// `{{...}}` span is resolved exactly once (name macros take priority
/// over the others), and substituted values are never re-scanned.
pub fn process(text: &str, ctx: &MacroContext) -> String {
    let now = Utc::now();
    MACRO_RE
        .replace_all(text, |caps: &regex::Captures| {
            let body = caps[1].trim();
            let lower = body.to_ascii_lowercase();

            match lower.as_str() {
                "user" => return ctx.user_name.to_string(),
                "char" | "character" => return ctx.char_name.to_string(),
                _ => {}
            }

            if let Some(list) = lower.strip_prefix("random:") {
                return pick_random(&raw_list(body, list.len()));
            }
            if let Some(list) = lower.strip_prefix("pick:") {
                return pick_seeded(&raw_list(body, list.len()), ctx.char_name);
            }
            if let Some(spec) = lower.strip_prefix("roll:") {
                return roll(spec).unwrap_or_else(|| caps[0].to_string());
            }

            match lower.as_str() {
                "date" => now.format("%Y-%m-%d").to_string(),
                "time" => now.format("%H:%M:%S").to_string(),
                "weekday" => now.weekday().to_string(),
                "isotime" => now.to_rfc3339(),
                "idle_duration" => "a moment".to_string(),
                _ => caps[0].to_string(),
            }
        })
        .to_string()
}

/// Recovers the raw (non-lowercased) argument list following a macro
/// prefix of known byte length within the original (non-lowercased)
/// macro body.
fn raw_list(body: &str, suffix_len: usize) -> Vec<String> {
    let start = body.len() - suffix_len;
    body[start..].split(',').map(|s| s.trim().to_string()).collect()
}

fn pick_random(options: &[String]) -> String {
    if options.is_empty() {
        return String::new();
    }
    let idx = rand::rng().random_range(0..options.len());
    options[idx].clone()
}

fn pick_seeded(options: &[String], char_name: &str) -> String {
    if options.is_empty() {
        return String::new();
    }
    let mut hasher = DefaultHasher::new();
    char_name.hash(&mut hasher);
    let mut rng = StdRng::seed_from_u64(hasher.finish());
    let idx = rng.random_range(0..options.len());
    options[idx].clone()
}

fn roll(spec: &str) -> Option<String> {
    let (n, m) = spec.split_once('d')?;
    let n: u32 = n.trim().parse().ok()?;
    let m: u32 = m.trim().parse().ok()?;
    if n == 0 || m == 0 || n > 1000 {
        return None;
    }
    let mut rng = rand::rng();
    let total: u32 = (0..n).map(|_| rng.random_range(1..=m)).sum();
    Some(total.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>() -> MacroContext<'a> {
        MacroContext { user_name: "Alice", char_name: "Bob" }
    }

    #[test]
    fn substitutes_user_and_char_before_other_macros() {
        let out = process("Hi {{user}}, I am {{char}}.", &ctx());
        assert_eq!(out, "Hi Alice, I am Bob.");
    }

    #[test]
    fn leaves_unknown_macros_literal() {
        let out = process("{{unknown_thing}}", &ctx());
        assert_eq!(out, "{{unknown_thing}}");
    }

    #[test]
    fn random_picks_from_the_list() {
        let out = process("{{random:a,b,c}}", &ctx());
        assert!(["a", "b", "c"].contains(&out.as_str()));
    }

    #[test]
    fn pick_is_deterministic_for_a_given_char_name() {
        let a = process("{{pick:x,y,z}}", &ctx());
        let b = process("{{pick:x,y,z}}", &ctx());
        assert_eq!(a, b);
    }

    #[test]
    fn roll_sums_n_dice_within_range() {
        let out = process("{{roll:3d6}}", &ctx());
        let total: u32 = out.parse().unwrap();
        assert!((3..=18).contains(&total));
    }

    #[test]
    fn substituted_text_is_not_rescanned() {
        // user_name itself contains macro-like text; it must not be
        // evaluated again in the same pass.
        let ctx = MacroContext { user_name: "{{char}}", char_name: "Bob" };
        let out = process("{{user}}", &ctx);
        assert_eq!(out, "{{char}}");
    }
}
