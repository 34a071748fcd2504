//! Keyword-triggered lorebook activation: scans a window of recent
//! story text against each lorebook's entries, resolves selective
//! logic / probability / recursion, and produces a token-budgeted,
//! ordered injection list for the prompt builder.

use rand::Rng;
use regex::Regex;

use crate::storage::{LorebookEntry, Position, SelectiveLogic};

const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone)]
pub struct ActiveLorebookEntry<'a> {
    pub entry: &'a LorebookEntry,
}

#[derive(Debug, Clone)]
pub struct InjectedEntry {
    pub content: String,
    pub position: Position,
    pub comment: String,
    pub depth: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct ActivationSettings {
    pub scan_depth_tokens: i32,
    pub token_budget: i32,
    pub recursion_depth: i32,
    pub enable_recursion: bool,
}

/// Runs the full activation pass over every entry across every
/// lorebook and returns the final, token-budgeted injection list.
pub fn activate(
    entries: &[&LorebookEntry],
    story_tail: &str,
    global: &ActivationSettings,
    lorebook_scan_depth: Option<i32>,
) -> Vec<InjectedEntry> {
    let mut activated: Vec<&LorebookEntry> = Vec::new();
    let mut terminal: Vec<i64> = Vec::new();
    let mut seed = story_tail.to_string();
    let mut pass: i32 = 0;

    loop {
        let mut new_this_pass = Vec::new();
        for entry in entries {
            if !entry.enabled || activated.iter().any(|a| a.id == entry.id) {
                continue;
            }
            if entry.delay_until_recursion && pass == 0 {
                continue;
            }
            let scan_depth =
                entry.scan_depth.or(lorebook_scan_depth).unwrap_or(global.scan_depth_tokens);
            let window = tail_window(&seed, scan_depth);

            let is_candidate = if entry.constant {
                true
            } else if matches_primary(entry, &window) {
                if entry.selective {
                    selective_matches(entry, &window)
                } else {
                    true
                }
            } else {
                false
            };
            if !is_candidate {
                continue;
            }
            if entry.use_probability && !roll_probability(entry.probability) {
                continue;
            }
            new_this_pass.push(*entry);
        }

        if new_this_pass.is_empty() {
            break;
        }

        for entry in &new_this_pass {
            if pass > 0 && entry.prevent_recursion {
                terminal.push(entry.id);
            }
        }
        activated.extend(new_this_pass.iter().copied());

        pass += 1;
        if !global.enable_recursion || pass >= global.recursion_depth {
            break;
        }

        let feed: String = new_this_pass
            .iter()
            .filter(|e| !terminal.contains(&e.id))
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if feed.is_empty() {
            break;
        }
        seed = feed;
    }

    let resolved = resolve_groups(activated);
    order_and_budget(resolved, global.token_budget)
}

fn tail_window(text: &str, scan_depth_tokens: i32) -> String {
    let chars: Vec<char> = text.chars().collect();
    let n = (scan_depth_tokens.max(0) as usize) * CHARS_PER_TOKEN;
    if chars.len() <= n {
        text.to_string()
    } else {
        chars[chars.len() - n..].iter().collect()
    }
}

fn matches_primary(entry: &LorebookEntry, window: &str) -> bool {
    entry.keys.iter().any(|k| key_matches(k, window, entry))
}

fn key_matches(key: &str, window: &str, entry: &LorebookEntry) -> bool {
    if entry.use_regex {
        return Regex::new(key).map(|re| re.is_match(window)).unwrap_or(false);
    }
    let (haystack, needle): (String, String) = if entry.case_sensitive {
        (window.to_string(), key.to_string())
    } else {
        (window.to_lowercase(), key.to_lowercase())
    };
    if entry.match_whole_words {
        word_boundary_contains(&haystack, &needle)
    } else {
        haystack.contains(&needle)
    }
}

fn word_boundary_contains(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let hchars: Vec<char> = haystack.chars().collect();
    let nchars: Vec<char> = needle.chars().collect();
    if nchars.len() > hchars.len() {
        return false;
    }
    for start in 0..=(hchars.len() - nchars.len()) {
        if hchars[start..start + nchars.len()] == nchars[..] {
            let before_ok = start == 0 || !is_word(hchars[start - 1]);
            let end = start + nchars.len();
            let after_ok = end == hchars.len() || !is_word(hchars[end]);
            if before_ok && after_ok {
                return true;
            }
        }
    }
    false
}

fn selective_matches(entry: &LorebookEntry, window: &str) -> bool {
    if entry.secondary_keys.is_empty() {
        return true;
    }
    let matches: Vec<bool> =
        entry.secondary_keys.iter().map(|k| key_matches(k, window, entry)).collect();
    let any = matches.iter().any(|&m| m);
    let all = matches.iter().all(|&m| m);
    match entry.selective_logic {
        SelectiveLogic::AndAny => any,
        SelectiveLogic::NotAll => !all,
        SelectiveLogic::NotAny => !any,
        SelectiveLogic::AndAll => all,
    }
}

fn roll_probability(probability: u8) -> bool {
    let draw = rand::rng().random_range(1..=100u8);
    draw <= probability
}

fn resolve_groups(activated: Vec<&LorebookEntry>) -> Vec<&LorebookEntry> {
    let mut by_group: Vec<(&str, &LorebookEntry)> = Vec::new();
    let mut ungrouped = Vec::new();
    for entry in activated {
        if entry.group.is_empty() {
            ungrouped.push(entry);
        } else {
            match by_group.iter().position(|(g, _)| *g == entry.group.as_str()) {
                Some(idx) => {
                    if entry.insertion_order > by_group[idx].1.insertion_order {
                        by_group[idx] = (&entry.group, entry);
                    }
                }
                None => by_group.push((&entry.group, entry)),
            }
        }
    }
    ungrouped.extend(by_group.into_iter().map(|(_, e)| e));
    ungrouped
}

fn order_and_budget(mut entries: Vec<&LorebookEntry>, token_budget: i32) -> Vec<InjectedEntry> {
    entries.sort_by(|a, b| {
        a.position
            .rank()
            .cmp(&b.position.rank())
            .then(b.insertion_order.cmp(&a.insertion_order))
            .then(a.id.cmp(&b.id))
    });

    let budget_chars = (token_budget.max(0) as usize) * CHARS_PER_TOKEN;
    let mut used = 0usize;
    let mut out = Vec::new();
    for entry in entries {
        let len = entry.content.chars().count();
        if used + len > budget_chars {
            break;
        }
        used += len;
        out.push(InjectedEntry {
            content: entry.content.clone(),
            position: entry.position,
            comment: entry.comment.clone(),
            depth: entry.depth,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, keys: &[&str], content: &str) -> LorebookEntry {
        LorebookEntry {
            id,
            keys: keys.iter().map(|s| s.to_string()).collect(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    fn settings() -> ActivationSettings {
        ActivationSettings {
            scan_depth_tokens: 1000,
            token_budget: 500,
            recursion_depth: 3,
            enable_recursion: true,
        }
    }

    #[test]
    fn constant_entries_always_activate() {
        let mut e = entry(1, &[], "Always here");
        e.constant = true;
        let entries = vec![&e];
        let out = activate(&entries, "irrelevant text", &settings(), None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "Always here");
    }

    #[test]
    fn keyword_match_triggers_entry() {
        let e = entry(1, &["dragon"], "Dragons breathe fire");
        let entries = vec![&e];
        let out = activate(&entries, "a dragon appeared", &settings(), None);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn whole_word_matching_rejects_substrings() {
        let mut e = entry(1, &["cat"], "Cats are sneaky");
        e.match_whole_words = true;
        let entries = vec![&e];
        let out = activate(&entries, "a category error", &settings(), None);
        assert!(out.is_empty());
    }

    #[test]
    fn selective_and_all_requires_every_secondary() {
        let mut e = entry(1, &["sword"], "A magic sword");
        e.selective = true;
        e.selective_logic = SelectiveLogic::AndAll;
        e.secondary_keys = vec!["fire".to_string(), "ice".to_string()];
        let entries = vec![&e];
        let out = activate(&entries, "a sword with fire", &settings(), None);
        assert!(out.is_empty());
        let out = activate(&entries, "a sword with fire and ice", &settings(), None);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn group_resolution_keeps_highest_insertion_order() {
        let mut a = entry(1, &[], "A");
        a.constant = true;
        a.group = "g".to_string();
        a.insertion_order = 1;
        let mut b = entry(2, &[], "B");
        b.constant = true;
        b.group = "g".to_string();
        b.insertion_order = 5;
        let entries = vec![&a, &b];
        let out = activate(&entries, "", &settings(), None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "B");
    }

    #[test]
    fn token_budget_stops_injection_early() {
        let mut a = entry(1, &[], &"x".repeat(100));
        a.constant = true;
        let mut b = entry(2, &[], &"y".repeat(100));
        b.constant = true;
        let entries = vec![&a, &b];
        let tight = ActivationSettings {
            scan_depth_tokens: 1000,
            token_budget: 20,
            recursion_depth: 3,
            enable_recursion: true,
        };
        let out = activate(&entries, "", &tight, None);
        assert!(out.is_empty());
    }

    #[test]
    fn recursion_disabled_stops_after_first_pass() {
        let mut a = entry(1, &["alpha"], "beta appears");
        a.constant = false;
        let mut b = entry(2, &["beta"], "gamma appears");
        b.prevent_recursion = false;
        let entries = vec![&a, &b];
        let no_recursion = ActivationSettings {
            scan_depth_tokens: 1000,
            token_budget: 500,
            recursion_depth: 3,
            enable_recursion: false,
        };
        let out = activate(&entries, "alpha triggers this", &no_recursion, None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "beta appears");
    }
}
