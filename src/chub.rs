//! CHUB character importer: resolves a chub.ai character URL to its
//! PNG card, downloads it, parses it, and optionally imports its
//! embedded lorebook.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::card::{self, CardError};
use crate::storage::Lorebook;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:api\.)?chub\.ai/(?:api/)?characters/(.+)").unwrap());

#[derive(Debug, Error)]
pub enum ChubError {
    #[error("invalid chub URL")]
    InvalidUrl,
    #[error("network error: {0}")]
    Network(String),
    #[error("card error: {0}")]
    Card(#[from] CardError),
}

pub struct ImportedCharacter {
    pub card: card::Card,
    pub lorebook: Option<Lorebook>,
}

pub async fn import(client: &reqwest::Client, url: &str) -> Result<ImportedCharacter, ChubError> {
    let path = extract_path(url)?;
    let api_url = format!("https://api.chub.ai/api/characters/{path}");

    let response = client
        .get(&api_url)
        .header("User-Agent", "Mozilla/5.0 (compatible; ursceal-importer/1.0)")
        .header("Referer", "https://chub.ai/")
        .send()
        .await
        .map_err(|e| ChubError::Network(e.to_string()))?;
    let body: serde_json::Value =
        response.json().await.map_err(|e| ChubError::Network(e.to_string()))?;

    let avatar_url = preferred_avatar_url(&body).ok_or(ChubError::InvalidUrl)?;
    let bytes = client
        .get(avatar_url)
        .send()
        .await
        .map_err(|e| ChubError::Network(e.to_string()))?
        .bytes()
        .await
        .map_err(|e| ChubError::Network(e.to_string()))?;

    let parsed_card = card::parse_card(&bytes)?;

    let lorebook = parsed_card.data.character_book.as_ref().filter(|book| !book.entries.is_empty()).map(|book| {
        let mut lorebook = Lorebook::new(
            book.name.clone().unwrap_or_else(|| format!("{}'s Lorebook", parsed_card.data.name)),
            book.description.clone().unwrap_or_default(),
        );
        lorebook.scan_depth = book.scan_depth;
        lorebook.token_budget = book.token_budget;
        lorebook.recursive_scanning = book.recursive_scanning.unwrap_or(false);
        lorebook.extensions = book.extensions.clone();
        lorebook.entries = book.entries.clone();
        lorebook
    });

    Ok(ImportedCharacter { card: parsed_card, lorebook })
}

fn extract_path(url: &str) -> Result<String, ChubError> {
    URL_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(ChubError::InvalidUrl)
}

fn preferred_avatar_url(body: &serde_json::Value) -> Option<&str> {
    let node = &body["node"];
    node["full_path"]
        .as_str()
        .or_else(|| node["fullPath"].as_str())
        .or_else(|| node["max_res_url"].as_str())
        .or_else(|| node["avatar_url"].as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_path_from_chub_characters_url() {
        let path = extract_path("https://chub.ai/characters/someone/my-character").unwrap();
        assert_eq!(path, "someone/my-character");
    }

    #[test]
    fn extracts_path_from_api_chub_url() {
        let path = extract_path("https://api.chub.ai/api/characters/someone/my-character").unwrap();
        assert_eq!(path, "someone/my-character");
    }

    #[test]
    fn rejects_unrelated_urls() {
        assert!(matches!(extract_path("https://example.com/x"), Err(ChubError::InvalidUrl)));
    }

    #[test]
    fn prefers_full_path_over_other_fields() {
        let body = serde_json::json!({
            "node": {
                "full_path": "a.png",
                "fullPath": "b.png",
                "max_res_url": "c.png",
                "avatar_url": "d.png",
            }
        });
        assert_eq!(preferred_avatar_url(&body), Some("a.png"));
    }

    #[test]
    fn falls_back_through_the_preference_chain() {
        let body = serde_json::json!({ "node": { "avatar_url": "d.png" } });
        assert_eq!(preferred_avatar_url(&body), Some("d.png"));
    }
}
