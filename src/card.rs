//! PNG character-card parser: walks PNG chunks looking for a `tEXt`
//! chunk with keyword `chara`, base64-decodes the payload, and parses
//! the result as a V1 or V2 character card JSON document.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{CharacterBook, CharacterData, Extensions};

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Error)]
pub enum CardError {
    #[error("not a PNG file")]
    NotPng,
    #[error("truncated PNG chunk")]
    Truncated,
    #[error("no chara tEXt chunk found")]
    NoCharaChunk,
    #[error("invalid base64 in chara chunk")]
    InvalidBase64,
    #[error("invalid UTF-8 in decoded chara payload")]
    InvalidUtf8,
    #[error("invalid card JSON: {0}")]
    InvalidJson(String),
    #[error("unrecognizable card shape")]
    UnrecognizableShape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub spec: String,
    pub spec_version: String,
    pub data: CharacterData,
}

/// Raw JSON-level shape used only to decide V1 vs V2 before committing
/// to a typed deserialization of either one.
#[derive(Debug, Deserialize)]
struct RawCard {
    spec: Option<String>,
    data: Option<serde_json::Value>,
    #[serde(flatten)]
    rest: serde_json::Value,
}

/// A V1 card has all character fields at the top level, no `data` nesting.
#[derive(Debug, Deserialize)]
struct V1Card {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    personality: String,
    #[serde(default)]
    scenario: String,
    #[serde(default)]
    first_mes: String,
    #[serde(default)]
    mes_example: String,
    #[serde(default)]
    creator_notes: String,
    #[serde(default)]
    system_prompt: String,
    #[serde(default)]
    post_history_instructions: String,
    #[serde(default)]
    creator: String,
    #[serde(default)]
    character_version: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// Extracts the embedded `chara` payload and parses it into a V2 card,
/// normalizing V1 input. Fails with `CardError` per the cases in the
/// card-parser error taxonomy.
pub fn parse_card(bytes: &[u8]) -> Result<Card, CardError> {
    let raw = extract_chara_json(bytes)?;
    normalize(&raw)
}

fn extract_chara_json(bytes: &[u8]) -> Result<String, CardError> {
    if bytes.len() < 8 || bytes[0..8] != PNG_SIGNATURE {
        return Err(CardError::NotPng);
    }
    let mut offset = 8;
    loop {
        if offset + 8 > bytes.len() {
            return Err(CardError::Truncated);
        }
        let length = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        let chunk_type = &bytes[offset + 4..offset + 8];
        let data_start = offset + 8;
        let data_end = data_start.checked_add(length).ok_or(CardError::Truncated)?;
        if data_end + 4 > bytes.len() {
            return Err(CardError::Truncated);
        }
        let payload = &bytes[data_start..data_end];

        if chunk_type == b"tEXt" {
            if let Some(nul) = payload.iter().position(|&b| b == 0) {
                let keyword = &payload[..nul];
                if keyword == b"chara" {
                    let text = &payload[nul + 1..];
                    let decoded = STANDARD.decode(text).map_err(|_| CardError::InvalidBase64)?;
                    return String::from_utf8(decoded).map_err(|_| CardError::InvalidUtf8);
                }
            }
        }

        if chunk_type == b"IEND" {
            return Err(CardError::NoCharaChunk);
        }
        offset = data_end + 4;
    }
}

fn normalize(json: &str) -> Result<Card, CardError> {
    let raw: RawCard =
        serde_json::from_str(json).map_err(|e| CardError::InvalidJson(e.to_string()))?;

    if raw.spec.as_deref() == Some("chara_card_v2") {
        if let Some(data) = raw.data {
            let data: CharacterData =
                serde_json::from_value(data).map_err(|e| CardError::InvalidJson(e.to_string()))?;
            return Ok(Card {
                spec: "chara_card_v2".to_string(),
                spec_version: "2.0".to_string(),
                data,
            });
        }
        return Err(CardError::UnrecognizableShape);
    }

    let v1: V1Card =
        serde_json::from_value(raw.rest).map_err(|_| CardError::UnrecognizableShape)?;
    if v1.name.is_empty() && v1.description.is_empty() && v1.first_mes.is_empty() {
        return Err(CardError::UnrecognizableShape);
    }

    Ok(Card {
        spec: "chara_card_v2".to_string(),
        spec_version: "2.0".to_string(),
        data: CharacterData {
            name: v1.name,
            description: v1.description,
            personality: v1.personality,
            scenario: v1.scenario,
            first_mes: v1.first_mes,
            mes_example: v1.mes_example,
            creator_notes: v1.creator_notes,
            system_prompt: v1.system_prompt,
            post_history_instructions: v1.post_history_instructions,
            alternate_greetings: Vec::new(),
            tags: v1.tags,
            creator: v1.creator,
            character_version: v1.character_version,
            extensions: Extensions::new(),
            character_book: None::<CharacterBook>,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(chunk_type: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(chunk_type);
        out.extend_from_slice(data);
        out.extend_from_slice(&[0u8; 4]); // CRC ignored on read
        out
    }

    fn png_with_chara(json: &str) -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        let encoded = STANDARD.encode(json.as_bytes());
        let mut payload = b"chara\0".to_vec();
        payload.extend_from_slice(encoded.as_bytes());
        bytes.extend(chunk(b"tEXt", &payload));
        bytes.extend(chunk(b"IEND", &[]));
        bytes
    }

    #[test]
    fn parses_v2_card_unchanged() {
        let json = serde_json::json!({
            "spec": "chara_card_v2",
            "spec_version": "2.0",
            "data": {
                "name": "Alice",
                "description": "A wanderer",
                "personality": "",
                "scenario": "",
                "first_mes": "Hello",
                "mes_example": "",
                "creator_notes": "",
                "system_prompt": "",
                "post_history_instructions": "",
                "alternate_greetings": [],
                "tags": [],
                "creator": "",
                "character_version": "",
                "extensions": {},
            }
        })
        .to_string();
        let card = parse_card(&png_with_chara(&json)).unwrap();
        assert_eq!(card.data.name, "Alice");
        assert_eq!(card.data.first_mes, "Hello");
    }

    #[test]
    fn normalizes_v1_card_into_v2_shape() {
        let json = serde_json::json!({
            "name": "Bob",
            "description": "A merchant",
            "first_mes": "Welcome to my shop",
        })
        .to_string();
        let card = parse_card(&png_with_chara(&json)).unwrap();
        assert_eq!(card.spec, "chara_card_v2");
        assert_eq!(card.spec_version, "2.0");
        assert_eq!(card.data.name, "Bob");
        assert!(card.data.alternate_greetings.is_empty());
        assert!(card.data.character_book.is_none());
    }

    #[test]
    fn rejects_non_png_bytes() {
        let err = parse_card(b"not a png").unwrap_err();
        assert!(matches!(err, CardError::NotPng));
    }

    #[test]
    fn rejects_missing_chara_chunk() {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend(chunk(b"IEND", &[]));
        let err = parse_card(&bytes).unwrap_err();
        assert!(matches!(err, CardError::NoCharaChunk));
    }

    #[test]
    fn rejects_invalid_base64() {
        let mut bytes = PNG_SIGNATURE.to_vec();
        let mut payload = b"chara\0".to_vec();
        payload.extend_from_slice(b"not-valid-base64!!!");
        bytes.extend(chunk(b"tEXt", &payload));
        bytes.extend(chunk(b"IEND", &[]));
        let err = parse_card(&bytes).unwrap_err();
        assert!(matches!(err, CardError::InvalidBase64));
    }
}
