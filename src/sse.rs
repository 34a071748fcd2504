//! Pure SSE record framing for the generation endpoint. Kept free of
//! any HTTP-framework type so it can be unit-tested directly; the
//! `axum` handler in `bin/server.rs` streams these strings straight
//! into the response body so the exact framing below reaches the wire.

use serde::Serialize;

use crate::provider::GenerationChunk;

#[derive(Debug, Serialize)]
struct Record {
    reasoning: Option<String>,
    content: Option<String>,
    finished: bool,
}

#[derive(Debug, Serialize)]
struct ErrorRecord {
    error: String,
}

/// Encodes one provider chunk as exactly one SSE `data:` line.
pub fn encode_chunk(chunk: &GenerationChunk) -> String {
    let record = Record {
        reasoning: chunk.reasoning.clone(),
        content: chunk.content.clone(),
        finished: chunk.finished,
    };
    format!("data: {}\n\n", serde_json::to_string(&record).unwrap())
}

/// The terminal `[DONE]` record.
pub fn encode_done() -> String {
    "data: [DONE]\n\n".to_string()
}

/// An in-stream error record. No HTTP status accompanies it — the
/// stream is already committed by the time a provider error happens
/// mid-generation.
pub fn encode_error(message: &str) -> String {
    let record = ErrorRecord { error: message.to_string() };
    format!("data: {}\n\n", serde_json::to_string(&record).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_content_chunk() {
        let chunk = GenerationChunk {
            reasoning: None,
            content: Some("hello".to_string()),
            finished: false,
        };
        let out = encode_chunk(&chunk);
        assert_eq!(out, "data: {\"reasoning\":null,\"content\":\"hello\",\"finished\":false}\n\n");
    }

    #[test]
    fn encodes_done_marker() {
        assert_eq!(encode_done(), "data: [DONE]\n\n");
    }

    #[test]
    fn encodes_error_record() {
        let out = encode_error("boom");
        assert_eq!(out, "data: {\"error\":\"boom\"}\n\n");
    }
}
