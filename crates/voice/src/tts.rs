use {
    base64::{Engine, engine::general_purpose::STANDARD},
    hana_protocol::KlatResponseData,
    serde_json::Value,
    tracing::warn,
};

/// Decode every synthesized audio clip in a response, in language order and
/// then in the order each language lists its voices. Clips that are not
/// valid base64 strings are skipped.
pub fn decode_response_audio(response: &KlatResponseData) -> Vec<Vec<u8>> {
    let mut clips = Vec::new();
    for (lang, entry) in &response.responses {
        for (gender, audio) in &entry.audio {
            let Value::String(encoded) = audio else {
                continue;
            };
            match STANDARD.decode(encoded) {
                Ok(bytes) => clips.push(bytes),
                Err(e) => warn!(lang, gender, error = %e, "skipping undecodable response audio"),
            }
        }
    }
    clips
}
