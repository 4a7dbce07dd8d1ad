//! Base64 encoding and decoding utilities

use base64::{engine::general_purpose::STANDARD, Engine};
use crate::error::{AppError, Result};

/// Encode binary data to base64 string
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode base64 string to binary data
pub fn decode(encoded: &str) -> Result<Vec<u8>> {
    // Handle data URL format (e.g., "data:image/png;base64,...")
    let data = match encoded.split_once(',') {
        Some((_, payload)) if is_data_uri(encoded) => payload,
        _ => encoded,
    };

    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid base64 data: {}", e)))
}

/// Whether a string is a `data:` URI carrying base64 content
pub fn is_data_uri(value: &str) -> bool {
    value.starts_with("data:") && value.contains(";base64,")
}

/// Get the media type from a data URI prefix
pub fn media_type_of_data_uri(data_uri: &str) -> Option<&str> {
    let rest = data_uri.strip_prefix("data:")?;
    let end = rest.find(';')?;
    Some(&rest[..end]).filter(|m| !m.is_empty())
}

/// Create a data URI from binary image data
pub fn create_data_uri(data: &[u8], mime: &str) -> String {
    format!("data:{};base64,{}", mime, encode(data))
}

/// Detect an image media type from magic bytes
pub fn sniff_image_mime(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    None
}

/// Serde adapter storing bytes as a base64 string (data URIs accepted on input)
pub mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        super::decode(&encoded).map_err(serde::de::Error::custom)
    }
}
