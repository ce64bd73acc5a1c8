//! Helpers for the opaque `Upload-Metadata` blob.
//!
//! The blob is a comma separated list of `key base64value` pairs. The
//! coordinator never interprets it beyond guessing a file extension, so every
//! function here is lenient and falls back to "nothing found".

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Keys checked, in order, for an original file name.
const NAME_KEYS: [&str; 2] = ["filename", "name"];

/// Decode the blob into `(key, value)` pairs. Values that are absent or not
/// valid base64 come back as `None`.
pub fn parse(raw: &str) -> Vec<(String, Option<String>)> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let mut parts = pair.splitn(2, ' ');
            let key = parts.next().unwrap_or_default().to_string();
            let value = parts
                .next()
                .and_then(|v| STANDARD.decode(v.trim()).ok())
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
            (key, value)
        })
        .collect()
}

/// Lowercase file extension (without the dot) of the uploaded file's name,
/// or an empty string when none can be derived.
pub fn extension_hint(raw: &str) -> String {
    let pairs = parse(raw);
    let name = NAME_KEYS
        .iter()
        .find_map(|key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| v.clone())
        })
        .or_else(|| pairs.iter().find_map(|(_, v)| v.clone()));

    name.as_deref()
        .and_then(|n| Path::new(n).extension())
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Mime type for an extension hint.
pub fn content_type(hint: &str) -> Option<&'static str> {
    if hint.is_empty() {
        return None;
    }
    mime_guess::from_ext(hint).first_raw()
}
