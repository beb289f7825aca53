//! Encoding of a message's ordered image URL list into the nullable
//! `messages.image_url` TEXT column.
//!
//! New rows store a JSON array. Older rows may hold a bare URL string (the
//! column used to carry a single image); those decode to a one-element list.

use serde_json::Value;

/// `None` (SQL NULL) for an empty list, a JSON array otherwise.
pub fn encode(urls: &[String]) -> Option<String> {
    if urls.is_empty() {
        return None;
    }
    serde_json::to_string(urls).ok()
}

pub fn decode(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    if raw.trim().is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(url) => Some(url),
                _ => None,
            })
            .collect(),
        Ok(Value::String(url)) => vec![url],
        // Legacy: the raw column value is itself the URL
        _ => vec![raw.to_string()],
    }
}
