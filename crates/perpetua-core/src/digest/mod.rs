//! Structural digests for bulk tool output.
//!
//! Large text and JSON blobs never enter the prompt verbatim; the dispatcher
//! replaces them with a compact digest that tells the model what shape the
//! data has and whether it is worth parsing at all.

mod json;
mod text;

pub use json::{digest_json, digest_json_string, JsonDigest};
pub use text::{digest_text, TextDigest};

/// Render a byte count for digest prompts ("1.5KB", "2.0MB")
pub(crate) fn human_bytes(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_buckets() {
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(1536), "1.5KB");
        assert_eq!(human_bytes(2 * 1024 * 1024), "2.0MB");
    }
}
