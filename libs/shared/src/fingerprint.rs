use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::message::{Message, Role};

const ANCHOR_CAP: usize = 512;

static MESSAGE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""message_id"\s*:\s*"[^"]*""#)
        .unwrap_or_else(|error| panic!("static regex failed to compile: {error}"))
});

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[[^\[\]]*\b\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}[^\[\]]*\]")
        .unwrap_or_else(|error| panic!("static regex failed to compile: {error}"))
});

/// Resolve the session key for a request: an explicit caller-supplied key
/// wins verbatim (after trimming); otherwise the anchor fingerprint.
pub fn resolve_key(messages: &[Message], explicit_key: Option<&str>) -> String {
    if let Some(key) = explicit_key {
        let trimmed = key.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    fingerprint(messages)
}

/// The anchor: first system message (if any) plus first user message,
/// each capped and noise-stripped, hashed to the low 128 bits of SHA-256
/// and rendered as 32 hex chars.
pub fn fingerprint(messages: &[Message]) -> String {
    let anchor = build_anchor(messages);
    let digest = Sha256::digest(anchor.as_bytes());
    hex::encode(&digest[16..32])
}

fn build_anchor(messages: &[Message]) -> String {
    let system = messages.iter().find(|m| m.is_role(Role::System));
    let user = messages.iter().find(|m| m.is_role(Role::User));

    let mut parts = Vec::new();
    if let Some(m) = system {
        parts.push(render_anchor_part("system", &m.text()));
    }
    if let Some(m) = user {
        parts.push(render_anchor_part("user", &m.text()));
    }
    parts.join("\n")
}

fn render_anchor_part(role: &str, text: &str) -> String {
    let stripped = strip_noise(text);
    let capped = cap_chars(&stripped, ANCHOR_CAP);
    format!("{role}:{capped}")
}

fn strip_noise(text: &str) -> String {
    let text = MESSAGE_ID_RE.replace_all(text, "");
    TIMESTAMP_RE.replace_all(&text, "").into_owned()
}

fn cap_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

// A tiny local hex encoder so this crate doesn't need the `hex` crate just
// for a 16-byte slice.
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Content;

    fn user(text: &str) -> Message {
        Message {
            role: Role::User,
            content: Content::Text(text.to_string()),
        }
    }

    fn system(text: &str) -> Message {
        Message {
            role: Role::System,
            content: Content::Text(text.to_string()),
        }
    }

    #[test]
    fn explicit_key_returned_verbatim_when_non_blank() {
        let key = resolve_key(&[user("hi")], Some("  my-key  "));
        assert_eq!(key, "my-key");
    }

    #[test]
    fn blank_explicit_key_falls_back_to_fingerprint() {
        let key = resolve_key(&[user("hi")], Some("   "));
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_32_hex_chars() {
        let key = fingerprint(&[user("hello")]);
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn adding_further_turns_does_not_change_the_key() {
        let a = fingerprint(&[user("hello")]);
        let b = fingerprint(&[
            user("hello"),
            Message {
                role: Role::Assistant,
                content: Content::Text("hi there".into()),
            },
            user("more"),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn differing_first_user_content_changes_the_key() {
        let a = fingerprint(&[user("hello")]);
        let b = fingerprint(&[user("goodbye")]);
        assert_ne!(a, b);
    }

    #[test]
    fn presence_of_system_message_changes_the_key() {
        let a = fingerprint(&[user("hello")]);
        let b = fingerprint(&[system("you are an assistant"), user("hello")]);
        assert_ne!(a, b);
    }

    #[test]
    fn noise_stripped_message_id_does_not_affect_the_key() {
        let a = fingerprint(&[user(r#"hello "message_id":"abc123" world"#)]);
        let b = fingerprint(&[user(r#"hello "message_id":"xyz999" world"#)]);
        assert_eq!(a, b);
    }

    #[test]
    fn noise_stripped_timestamp_does_not_affect_the_key() {
        let a = fingerprint(&[user("[Alice Mon 2024-01-01 10:00 UTC] hello")]);
        let b = fingerprint(&[user("[Bob Tue 2024-06-05 23:59 PST] hello")]);
        assert_eq!(a, b);
    }

    #[test]
    fn truncation_past_512_chars_does_not_affect_the_key() {
        let long_common = "x".repeat(512);
        let a = fingerprint(&[user(&format!("{long_common}AAAA"))]);
        let b = fingerprint(&[user(&format!("{long_common}BBBB"))]);
        assert_eq!(a, b);
    }
}
