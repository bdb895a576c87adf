//! Deterministic request fingerprints for the response cache.

use dex_core::{CallKind, ChatMessage, ToolDef};
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Serialize)]
struct Canonical<'a> {
    kind: &'static str,
    messages: &'a [ChatMessage],
    tools: Vec<&'a str>,
}

/// SHA-256 (hex) over the call kind, the ordered messages and the sorted
/// tool names. Tool order does not matter; message order does.
pub fn fingerprint(kind: CallKind, messages: &[ChatMessage], tools: &[ToolDef]) -> String {
    let mut tool_names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    tool_names.sort_unstable();
    tool_names.dedup();

    let canonical = Canonical {
        kind: kind.tag(),
        messages,
        tools: tool_names,
    };
    // Serializing plain strings and vecs cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> ToolDef {
        ToolDef::new(name, "d", serde_json::json!({"type": "object"}))
    }

    fn convo() -> Vec<ChatMessage> {
        vec![ChatMessage::system("be brief"), ChatMessage::user("hello")]
    }

    #[test]
    fn stable_and_hex() {
        let a = fingerprint(CallKind::Chat, &convo(), &[]);
        let b = fingerprint(CallKind::Chat, &convo(), &[]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tool_order_is_irrelevant() {
        let a = fingerprint(CallKind::Tools, &convo(), &[tool("a"), tool("b")]);
        let b = fingerprint(CallKind::Tools, &convo(), &[tool("b"), tool("a")]);
        assert_eq!(a, b);
    }

    #[test]
    fn kind_and_message_order_matter() {
        let chat = fingerprint(CallKind::Chat, &convo(), &[]);
        let summary = fingerprint(CallKind::Summary, &convo(), &[]);
        assert_ne!(chat, summary);

        let mut reversed = convo();
        reversed.reverse();
        assert_ne!(chat, fingerprint(CallKind::Chat, &reversed, &[]));
    }
}
