//! Activity event construction and best-effort recording.
//!
//! One [`ActivityEvent`] is built per intercepted exchange, always, including
//! for allowed traffic. Identifying fields (user, content) are one-way hashed
//! by default; raw content is retained only under the workspace's full-audit
//! setting. Events are handed to the recorder before the response is returned
//! to the client, but the write to the external store happens on a background
//! task so a slow or failing store never blocks the forwarding path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::classifier::Classification;
use crate::store::ActivitySink;

/// Depth of the pending-write queue before events are dropped (and logged).
const QUEUE_DEPTH: usize = 256;

/// Immutable audit record for one intercepted exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Unique event id (also surfaced in the diagnostic response headers).
    pub id: String,
    /// Tool label for the destination (e.g. "chatgpt", "claude").
    pub tool: String,
    /// Destination hostname.
    pub tool_domain: String,
    /// One-way hash of the user identifier.
    pub user_hash: String,
    /// One-way hash of the request content.
    pub content_hash: String,
    /// Decoded content length in bytes.
    pub content_length: usize,
    /// Estimated token count of the content.
    pub estimated_tokens: usize,
    /// Request path on the destination API.
    pub api_path: String,
    /// Sensitivity score, 0-100.
    pub sensitivity_score: u8,
    /// Detected category labels (`["none"]` when clean).
    pub categories: Vec<String>,
    /// Whether any category was detected.
    pub policy_violation: bool,
    /// Risk tier label.
    pub risk_category: String,
    /// Ordered evidence strings from the classifier.
    pub details: Vec<String>,
    /// Event creation time.
    pub timestamp: DateTime<Utc>,
    /// Raw content; present only under full-audit mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Set when the exchange was rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
    /// Enforcement action applied, when any ("monitor", "warn", "redact", "block").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforcement_action: Option<String>,
    /// Number of uploaded files, for attachment exchanges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<usize>,
    /// Uploaded file names, for attachment exchanges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_names: Option<Vec<String>>,
    /// Uploaded file content types, for attachment exchanges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_types: Option<Vec<String>>,
}

/// Inputs for building one activity event.
pub struct ExchangeRecord<'a> {
    /// Destination hostname.
    pub host: &'a str,
    /// Request path.
    pub api_path: &'a str,
    /// User identifier (hashed unless full audit).
    pub user: &'a str,
    /// Decoded request content.
    pub content: &'a str,
    /// Classification of the content.
    pub classification: &'a Classification,
    /// Enforcement action applied, when any.
    pub enforcement_action: Option<&'a str>,
    /// Whether the exchange was rejected.
    pub blocked: bool,
    /// Retain raw content instead of hashes.
    pub full_audit: bool,
    /// Attachment metadata: (name, content type) per file.
    pub files: Option<&'a [(String, String)]>,
}

impl ActivityEvent {
    /// Build an event from one exchange.
    pub fn from_exchange(record: ExchangeRecord<'_>) -> Self {
        let files = record.files;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool_for_domain(record.host),
            tool_domain: record.host.to_string(),
            user_hash: hash_identifier(record.user),
            content_hash: hash_identifier(record.content),
            content_length: record.content.len(),
            estimated_tokens: estimate_tokens(record.content),
            api_path: record.api_path.to_string(),
            sensitivity_score: record.classification.sensitivity_score,
            categories: record
                .classification
                .category_labels()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            policy_violation: record.classification.policy_violation,
            risk_category: record.classification.risk_category.as_str().to_string(),
            details: record.classification.details.clone(),
            timestamp: Utc::now(),
            content: record.full_audit.then(|| record.content.to_string()),
            blocked: record.blocked.then_some(true),
            enforcement_action: record.enforcement_action.map(String::from),
            file_count: files.map(|f| f.len()),
            file_names: files.map(|f| f.iter().map(|(n, _)| n.clone()).collect()),
            file_types: files.map(|f| f.iter().map(|(_, t)| t.clone()).collect()),
        }
    }
}

/// One-way hash of an identifying field (hex-encoded SHA-256).
pub fn hash_identifier(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Deterministic token estimate (4 bytes per token heuristic).
pub fn estimate_tokens(content: &str) -> usize {
    content.len().div_ceil(4)
}

/// Map an inspected hostname onto its tool label.
pub fn tool_for_domain(host: &str) -> String {
    let host = host.to_lowercase();
    let matches = |needle: &str| host == needle || host.ends_with(&format!(".{}", needle));

    let label = if matches("openai.com") || matches("chatgpt.com") {
        "chatgpt"
    } else if matches("anthropic.com") || matches("claude.ai") {
        "claude"
    } else if matches("gemini.google.com") || matches("generativelanguage.googleapis.com") {
        "gemini"
    } else if matches("githubcopilot.com") || matches("copilot.microsoft.com") {
        "copilot"
    } else if matches("perplexity.ai") {
        "perplexity"
    } else if matches("deepseek.com") {
        "deepseek"
    } else if matches("mistral.ai") {
        "mistral"
    } else if matches("x.ai") || matches("grok.com") {
        "grok"
    } else {
        return host;
    };
    label.to_string()
}

/// Queued, best-effort writer of activity events.
///
/// `record` enqueues synchronously (so per-connection ordering holds: the
/// event exists before the response goes back to the client) and a background
/// task performs the store write. Write failures are logged and dropped;
/// audit durability is the external store's concern.
#[derive(Clone)]
pub struct ActivityRecorder {
    tx: mpsc::Sender<ActivityEvent>,
}

impl ActivityRecorder {
    /// Create a recorder writing to `sink` and spawn its drain task.
    pub fn new(sink: Arc<dyn ActivitySink>, workspace: String) -> Self {
        let (tx, mut rx) = mpsc::channel::<ActivityEvent>(QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.add_event(&event, &workspace).await {
                    warn!("Failed to record activity event {}: {}", event.id, e);
                } else {
                    debug!("Recorded activity event {}", event.id);
                }
            }
        });

        Self { tx }
    }

    /// Enqueue one event. Never blocks; a full queue drops the event with a
    /// warning rather than stalling the forwarding path.
    pub fn record(&self, event: ActivityEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Activity event queue full, dropping event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn record_for<'a>(content: &'a str, classification: &'a Classification) -> ExchangeRecord<'a> {
        ExchangeRecord {
            host: "api.openai.com",
            api_path: "/v1/chat/completions",
            user: "alice",
            content,
            classification,
            enforcement_action: None,
            blocked: false,
            full_audit: false,
            files: None,
        }
    }

    #[test]
    fn test_identifiers_are_hashed_by_default() {
        let c = classify("hello");
        let event = ActivityEvent::from_exchange(record_for("hello", &c));

        assert_ne!(event.user_hash, "alice");
        assert_eq!(event.user_hash.len(), 64);
        assert!(event.content.is_none());
        assert_eq!(event.content_hash, hash_identifier("hello"));
    }

    #[test]
    fn test_full_audit_retains_content() {
        let c = classify("hello");
        let mut record = record_for("hello", &c);
        record.full_audit = true;
        let event = ActivityEvent::from_exchange(record);

        assert_eq!(event.content.as_deref(), Some("hello"));
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_identifier("alice"), hash_identifier("alice"));
        assert_ne!(hash_identifier("alice"), hash_identifier("bob"));
    }

    #[test]
    fn test_blocked_event_fields() {
        let c = classify("SSN 123-45-6789");
        let mut record = record_for("SSN 123-45-6789", &c);
        record.enforcement_action = Some("block");
        record.blocked = true;
        let event = ActivityEvent::from_exchange(record);

        assert_eq!(event.blocked, Some(true));
        assert_eq!(event.enforcement_action.as_deref(), Some("block"));
        assert!(event.policy_violation);
        assert_eq!(event.risk_category, "critical");
    }

    #[test]
    fn test_clean_event_serializes_without_optionals() {
        let c = classify("hello");
        let event = ActivityEvent::from_exchange(record_for("hello", &c));
        let json = serde_json::to_string(&event).unwrap();

        assert!(!json.contains("\"blocked\""));
        assert!(!json.contains("\"enforcement_action\""));
        assert!(!json.contains("\"content\":"));
        assert!(json.contains("\"categories\":[\"none\"]"));
    }

    #[test]
    fn test_attachment_metadata() {
        let c = classify("x");
        let files = vec![
            ("w2.pdf".to_string(), "application/pdf".to_string()),
            ("notes.txt".to_string(), "text/plain".to_string()),
        ];
        let mut record = record_for("x", &c);
        record.files = Some(&files);
        let event = ActivityEvent::from_exchange(record);

        assert_eq!(event.file_count, Some(2));
        assert_eq!(
            event.file_names.as_deref(),
            Some(&["w2.pdf".to_string(), "notes.txt".to_string()][..])
        );
    }

    #[test]
    fn test_tool_mapping() {
        assert_eq!(tool_for_domain("api.openai.com"), "chatgpt");
        assert_eq!(tool_for_domain("claude.ai"), "claude");
        assert_eq!(tool_for_domain("api.anthropic.com"), "claude");
        assert_eq!(tool_for_domain("api.githubcopilot.com"), "copilot");
        assert_eq!(tool_for_domain("unknown-ai.example"), "unknown-ai.example");
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn test_recorder_writes_to_sink() {
        let sink = Arc::new(MemoryStore::default());
        let recorder = ActivityRecorder::new(sink.clone(), "ws".to_string());

        let c = classify("hello");
        recorder.record(ActivityEvent::from_exchange(record_for("hello", &c)));

        // Drain task runs asynchronously.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.events().len(), 1);
    }
}
