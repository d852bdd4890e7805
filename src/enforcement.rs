//! Enforcement policy: mode resolution and the verdict decision table.
//!
//! The policy engine is a pure function from (classification, enforcement
//! mode, risk threshold) to a verdict. Only critical-tier violations ever
//! obstruct traffic; lower tiers are logged but forwarded untouched.
//!
//! # Decision Table
//!
//! | condition                        | monitor | warn | redact | block |
//! |----------------------------------|---------|------|--------|-------|
//! | score < threshold                | Allow   | Allow| Allow  | Allow |
//! | score >= threshold, critical     | Monitor | Warn | Redact | Block |
//! | score >= threshold, not critical | Monitor | Monitor | Monitor | Monitor |
//!
//! Redaction is the policy engine's side effect: the outgoing body is
//! rewritten here, not in the TLS engine. Block short-circuits before any
//! upstream connection is opened.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::classifier::{self, Classification, RiskCategory};
use crate::config::ProxySettings;

/// The organization's enforcement stance for a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Log only; never obstruct traffic.
    Monitor,
    /// Flag critical traffic with a soft, overridable signal.
    Warn,
    /// Rewrite detected sensitive spans before forwarding.
    Redact,
    /// Reject critical traffic outright.
    Block,
}

impl EnforcementMode {
    /// Stable label used in audit records and diagnostic headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementMode::Monitor => "monitor",
            EnforcementMode::Warn => "warn",
            EnforcementMode::Redact => "redact",
            EnforcementMode::Block => "block",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "monitor" => Some(EnforcementMode::Monitor),
            "warn" => Some(EnforcementMode::Warn),
            "redact" => Some(EnforcementMode::Redact),
            "block" => Some(EnforcementMode::Block),
            _ => None,
        }
    }
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the active enforcement mode from workspace settings.
///
/// The canonical `enforcement_mode` field wins when present and valid. Legacy
/// workspaces carry only the boolean pair, which derives:
/// `block_high_risk` -> block, `redact_sensitive` -> redact, else monitor.
/// An invalid or unset mode defaults to monitor: fail toward visibility, not
/// silence.
pub fn resolve_enforcement_mode(settings: &ProxySettings) -> EnforcementMode {
    if let Some(ref mode) = settings.enforcement_mode {
        if let Some(parsed) = EnforcementMode::parse(mode) {
            return parsed;
        }
    }

    if settings.block_high_risk == Some(true) {
        EnforcementMode::Block
    } else if settings.redact_sensitive == Some(true) {
        EnforcementMode::Redact
    } else {
        EnforcementMode::Monitor
    }
}

/// The outcome of enforcement for one exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Below threshold; forward unmodified, no action recorded.
    Allow,
    /// At or above threshold but not actionable; forward and log.
    Monitor,
    /// Critical content under warn mode: forward, then signal the caller.
    Warn {
        /// Human-readable reason for the flag.
        reason: String,
    },
    /// Critical content under redact mode: forward the rewritten body.
    Redact {
        /// The body with sensitive spans replaced.
        body: String,
        /// Number of spans replaced.
        spans: usize,
        /// Human-readable reason for the rewrite.
        reason: String,
    },
    /// Critical content under block mode: reject without contacting upstream.
    Block {
        /// Human-readable reason for the rejection.
        reason: String,
    },
}

impl Verdict {
    /// Stable action label recorded on activity events; None for Allow.
    pub fn action(&self) -> Option<&'static str> {
        match self {
            Verdict::Allow => None,
            Verdict::Monitor => Some("monitor"),
            Verdict::Warn { .. } => Some("warn"),
            Verdict::Redact { .. } => Some("redact"),
            Verdict::Block { .. } => Some("block"),
        }
    }

    /// Whether this verdict rejects the exchange.
    pub fn is_block(&self) -> bool {
        matches!(self, Verdict::Block { .. })
    }
}

/// Apply the decision table to one classified exchange.
///
/// `body` is the decoded request body; it is only consulted (and rewritten)
/// when the verdict is Redact.
pub fn decide(
    classification: &Classification,
    mode: EnforcementMode,
    threshold: u8,
    body: &str,
) -> Verdict {
    if classification.sensitivity_score < threshold {
        return Verdict::Allow;
    }

    if classification.risk_category != RiskCategory::Critical {
        return Verdict::Monitor;
    }

    let reason = violation_reason(classification);

    let verdict = match mode {
        EnforcementMode::Monitor => Verdict::Monitor,
        EnforcementMode::Warn => Verdict::Warn { reason },
        EnforcementMode::Redact => {
            let (redacted, spans) = classifier::redact(body);
            Verdict::Redact {
                body: redacted,
                spans,
                reason,
            }
        }
        EnforcementMode::Block => Verdict::Block { reason },
    };

    info!(
        event = "enforcement_decision",
        mode = %mode,
        action = verdict.action().unwrap_or("monitor"),
        score = classification.sensitivity_score,
        risk = classification.risk_category.as_str(),
        "enforcement decision"
    );

    verdict
}

/// Build the reason string surfaced on warn/redact/block responses.
fn violation_reason(classification: &Classification) -> String {
    format!(
        "sensitive content detected (score {}, {} risk): {}",
        classification.sensitivity_score,
        classification.risk_category.as_str(),
        classification.category_labels().join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;

    fn settings_with_mode(mode: Option<&str>) -> ProxySettings {
        ProxySettings {
            enforcement_mode: mode.map(String::from),
            ..ProxySettings::default()
        }
    }

    #[test]
    fn test_canonical_mode_wins() {
        let settings = ProxySettings {
            enforcement_mode: Some("block".to_string()),
            block_high_risk: Some(false),
            redact_sensitive: Some(true),
            ..ProxySettings::default()
        };
        assert_eq!(resolve_enforcement_mode(&settings), EnforcementMode::Block);
    }

    #[test]
    fn test_legacy_block_fallback() {
        let settings = ProxySettings {
            enforcement_mode: None,
            block_high_risk: Some(true),
            ..ProxySettings::default()
        };
        assert_eq!(resolve_enforcement_mode(&settings), EnforcementMode::Block);
    }

    #[test]
    fn test_legacy_redact_fallback() {
        let settings = ProxySettings {
            enforcement_mode: None,
            redact_sensitive: Some(true),
            ..ProxySettings::default()
        };
        assert_eq!(resolve_enforcement_mode(&settings), EnforcementMode::Redact);
    }

    #[test]
    fn test_invalid_mode_defaults_to_monitor() {
        assert_eq!(
            resolve_enforcement_mode(&settings_with_mode(Some("obliterate"))),
            EnforcementMode::Monitor
        );
        assert_eq!(
            resolve_enforcement_mode(&settings_with_mode(None)),
            EnforcementMode::Monitor
        );
    }

    #[test]
    fn test_invalid_canonical_falls_back_to_legacy() {
        let settings = ProxySettings {
            enforcement_mode: Some("nonsense".to_string()),
            block_high_risk: Some(true),
            ..ProxySettings::default()
        };
        assert_eq!(resolve_enforcement_mode(&settings), EnforcementMode::Block);
    }

    #[test]
    fn test_below_threshold_is_allow_in_every_mode() {
        let c = classify("reach me at bob@example.com"); // score 15
        for mode in [
            EnforcementMode::Monitor,
            EnforcementMode::Warn,
            EnforcementMode::Redact,
            EnforcementMode::Block,
        ] {
            assert_eq!(decide(&c, mode, 50, "x"), Verdict::Allow);
        }
    }

    #[test]
    fn test_critical_block() {
        let body = "SSN 123-45-6789";
        let c = classify(body);
        let verdict = decide(&c, EnforcementMode::Block, 50, body);
        assert!(verdict.is_block());
        assert_eq!(verdict.action(), Some("block"));
    }

    #[test]
    fn test_critical_warn() {
        let body = "SSN 123-45-6789";
        let c = classify(body);
        match decide(&c, EnforcementMode::Warn, 50, body) {
            Verdict::Warn { reason } => assert!(reason.contains("pii")),
            other => panic!("expected Warn, got {:?}", other),
        }
    }

    #[test]
    fn test_critical_redact_rewrites_body() {
        let body = "please use card 4111 1111 1111 1111 for this";
        let c = classify(body);
        match decide(&c, EnforcementMode::Redact, 50, body) {
            Verdict::Redact { body, spans, .. } => {
                assert_eq!(spans, 1);
                assert!(body.contains("[REDACTED]"));
                assert!(!body.contains("4111"));
            }
            other => panic!("expected Redact, got {:?}", other),
        }
    }

    #[test]
    fn test_redacted_body_passes_reclassification() {
        let body = "SSN 123-45-6789 and card 4111 1111 1111 1111";
        let c = classify(body);
        let verdict = decide(&c, EnforcementMode::Redact, 50, body);
        if let Verdict::Redact { body: redacted, .. } = verdict {
            let rescanned = classify(&redacted);
            assert!(!rescanned.policy_violation);
        } else {
            panic!("expected Redact");
        }
    }

    #[test]
    fn test_non_critical_is_monitor_even_in_block_mode() {
        // IBAN alone: financial only, score 50, high tier, no override.
        let body = "wire to DE44500105175407324931 today";
        let c = classify(body);
        assert_eq!(c.risk_category, RiskCategory::High);
        assert_eq!(decide(&c, EnforcementMode::Block, 50, body), Verdict::Monitor);
    }

    #[test]
    fn test_monitor_mode_never_obstructs() {
        let body = "SSN 123-45-6789";
        let c = classify(body);
        assert_eq!(decide(&c, EnforcementMode::Monitor, 50, body), Verdict::Monitor);
    }
}
