//! Domain routing: deciding a host's disposition before any bytes are
//! decrypted.
//!
//! Every destination host is classified into one of three dispositions by
//! matching against three static sets, with precedence passthrough > bypass >
//! inspect. Hosts matching none of the sets default to passthrough: inspection
//! is allow-listed, not deny-listed, so unknown traffic keeps working.
//!
//! # Pattern Matching
//!
//! A set entry matches the host exactly or as a parent domain:
//! `openai.com` matches `openai.com` and `api.openai.com` but not
//! `notopenai.com`.
//!
//! The router is a pure lookup with no side effects; the disposition never
//! changes mid-connection.

use std::collections::HashSet;

/// Per-host interception disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Terminate TLS, decode, classify, enforce.
    Inspect,
    /// Splice raw bytes; never decrypt.
    Passthrough,
}

/// Built-in inspect set: AI tool endpoints.
const INSPECT_DOMAINS: &[&str] = &[
    "chatgpt.com",
    "chat.openai.com",
    "api.openai.com",
    "claude.ai",
    "api.anthropic.com",
    "gemini.google.com",
    "generativelanguage.googleapis.com",
    "copilot.microsoft.com",
    "api.githubcopilot.com",
    "perplexity.ai",
    "api.mistral.ai",
    "chat.deepseek.com",
    "api.deepseek.com",
    "grok.com",
    "api.x.ai",
];

/// Built-in bypass set: hosts whose desktop clients pin certificates and
/// break under interception. Inspected unless the workspace's desktop-bypass
/// setting is on.
const BYPASS_DOMAINS: &[&str] = &["cursor.sh", "api.cursor.sh", "codeium.com", "warp.dev"];

/// Built-in passthrough set: identity and token infrastructure that must
/// never be decrypted, regardless of settings.
const PASSTHROUGH_DOMAINS: &[&str] = &[
    "accounts.google.com",
    "oauth2.googleapis.com",
    "sts.googleapis.com",
    "identitytoolkit.googleapis.com",
    "securetoken.googleapis.com",
    "login.microsoftonline.com",
    "login.live.com",
    "auth.openai.com",
    "auth0.com",
    "okta.com",
    "duosecurity.com",
    "appleid.apple.com",
];

/// Domain router over the three static sets.
pub struct DomainRouter {
    inspect_exact: HashSet<String>,
    bypass_exact: HashSet<String>,
    passthrough_exact: HashSet<String>,
}

impl DomainRouter {
    /// Build a router from the built-in sets plus configured extensions.
    pub fn new(
        extra_inspect: &[String],
        extra_bypass: &[String],
        extra_passthrough: &[String],
    ) -> Self {
        let build = |builtin: &[&str], extra: &[String]| {
            builtin
                .iter()
                .map(|d| d.to_lowercase())
                .chain(extra.iter().map(|d| d.to_lowercase()))
                .collect::<HashSet<String>>()
        };

        Self {
            inspect_exact: build(INSPECT_DOMAINS, extra_inspect),
            bypass_exact: build(BYPASS_DOMAINS, extra_bypass),
            passthrough_exact: build(PASSTHROUGH_DOMAINS, extra_passthrough),
        }
    }

    /// Build a router with only the built-in sets.
    pub fn builtin() -> Self {
        Self::new(&[], &[], &[])
    }

    /// Decide the disposition for `host`.
    ///
    /// `desktop_bypass` is the workspace setting: when on, bypass-set hosts
    /// are tunneled instead of inspected. Passthrough-set membership is
    /// non-negotiable regardless of settings.
    pub fn disposition(&self, host: &str, desktop_bypass: bool) -> Disposition {
        let host = host.to_lowercase();

        if matches_set(&self.passthrough_exact, &host) {
            return Disposition::Passthrough;
        }

        if matches_set(&self.bypass_exact, &host) {
            return if desktop_bypass {
                Disposition::Passthrough
            } else {
                Disposition::Inspect
            };
        }

        if matches_set(&self.inspect_exact, &host) {
            return Disposition::Inspect;
        }

        // Unknown host: fail open to preserve connectivity.
        Disposition::Passthrough
    }
}

/// Exact or parent-domain match against a set.
fn matches_set(set: &HashSet<String>, host: &str) -> bool {
    if set.contains(host) {
        return true;
    }
    // Walk parent domains: a.b.example.com matches an entry for example.com.
    let mut rest = host;
    while let Some((_, parent)) = rest.split_once('.') {
        if set.contains(parent) {
            return true;
        }
        rest = parent;
    }
    false
}
