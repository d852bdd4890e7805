//! promptguard: endpoint DLP proxy for AI tools
//!
//! This crate gives an organization real-time data-loss-prevention control
//! over unmanaged AI tool usage, without cooperation from the AI vendor. It
//! intercepts outbound AI-tool traffic on a managed endpoint, decrypts it
//! transparently using a locally trusted root CA, classifies the content for
//! sensitive-data exposure, and enforces the workspace policy (allow, warn,
//! redact, or block) before forwarding to the real destination.
//!
//! # Architecture
//!
//! - **Supervisor**: spawns the interception engine as an independent OS
//!   process, owns the OS proxy redirect and CA trust installation, and runs
//!   the watchdog whose fail-safe keeps a dead engine from taking the host's
//!   connectivity with it
//! - **Proxy**: CONNECT-style engine with per-host dispositions, TLS
//!   termination, and single-request decode
//! - **CA**: persistent root, in-memory leaf issuance
//! - **Classifier**: deterministic local pattern/entropy scanning
//! - **Enforcement**: pure decision table over classification and settings
//! - **Recorder**: one hashed-by-default activity event per exchange
//! - **Store**: narrow interface to the external settings/activity backend
//!
//! # Failure Bias
//!
//! Interception fails open: unknown hosts pass through, certificate trouble
//! degrades to tunneling, and a dead engine triggers the OS-proxy disable.
//! The user can lose inspection coverage; they must never lose the internet.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod enforcement;
pub mod proxy;
pub mod recorder;
pub mod store;
pub mod supervisor;
