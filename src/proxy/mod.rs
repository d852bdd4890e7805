//! The traffic interception engine.
//!
//! This module implements the in-line proxy that AI-tool traffic is routed
//! through on a managed endpoint:
//!
//! - HTTP CONNECT handling on a fixed local port
//! - Domain routing (inspect / bypass / passthrough) before any decryption
//! - TLS termination with leaves chained to the local root CA
//! - Single-request HTTP/1.1 decode with raw-tunnel fallback
//! - Content classification and policy enforcement on the decoded body
//! - Upstream reconnection with full certificate validation
//!
//! # Architecture
//!
//! ```text
//!  AI client ──CONNECT──▶ ProxyServer ──▶ DomainRouter
//!                              │               │
//!                              │        inspect│          passthrough
//!                              ▼               ▼               ▼
//!                        intercept:      leaf issue,      raw splice
//!                        decode ▶ classify ▶ enforce      (no decode)
//!                              │
//!                              ▼
//!                        upstream TLS (validated) + annotated response
//! ```
//!
//! Each connection runs in its own task on the engine's single-process
//! reactor; the certificate cache and the settings snapshot are the only
//! cross-connection state.

pub mod connect;
pub mod error;
pub mod intercept;
pub mod router;
pub mod server;
pub mod tls;

pub use error::{ProxyError, ProxyResult};
pub use router::{DomainRouter, Disposition};
pub use server::{run_engine, ExchangeContext, ProxyServer};
pub use tls::{create_tls_acceptor, create_tls_connector, CertificateCache};
