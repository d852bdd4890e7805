//! TLS plumbing for the interception engine.
//!
//! This module provides:
//! - Certificate caching so each inspected hostname pays leaf synthesis once
//! - Dynamic certificate resolution using SNI (with a CONNECT-derived hint)
//! - TLS acceptor for client connections (engine as server)
//! - TLS connector for upstream connections (engine as client, full
//!   certificate validation against the system roots)
//!
//! # Critical ALPN Note
//!
//! We **must** force HTTP/1.1 via ALPN on the client side. If we allow HTTP/2
//! negotiation, modern clients will upgrade to H2 after the handshake and the
//! single-request decode path doesn't understand H2 framing.

use super::error::ProxyError;
use crate::ca::CertificateAuthority;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, trace};

/// Certificate cache for TLS interception.
///
/// Leaves are generated lazily on the first inspect of a hostname and cached
/// for the process lifetime (they are never persisted; only the root CA is).
/// The map is read-mostly and append-only per hostname, so concurrent lookups
/// on the hot path take the read lock.
pub struct CertificateCache {
    /// Cache of hostname -> certified key.
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    /// The certificate authority issuing leaves.
    ca: Arc<CertificateAuthority>,
}

impl CertificateCache {
    /// Create a new certificate cache backed by `ca`.
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ca,
        }
    }

    /// Get or issue a certificate for the given hostname.
    pub fn get_or_issue(&self, hostname: &str) -> Result<Arc<CertifiedKey>, ProxyError> {
        let host_lower = hostname.to_lowercase();

        {
            let cache = self.cache.read().unwrap();
            if let Some(key) = cache.get(&host_lower) {
                trace!("Certificate cache hit for {}", hostname);
                return Ok(key.clone());
            }
        }

        debug!("Issuing certificate for {}", hostname);

        let leaf = self.ca.issue_leaf(&host_lower)?;

        let cert_chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ProxyError::Tls(format!("Failed to parse leaf PEM: {}", e)))?;

        if cert_chain.is_empty() {
            return Err(ProxyError::Tls("No certificates found in leaf PEM".into()));
        }

        let private_key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
                .map_err(|e| ProxyError::Tls(format!("Failed to parse leaf key PEM: {}", e)))?
                .ok_or_else(|| ProxyError::Tls("No private key found in leaf PEM".into()))?;

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
            .map_err(|e| ProxyError::Tls(format!("Failed to create signing key: {}", e)))?;

        let certified_key = Arc::new(CertifiedKey::new(cert_chain, signing_key));

        {
            let mut cache = self.cache.write().unwrap();
            cache.insert(host_lower, certified_key.clone());
        }

        Ok(certified_key)
    }

    /// Get the number of cached certificates.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.read().unwrap().is_empty()
    }
}

/// Certificate resolver that issues certificates on demand.
///
/// Implements rustls's `ResolvesServerCert` to pick a leaf based on the SNI
/// in the ClientHello, falling back to the CONNECT-derived hostname for
/// SNI-less clients.
pub struct DynamicCertResolver {
    cache: Arc<CertificateCache>,
    /// Hostname from the CONNECT request, for SNI-less clients.
    domain_hint: String,
}

impl DynamicCertResolver {
    /// Create a resolver with the CONNECT-derived hostname hint.
    pub fn new(cache: Arc<CertificateCache>, domain_hint: String) -> Self {
        Self { cache, domain_hint }
    }
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let domain = client_hello
            .server_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.domain_hint.clone());

        trace!("Resolving certificate for: {}", domain);

        match self.cache.get_or_issue(&domain) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("Failed to issue certificate for {}: {}", domain, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("domain_hint", &self.domain_hint)
            .field("cache_size", &self.cache.len())
            .finish()
    }
}

/// Create a TLS acceptor for client connections.
///
/// The engine acts as the server, presenting leaves chained to the local
/// root. HTTP/1.1 is forced via ALPN (see module docs).
pub fn create_tls_acceptor(
    cert_cache: Arc<CertificateCache>,
    domain_hint: String,
) -> TlsAcceptor {
    let resolver: Arc<dyn ResolvesServerCert> =
        Arc::new(DynamicCertResolver::new(cert_cache, domain_hint));

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsAcceptor::from(Arc::new(config))
}

/// Create a TLS connector for upstream connections.
///
/// The engine acts as a client, verifying the upstream certificate against
/// the system root store. No pinning bypass: upstream validation is standard.
pub fn create_tls_connector() -> Result<TlsConnector, ProxyError> {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();

    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }

    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        return Err(ProxyError::Tls("No system root certificates found".into()));
    }

    debug!("Loaded {} root certificates", root_store.len());

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a hostname to a ServerName for the upstream TLS connection.
pub fn domain_to_server_name(domain: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> (tempfile::TempDir, Arc<CertificateAuthority>) {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::get_or_create(dir.path()).unwrap();
        (dir, Arc::new(ca))
    }

    #[test]
    fn test_certificate_cache_creation() {
        let (_dir, ca) = test_ca();
        let cache = CertificateCache::new(ca);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_certificate_issuance_and_caching() {
        let (_dir, ca) = test_ca();
        let cache = CertificateCache::new(ca);

        let key1 = cache.get_or_issue("chat.example.com").unwrap();
        assert_eq!(cache.len(), 1);

        let key2 = cache.get_or_issue("chat.example.com").unwrap();
        assert_eq!(cache.len(), 1);

        // Same Arc: no regeneration on cache hit.
        assert!(Arc::ptr_eq(&key1, &key2));
    }

    #[test]
    fn test_certificate_cache_case_insensitive() {
        let (_dir, ca) = test_ca();
        let cache = CertificateCache::new(ca);

        cache.get_or_issue("chat.example.com").unwrap();
        cache.get_or_issue("CHAT.EXAMPLE.COM").unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_tls_acceptor_creation() {
        let (_dir, ca) = test_ca();
        let cache = Arc::new(CertificateCache::new(ca));
        let _acceptor = create_tls_acceptor(cache, "chat.example.com".into());
    }

    #[test]
    fn test_domain_to_server_name() {
        assert!(domain_to_server_name("example.com").is_ok());
        assert!(domain_to_server_name("api.example.com").is_ok());
        assert!(domain_to_server_name("").is_err());
    }
}
