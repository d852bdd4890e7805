//! HTTP CONNECT method handling.
//!
//! Clients reach the engine with standard proxy semantics:
//!
//! 1. Client sends: `CONNECT api.example.com:443 HTTP/1.1`
//! 2. The domain router decides the disposition before any bytes are
//!    decrypted
//! 3. Inspect hosts get `200 Connection Established`, then the TLS
//!    interception path in [`super::intercept`]
//! 4. Passthrough hosts get a raw byte tunnel with no decoding
//!
//! Certificate issuance failure degrades the exchange to passthrough rather
//! than failing it: interception is best-effort, connectivity is not.

use super::error::ProxyError;
use super::intercept::intercept_exchange;
use super::router::Disposition;
use super::server::ExchangeContext;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Handle an HTTP CONNECT request.
pub async fn handle_connect(
    req: Request<Incoming>,
    ctx: Arc<ExchangeContext>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let target = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidConnect("Missing authority in CONNECT request".into()))?
        .to_string();

    let (host, port) = parse_host_port(&target)?;

    debug!("CONNECT request to {}:{}", host, port);

    let settings = ctx.settings_rx.borrow().clone();

    // Disposition is decided up front and never changes mid-connection.
    // A disabled proxy or unavailable CA degrades everything to passthrough.
    let disposition = if !settings.proxy_enabled || ctx.cert_cache.is_none() {
        Disposition::Passthrough
    } else {
        ctx.router.disposition(&host, settings.desktop_bypass)
    };

    match disposition {
        Disposition::Inspect => {
            // Issue the leaf before committing to termination: if issuance
            // fails, this exchange degrades to passthrough instead of dying
            // mid-handshake. Interception is best-effort.
            let issued = match ctx.cert_cache.as_ref() {
                Some(cache) => cache.get_or_issue(&host),
                None => Err(ProxyError::Tls("certificate authority unavailable".into())),
            };
            if let Err(e) = issued {
                warn!(
                    "Leaf issuance failed for {} ({}), tunneling this exchange",
                    host, e
                );
                return establish_passthrough(req, host, port).await;
            }

            info!("Inspecting connection to {}:{}", host, port);
            establish_intercept(req, host, port, ctx).await
        }
        Disposition::Passthrough => {
            debug!("Tunneling connection to {}:{}", host, port);
            establish_passthrough(req, host, port).await
        }
    }
}

/// Upgrade the CONNECT and run the interception exchange on it.
async fn establish_intercept(
    req: Request<Incoming>,
    host: String,
    port: u16,
    ctx: Arc<ExchangeContext>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = intercept_exchange(upgraded, &host, port, ctx).await {
                    // Connection resets are routine; anything else is worth a warning.
                    let message = e.to_string();
                    if message.contains("reset") || message.contains("broken pipe") {
                        debug!("Intercept ended for {}:{}: {}", host, port, e);
                    } else {
                        warn!("Intercept error for {}:{}: {}", host, port, e);
                    }
                }
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}:{}: {}", host, port, e);
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .unwrap())
}

/// Upgrade the CONNECT and splice raw bytes with the upstream.
async fn establish_passthrough(
    req: Request<Incoming>,
    host: String,
    port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = tunnel_raw(upgraded, &host, port).await {
                    debug!("Tunnel ended for {}:{}: {}", host, port, e);
                }
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}:{}: {}", host, port, e);
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .unwrap())
}

/// Pure bidirectional copy between client and upstream; no decryption.
async fn tunnel_raw(upgraded: Upgraded, host: &str, port: u16) -> Result<(), ProxyError> {
    let upstream_addr = format!("{}:{}", host, port);
    let upstream =
        TcpStream::connect(&upstream_addr)
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                addr: upstream_addr.clone(),
                message: e.to_string(),
            })?;

    debug!("Connected to upstream {}:{}", host, port);

    let client = TokioIo::new(upgraded);
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async { tokio::io::copy(&mut client_read, &mut upstream_write).await };
    let upstream_to_client = async { tokio::io::copy(&mut upstream_read, &mut client_write).await };

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                debug!("Client->upstream copy ended: {}", e);
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                debug!("Upstream->client copy ended: {}", e);
            }
        }
    }

    debug!("Tunnel closed for {}:{}", host, port);
    Ok(())
}

/// Parse host:port string from CONNECT authority.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", 443) (default port)
fn parse_host_port(authority: &str) -> Result<(String, u16), ProxyError> {
    if let Some((host, port_str)) = authority.rsplit_once(':') {
        // IPv6 literal like [::1]:443
        if host.starts_with('[') && host.ends_with(']') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidConnect(format!("Invalid port: {}", port_str)))?;
            let ipv6_host = &host[1..host.len() - 1];
            return Ok((ipv6_host.to_string(), port));
        }

        let port = port_str
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidConnect(format!("Invalid port: {}", port_str)))?;
        Ok((host.to_string(), port))
    } else {
        Ok((authority.to_string(), 443))
    }
}

/// Handle a plain (non-CONNECT) HTTP proxy request.
///
/// AI endpoints are HTTPS-only; plain HTTP through the proxy is legacy
/// traffic and is forwarded without interception.
pub async fn handle_http(
    req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;

    let host = req
        .uri()
        .host()
        .ok_or_else(|| ProxyError::InvalidConnect("Missing host in request URI".into()))?
        .to_string();

    debug!("Plain HTTP proxy request to {}", host);

    let client: Client<_, Incoming> = Client::builder(TokioExecutor::new()).build_http();

    let response = client
        .request(req)
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: host,
            message: e.to_string(),
        })?;

    Ok(response.map(|body| body.boxed()))
}

/// Create an empty response body.
fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Create a response body with content.
#[allow(dead_code)]
fn full_body(content: String) -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_port() {
        let (host, port) = parse_host_port("api.example.com:443").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_host_port_custom_port() {
        let (host, port) = parse_host_port("api.example.com:8443").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_parse_host_port_default() {
        let (host, port) = parse_host_port("api.example.com").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_host_port_invalid_port() {
        assert!(parse_host_port("api.example.com:invalid").is_err());
    }

    #[test]
    fn test_parse_host_port_ipv6() {
        let (host, port) = parse_host_port("[::1]:443").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
    }
}
