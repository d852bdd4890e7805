//! OS-level proxy redirect and trust-store integration.
//!
//! Platform specifics are shelled out and hidden behind two small traits so
//! the supervisor and watchdog stay platform-independent (and testable with
//! [`MockOsProxy`]). The disable path is the fail-safe the watchdog depends
//! on: it must work even when the interception engine is gone.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::atomic::AtomicUsize;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from OS integration commands.
#[derive(Debug, Error)]
pub enum OsIntegrationError {
    /// The platform command could not be executed.
    #[error("OS command failed to run: {0}")]
    Exec(#[from] std::io::Error),

    /// The platform command ran but reported failure.
    #[error("OS command '{command}' failed: {stderr}")]
    Command {
        /// The command that failed.
        command: String,
        /// Captured stderr.
        stderr: String,
    },
}

/// Control of the host's network-proxy redirect.
pub trait OsProxy: Send + Sync {
    /// Point the OS proxy configuration at the local interception port.
    fn enable_proxy(&self, port: u16) -> Result<(), OsIntegrationError>;

    /// Revert the OS proxy configuration. The fail-safe path; must succeed
    /// without the engine being alive.
    fn disable_proxy(&self) -> Result<(), OsIntegrationError>;

    /// Whether the OS proxy redirect is currently enabled.
    fn is_proxy_enabled(&self) -> Result<bool, OsIntegrationError>;
}

/// Root CA installation in the OS trust store.
pub trait TrustStore: Send + Sync {
    /// Install the root certificate into the OS trust store.
    fn trust_ca(&self, cert_path: &Path) -> Result<(), OsIntegrationError>;

    /// Whether the root certificate is already trusted (used to skip
    /// redundant privileged prompts).
    fn is_ca_trusted(&self) -> Result<bool, OsIntegrationError>;
}

/// Shell-out implementation for the host platform.
pub struct SystemIntegration;

fn run(command: &mut Command) -> Result<String, OsIntegrationError> {
    let rendered = format!("{:?}", command);
    debug!("Running OS command: {}", rendered);
    let output = command.output()?;
    if !output.status.success() {
        return Err(OsIntegrationError::Command {
            command: rendered,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(target_os = "macos")]
impl OsProxy for SystemIntegration {
    fn enable_proxy(&self, port: u16) -> Result<(), OsIntegrationError> {
        for service in list_network_services()? {
            run(Command::new("networksetup").args([
                "-setwebproxy",
                &service,
                "127.0.0.1",
                &port.to_string(),
            ]))?;
            run(Command::new("networksetup").args([
                "-setsecurewebproxy",
                &service,
                "127.0.0.1",
                &port.to_string(),
            ]))?;
        }
        info!("OS proxy redirect enabled on port {}", port);
        Ok(())
    }

    fn disable_proxy(&self) -> Result<(), OsIntegrationError> {
        for service in list_network_services()? {
            run(Command::new("networksetup").args(["-setwebproxystate", &service, "off"]))?;
            run(Command::new("networksetup").args(["-setsecurewebproxystate", &service, "off"]))?;
        }
        info!("OS proxy redirect disabled");
        Ok(())
    }

    fn is_proxy_enabled(&self) -> Result<bool, OsIntegrationError> {
        for service in list_network_services()? {
            let out = run(Command::new("networksetup").args(["-getsecurewebproxy", &service]))?;
            if out.lines().any(|l| l.trim() == "Enabled: Yes") {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(target_os = "macos")]
fn list_network_services() -> Result<Vec<String>, OsIntegrationError> {
    let out = run(Command::new("networksetup").arg("-listallnetworkservices"))?;
    Ok(out
        .lines()
        .skip(1) // banner line
        .filter(|l| !l.starts_with('*') && !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .collect())
}

#[cfg(target_os = "macos")]
impl TrustStore for SystemIntegration {
    fn trust_ca(&self, cert_path: &Path) -> Result<(), OsIntegrationError> {
        run(Command::new("security").args([
            "add-trusted-cert",
            "-d",
            "-r",
            "trustRoot",
            "-k",
            "/Library/Keychains/System.keychain",
            &cert_path.display().to_string(),
        ]))?;
        info!("Root CA installed into system trust store");
        Ok(())
    }

    fn is_ca_trusted(&self) -> Result<bool, OsIntegrationError> {
        let result = Command::new("security")
            .args([
                "find-certificate",
                "-c",
                "PromptGuard Root CA",
                "/Library/Keychains/System.keychain",
            ])
            .output()?;
        Ok(result.status.success())
    }
}

#[cfg(not(target_os = "macos"))]
impl OsProxy for SystemIntegration {
    fn enable_proxy(&self, port: u16) -> Result<(), OsIntegrationError> {
        run(Command::new("gsettings").args([
            "set",
            "org.gnome.system.proxy",
            "mode",
            "'manual'",
        ]))?;
        for schema in ["http", "https"] {
            run(Command::new("gsettings").args([
                "set",
                &format!("org.gnome.system.proxy.{}", schema),
                "host",
                "127.0.0.1",
            ]))?;
            run(Command::new("gsettings").args([
                "set",
                &format!("org.gnome.system.proxy.{}", schema),
                "port",
                &port.to_string(),
            ]))?;
        }
        info!("OS proxy redirect enabled on port {}", port);
        Ok(())
    }

    fn disable_proxy(&self) -> Result<(), OsIntegrationError> {
        run(Command::new("gsettings").args(["set", "org.gnome.system.proxy", "mode", "'none'"]))?;
        info!("OS proxy redirect disabled");
        Ok(())
    }

    fn is_proxy_enabled(&self) -> Result<bool, OsIntegrationError> {
        let out = run(Command::new("gsettings").args(["get", "org.gnome.system.proxy", "mode"]))?;
        Ok(out.contains("manual"))
    }
}

#[cfg(not(target_os = "macos"))]
impl TrustStore for SystemIntegration {
    fn trust_ca(&self, cert_path: &Path) -> Result<(), OsIntegrationError> {
        let dest = Path::new("/usr/local/share/ca-certificates/promptguard-root.crt");
        std::fs::copy(cert_path, dest)?;
        run(&mut Command::new("update-ca-certificates"))?;
        info!("Root CA installed into system trust store");
        Ok(())
    }

    fn is_ca_trusted(&self) -> Result<bool, OsIntegrationError> {
        Ok(Path::new("/usr/local/share/ca-certificates/promptguard-root.crt").exists())
    }
}

/// In-memory fake for tests: tracks proxy state and call counts.
#[derive(Default)]
pub struct MockOsProxy {
    enabled: AtomicBool,
    trusted: AtomicBool,
    /// Number of disable_proxy calls observed.
    pub disable_calls: AtomicUsize,
    /// Number of trust_ca calls observed.
    pub trust_calls: AtomicUsize,
}

impl OsProxy for MockOsProxy {
    fn enable_proxy(&self, _port: u16) -> Result<(), OsIntegrationError> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable_proxy(&self) -> Result<(), OsIntegrationError> {
        self.enabled.store(false, Ordering::SeqCst);
        self.disable_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_proxy_enabled(&self) -> Result<bool, OsIntegrationError> {
        Ok(self.enabled.load(Ordering::SeqCst))
    }
}

impl TrustStore for MockOsProxy {
    fn trust_ca(&self, _cert_path: &Path) -> Result<(), OsIntegrationError> {
        self.trusted.store(true, Ordering::SeqCst);
        self.trust_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_ca_trusted(&self) -> Result<bool, OsIntegrationError> {
        Ok(self.trusted.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_proxy_state() {
        let mock = MockOsProxy::default();
        assert!(!mock.is_proxy_enabled().unwrap());

        mock.enable_proxy(18080).unwrap();
        assert!(mock.is_proxy_enabled().unwrap());

        mock.disable_proxy().unwrap();
        assert!(!mock.is_proxy_enabled().unwrap());
        assert_eq!(mock.disable_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mock_trust_store() {
        let mock = MockOsProxy::default();
        assert!(!mock.is_ca_trusted().unwrap());

        mock.trust_ca(Path::new("/tmp/root.crt")).unwrap();
        assert!(mock.is_ca_trusted().unwrap());
        assert_eq!(mock.trust_calls.load(Ordering::SeqCst), 1);
    }
}
