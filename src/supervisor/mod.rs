//! Process supervision for the interception engine.
//!
//! The supervisor runs in its own process, spawns the engine as an
//! independent OS process, and owns the two pieces of host state the engine
//! must never be trusted with: the OS proxy redirect and the root CA trust
//! installation. A fault inside the engine (say, a crash decoding hostile
//! TLS) cannot corrupt the supervisor's ability to perform the fail-safe
//! disable.
//!
//! The watchdog loop probes the engine port on a fixed interval whenever OS
//! proxying is enabled. A failed probe disables the OS proxy *before* any
//! repair is attempted, emits a rate-limited high-severity alert, and then
//! tries a restart. Failure degrades to "no interception", never to "no
//! internet".

pub mod osproxy;
pub mod process;
pub mod watchdog;

pub use osproxy::{MockOsProxy, OsIntegrationError, OsProxy, SystemIntegration, TrustStore};
pub use process::{EngineProcess, ProcessError};
pub use watchdog::{ProxyProcessState, WatchdogAction, WatchdogState};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::ca::ROOT_CERT_FILE;
use crate::config::{Config, EngineConfig};
use crate::store::{ActivitySink, Alert};

/// How long stop() waits for a graceful exit before force-killing.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Interval between port polls during startup.
const STARTUP_POLL: Duration = Duration::from_millis(200);

/// Timeout for a single liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor for the interception engine process.
pub struct Supervisor {
    engine_config: EngineConfig,
    startup_timeout: Duration,
    watchdog_interval: Duration,
    os_proxy: Arc<dyn OsProxy>,
    trust_store: Arc<dyn TrustStore>,
    sink: Arc<dyn ActivitySink>,
    process: Option<EngineProcess>,
    watchdog: WatchdogState,
}

impl Supervisor {
    /// Build a supervisor from the merged configuration.
    pub fn new(
        config: &Config,
        os_proxy: Arc<dyn OsProxy>,
        trust_store: Arc<dyn TrustStore>,
        sink: Arc<dyn ActivitySink>,
    ) -> Self {
        let sup = &config.supervisor;
        let startup_timeout = Duration::from_secs(sup.startup_timeout_secs.max(1) as u64);
        let watchdog_interval = Duration::from_secs(sup.watchdog_interval_secs.max(1) as u64);
        let cooldown_ticks =
            (sup.alert_cooldown_secs.max(1) / sup.watchdog_interval_secs.max(1)).max(1);

        Self {
            engine_config: EngineConfig::from_supervisor(config),
            startup_timeout,
            watchdog_interval,
            os_proxy,
            trust_store,
            sink,
            process: None,
            watchdog: WatchdogState::new(cooldown_ticks),
        }
    }

    /// Current engine state as observed by the supervisor.
    pub fn state(&self) -> ProxyProcessState {
        self.watchdog.state()
    }

    /// Start the interception engine and enable OS-level redirection.
    ///
    /// A no-op when the engine port is already reachable. On success the OS
    /// proxy is pointed at the engine and the root CA is installed into the
    /// trust store (skipped when already present, to avoid redundant
    /// privileged prompts).
    pub async fn start(&mut self) -> Result<()> {
        let port = self.engine_config.listen_port;

        if probe_port(port).await {
            debug!("Engine already reachable on port {}, start is a no-op", port);
            self.watchdog.on_started();
            self.enable_host_integration()?;
            return Ok(());
        }

        self.watchdog.on_start_requested();
        info!("Starting interception engine on port {}", port);

        let process = EngineProcess::spawn(&self.engine_config)
            .context("Failed to spawn interception engine")?;
        self.process = Some(process);

        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            if probe_port(port).await {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                // Startup failure runs the fail-safe inline (never the
                // restart action, which would recurse into start()).
                for action in self.watchdog.on_start_failed() {
                    match action {
                        WatchdogAction::DisableOsProxy => self.disable_os_proxy(),
                        WatchdogAction::EmitAlert => self.emit_alert().await,
                        WatchdogAction::RestartEngine => {}
                    }
                }
                self.kill_engine();
                anyhow::bail!(
                    "Engine did not become reachable on port {} within {:?}",
                    port,
                    self.startup_timeout
                );
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }

        self.watchdog.on_started();
        self.enable_host_integration()?;

        info!("Interception engine running on port {}", port);
        Ok(())
    }

    /// Stop the engine and revert the OS proxy configuration.
    ///
    /// The disable happens synchronously and unconditionally before this
    /// method returns, even during an abrupt host shutdown.
    pub async fn stop(&mut self) {
        // Fail-safe first: never leave the OS proxy pointed at a dead port.
        for action in self.watchdog.on_stop() {
            self.execute(action).await;
        }
        if let Err(e) = self.os_proxy.disable_proxy() {
            error!("Failed to disable OS proxy during stop: {}", e);
        }

        if let Some(mut process) = self.process.take() {
            #[cfg(unix)]
            {
                if let Err(e) = process.signal(nix::sys::signal::Signal::SIGTERM) {
                    debug!("SIGTERM failed (engine may have exited): {}", e);
                }
            }

            let deadline = tokio::time::Instant::now() + STOP_GRACE;
            loop {
                match process.try_wait() {
                    Ok(Some(status)) => {
                        info!("Engine exited with {}", status);
                        break;
                    }
                    Ok(None) if tokio::time::Instant::now() >= deadline => {
                        warn!("Engine unresponsive, force-killing");
                        let _ = process.kill();
                        let _ = process.wait();
                        break;
                    }
                    Ok(None) => tokio::time::sleep(Duration::from_millis(50)).await,
                    Err(e) => {
                        warn!("Failed to wait for engine: {}", e);
                        let _ = process.kill();
                        break;
                    }
                }
            }
        }
    }

    /// Run one watchdog pass: probe the engine port if OS proxying is
    /// enabled, and execute whatever the state machine demands.
    pub async fn watchdog_tick(&mut self) {
        let proxying = match self.os_proxy.is_proxy_enabled() {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!("Cannot read OS proxy state: {}", e);
                return;
            }
        };

        if !proxying {
            return;
        }

        let reachable = probe_port(self.engine_config.listen_port).await;
        let actions = self.watchdog.on_probe(reachable);
        for action in actions {
            self.execute(action).await;
        }
    }

    /// Run the supervisor until interrupted: start, then watchdog forever.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut ticker = tokio::time::interval(self.watchdog_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.watchdog_tick().await;
                }
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("Signal handler error: {}", e);
                    }
                    info!("Interrupt received, stopping");
                    break;
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Execute one watchdog action.
    async fn execute(&mut self, action: WatchdogAction) {
        match action {
            WatchdogAction::DisableOsProxy => self.disable_os_proxy(),
            WatchdogAction::EmitAlert => self.emit_alert().await,
            WatchdogAction::RestartEngine => {
                info!("Attempting engine restart");
                self.kill_engine();
                if let Err(e) = self.start().await {
                    warn!("Engine restart failed: {}", e);
                }
            }
        }
    }

    /// The fail-safe: revert the OS proxy configuration.
    fn disable_os_proxy(&self) {
        info!("Fail-safe: disabling OS proxy redirect");
        if let Err(e) = self.os_proxy.disable_proxy() {
            // The one genuinely dangerous failure; nothing to do but
            // scream into the log and retry on the next tick.
            error!("FAIL-SAFE DISABLE FAILED: {}", e);
        }
    }

    /// Record a high-severity watchdog alert (rate-limited by the caller).
    async fn emit_alert(&self) {
        let alert = Alert::high(
            "Interception engine unreachable",
            format!(
                "Engine port {} stopped answering; OS proxy redirect has been disabled",
                self.engine_config.listen_port
            ),
        );
        if let Err(e) = self
            .sink
            .add_alert(&alert, &self.engine_config.workspace)
            .await
        {
            warn!("Failed to record watchdog alert: {}", e);
        }
    }

    /// Enable the OS proxy redirect and ensure the root CA is trusted.
    fn enable_host_integration(&mut self) -> Result<()> {
        let cert_path = self.engine_config.cert_dir.join(ROOT_CERT_FILE);

        match self.trust_store.is_ca_trusted() {
            Ok(true) => debug!("Root CA already trusted, skipping installation"),
            Ok(false) => {
                if let Err(e) = self.trust_store.trust_ca(&cert_path) {
                    // Interception will show untrusted-cert errors, but
                    // connectivity is unaffected; not fatal.
                    warn!("Failed to install root CA into trust store: {}", e);
                }
            }
            Err(e) => warn!("Cannot read trust store state: {}", e),
        }

        self.os_proxy
            .enable_proxy(self.engine_config.listen_port)
            .context("Failed to enable OS proxy redirect")?;

        Ok(())
    }

    /// Reap the current engine process, if any.
    fn kill_engine(&mut self) {
        if let Some(mut process) = self.process.take() {
            if process.is_running() {
                let _ = process.kill();
            }
            let _ = process.wait();
        }
    }
}

/// Probe the engine's listening port.
async fn probe_port(port: u16) -> bool {
    let addr = format!("127.0.0.1:{}", port);
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::store::MemoryStore;

    fn test_supervisor(
        port: u16,
    ) -> (Supervisor, Arc<MockOsProxy>, Arc<MemoryStore>) {
        let os = Arc::new(MockOsProxy::default());
        let sink = Arc::new(MemoryStore::default());
        let config = Config {
            supervisor: SupervisorConfig {
                listen_port: port,
                startup_timeout_secs: 1,
                watchdog_interval_secs: 1,
                alert_cooldown_secs: 300,
                ..Default::default()
            },
            ..Default::default()
        };
        let supervisor = Supervisor::new(&config, os.clone(), os.clone(), sink.clone());
        (supervisor, os, sink)
    }

    #[tokio::test]
    async fn test_start_noop_when_port_reachable() {
        // Stand in for a running engine with a plain listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (mut supervisor, os, _sink) = test_supervisor(port);
        supervisor.start().await.unwrap();

        assert_eq!(supervisor.state(), ProxyProcessState::Running);
        assert!(os.is_proxy_enabled().unwrap());
        // No child process was spawned.
        assert!(supervisor.process.is_none());
    }

    #[tokio::test]
    async fn test_watchdog_disables_proxy_on_dead_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (mut supervisor, os, sink) = test_supervisor(port);
        supervisor.start().await.unwrap();
        assert!(os.is_proxy_enabled().unwrap());

        // Engine dies.
        drop(listener);

        supervisor.watchdog_tick().await;

        assert!(!os.is_proxy_enabled().unwrap());
        assert_eq!(sink.alerts().len(), 1);
        // Restart was attempted against a dead port and failed; state stays
        // failed and proxying stays off.
        assert_ne!(supervisor.state(), ProxyProcessState::Running);
    }

    #[tokio::test]
    async fn test_watchdog_alert_not_repeated_within_cooldown() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (mut supervisor, os, sink) = test_supervisor(port);
        supervisor.start().await.unwrap();
        drop(listener);

        supervisor.watchdog_tick().await;
        assert_eq!(sink.alerts().len(), 1);

        // Subsequent ticks: proxying is already off, nothing to protect.
        supervisor.watchdog_tick().await;
        supervisor.watchdog_tick().await;
        assert_eq!(sink.alerts().len(), 1);

        assert!(!os.is_proxy_enabled().unwrap());
    }

    #[tokio::test]
    async fn test_watchdog_quiet_when_proxy_disabled() {
        let (mut supervisor, _os, sink) = test_supervisor(1);
        supervisor.watchdog_tick().await;
        assert!(sink.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_stop_always_disables_proxy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (mut supervisor, os, _sink) = test_supervisor(port);
        supervisor.start().await.unwrap();
        assert!(os.is_proxy_enabled().unwrap());

        supervisor.stop().await;

        assert!(!os.is_proxy_enabled().unwrap());
        assert_eq!(supervisor.state(), ProxyProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_ca_trust_skipped_when_already_trusted() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (mut supervisor, os, _sink) = test_supervisor(port);

        supervisor.start().await.unwrap();
        assert_eq!(os.trust_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Second start: trust installation is skipped.
        supervisor.start().await.unwrap();
        assert_eq!(os.trust_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
