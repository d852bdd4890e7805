//! The watchdog state machine.
//!
//! The engine's one unacceptable failure mode is silent: the process dies
//! while the OS proxy still points at its port, and the user loses all
//! network connectivity. The watchdog exists to make that state impossible
//! to persist. It is modeled as a small state machine driven by external
//! ticks, so the safety property is testable without real OS processes:
//! every probe failure while OS proxying is on yields a disable action
//! before anything else.
//!
//! Alerts are rate-limited by a tick-counted cooldown so a sustained outage
//! emits one high-severity alert per window, not one per interval.

use tracing::warn;

/// Lifecycle state of the interception engine process, as observed by the
/// supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProcessState {
    /// Not running; OS proxying must be off.
    Stopped,
    /// Spawned, waiting for the listening port to come up.
    Starting,
    /// Port confirmed reachable.
    Running,
    /// Liveness probe failed or startup timed out.
    Failed,
}

/// Side effects requested by a state transition, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Revert the OS proxy configuration immediately.
    DisableOsProxy,
    /// Emit a high-severity alert (already rate-limited).
    EmitAlert,
    /// Attempt to restart the engine.
    RestartEngine,
}

/// Tick-driven watchdog state machine.
pub struct WatchdogState {
    state: ProxyProcessState,
    os_proxy_enabled: bool,
    /// Minimum ticks between alerts.
    alert_cooldown_ticks: u32,
    /// Ticks since the last alert; saturates at the cooldown.
    ticks_since_alert: u32,
}

impl WatchdogState {
    /// Create a watchdog that allows at most one alert per
    /// `alert_cooldown_ticks` probe intervals.
    pub fn new(alert_cooldown_ticks: u32) -> Self {
        Self {
            state: ProxyProcessState::Stopped,
            os_proxy_enabled: false,
            alert_cooldown_ticks,
            // First failure always alerts.
            ticks_since_alert: alert_cooldown_ticks,
        }
    }

    /// Current engine state.
    pub fn state(&self) -> ProxyProcessState {
        self.state
    }

    /// Whether the machine believes OS proxying is on.
    pub fn os_proxy_enabled(&self) -> bool {
        self.os_proxy_enabled
    }

    /// Record a start request: `Stopped -> Starting`.
    pub fn on_start_requested(&mut self) {
        self.state = ProxyProcessState::Starting;
    }

    /// Record a confirmed startup (port reachable within the startup
    /// timeout): `Starting -> Running`, OS proxying enabled.
    pub fn on_started(&mut self) {
        self.state = ProxyProcessState::Running;
        self.os_proxy_enabled = true;
    }

    /// Record a startup that never became reachable: `Starting -> Failed`.
    pub fn on_start_failed(&mut self) -> Vec<WatchdogAction> {
        self.state = ProxyProcessState::Failed;
        self.fail_safe()
    }

    /// Record one watchdog probe of the engine port.
    ///
    /// Returns the actions to execute, in order. The fail-safe disable is
    /// always first: the OS proxy is reverted before any repair is
    /// attempted.
    pub fn on_probe(&mut self, port_reachable: bool) -> Vec<WatchdogAction> {
        self.ticks_since_alert = self
            .ticks_since_alert
            .saturating_add(1)
            .min(self.alert_cooldown_ticks.max(1));

        if !self.os_proxy_enabled {
            return Vec::new();
        }

        if port_reachable {
            self.state = ProxyProcessState::Running;
            return Vec::new();
        }

        warn!("Watchdog probe failed while OS proxying enabled");
        self.state = ProxyProcessState::Failed;

        let mut actions = self.fail_safe();
        actions.push(WatchdogAction::RestartEngine);
        actions
    }

    /// Record an explicit stop or observed process exit:
    /// `Running/Failed -> Stopped`.
    pub fn on_stop(&mut self) -> Vec<WatchdogAction> {
        self.state = ProxyProcessState::Stopped;
        if self.os_proxy_enabled {
            self.os_proxy_enabled = false;
            vec![WatchdogAction::DisableOsProxy]
        } else {
            Vec::new()
        }
    }

    /// Transition into a failed state with OS proxying previously on:
    /// disable first, then alert if the cooldown allows.
    fn fail_safe(&mut self) -> Vec<WatchdogAction> {
        let mut actions = Vec::new();
        if self.os_proxy_enabled {
            self.os_proxy_enabled = false;
            actions.push(WatchdogAction::DisableOsProxy);
        }
        if self.ticks_since_alert >= self.alert_cooldown_ticks.max(1) {
            self.ticks_since_alert = 0;
            actions.push(WatchdogAction::EmitAlert);
        }
        actions
    }
}
