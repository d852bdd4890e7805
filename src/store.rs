//! External settings and activity store interfaces.
//!
//! The durable storage backend is an external collaborator; this module is
//! the narrow read/write seam the engine and supervisor consume it through:
//!
//! - [`SettingsStore`]: workspace enforcement settings, re-read on a fixed
//!   cadence and never cached indefinitely in-process.
//! - [`ActivitySink`]: append-only activity events and alerts. Writes are
//!   best-effort from the engine's perspective; durability and retry are the
//!   store's concern.
//!
//! [`HttpStore`] talks JSON over plain HTTP to the local collaborator.
//! [`MemoryStore`] backs tests and headless development.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::config::ProxySettings;
use crate::recorder::ActivityEvent;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store endpoint could not be reached.
    #[error("Store request failed: {0}")]
    Request(String),

    /// The store answered with a non-success status.
    #[error("Store returned status {0}")]
    Status(StatusCode),

    /// The store's response body could not be decoded.
    #[error("Store response decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// No store is configured.
    #[error("No store configured")]
    NotConfigured,
}

/// Severity of an operational alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs attention soon.
    Warning,
    /// Operationally critical (fail-safe events).
    High,
}

/// An operational alert destined for the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert id.
    pub id: String,
    /// Alert severity.
    pub severity: AlertSeverity,
    /// Short title.
    pub title: String,
    /// Full message.
    pub message: String,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Build a high-severity alert.
    pub fn high(title: &str, message: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            severity: AlertSeverity::High,
            title: title.to_string(),
            message,
            timestamp: Utc::now(),
        }
    }
}

/// Read/write access to workspace enforcement settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Fetch the current settings for a workspace.
    async fn get_settings(&self, workspace: &str) -> Result<ProxySettings, StoreError>;

    /// Apply a partial settings update, returning the merged settings.
    async fn update_settings(
        &self,
        workspace: &str,
        partial: serde_json::Value,
    ) -> Result<ProxySettings, StoreError>;
}

/// Append-only sink for activity events and alerts.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    /// Append one activity event.
    async fn add_event(&self, event: &ActivityEvent, workspace: &str) -> Result<(), StoreError>;

    /// Append one alert.
    async fn add_alert(&self, alert: &Alert, workspace: &str) -> Result<(), StoreError>;

    /// Number of alerts not yet acknowledged by an operator.
    async fn unacknowledged_count(&self, workspace: &str) -> Result<u64, StoreError>;
}

/// HTTP JSON client for the external store.
pub struct HttpStore {
    base_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpStore {
    /// Create a client for the store at `base_url` (e.g. `http://127.0.0.1:8787`).
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, StoreError> {
        let uri = format!("{}{}", self.base_url, path);
        debug!("Store request: {} {}", method, uri);

        let mut builder = Request::builder().method(method).uri(&uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status(status));
        }

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?
            .to_bytes();

        // Some endpoints acknowledge with an empty body.
        if bytes.is_empty() {
            return Ok(serde_json::from_slice(b"null")?);
        }

        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl SettingsStore for HttpStore {
    async fn get_settings(&self, workspace: &str) -> Result<ProxySettings, StoreError> {
        self.request_json(
            Method::GET,
            &format!("/workspaces/{}/settings", workspace),
            None,
        )
        .await
    }

    async fn update_settings(
        &self,
        workspace: &str,
        partial: serde_json::Value,
    ) -> Result<ProxySettings, StoreError> {
        self.request_json(
            Method::POST,
            &format!("/workspaces/{}/settings", workspace),
            Some(serde_json::to_vec(&partial)?),
        )
        .await
    }
}

#[async_trait]
impl ActivitySink for HttpStore {
    async fn add_event(&self, event: &ActivityEvent, workspace: &str) -> Result<(), StoreError> {
        let _: serde_json::Value = self
            .request_json(
                Method::POST,
                &format!("/workspaces/{}/events", workspace),
                Some(serde_json::to_vec(event)?),
            )
            .await?;
        Ok(())
    }

    async fn add_alert(&self, alert: &Alert, workspace: &str) -> Result<(), StoreError> {
        let _: serde_json::Value = self
            .request_json(
                Method::POST,
                &format!("/workspaces/{}/alerts", workspace),
                Some(serde_json::to_vec(alert)?),
            )
            .await?;
        Ok(())
    }

    async fn unacknowledged_count(&self, workspace: &str) -> Result<u64, StoreError> {
        #[derive(Deserialize)]
        struct Count {
            count: u64,
        }
        let count: Count = self
            .request_json(
                Method::GET,
                &format!("/workspaces/{}/alerts/unacknowledged", workspace),
                None,
            )
            .await?;
        Ok(count.count)
    }
}

/// In-memory store for tests and headless development.
#[derive(Default)]
pub struct MemoryStore {
    settings: Mutex<ProxySettings>,
    events: Mutex<Vec<ActivityEvent>>,
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryStore {
    /// Create a memory store with the given initial settings.
    pub fn with_settings(settings: ProxySettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            events: Mutex::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
        }
    }

    /// Replace the stored settings (simulates an operator change).
    pub fn set_settings(&self, settings: ProxySettings) {
        *self.settings.lock().unwrap() = settings;
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Snapshot of recorded alerts.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_settings(&self, _workspace: &str) -> Result<ProxySettings, StoreError> {
        Ok(self.settings.lock().unwrap().clone())
    }

    async fn update_settings(
        &self,
        _workspace: &str,
        partial: serde_json::Value,
    ) -> Result<ProxySettings, StoreError> {
        let mut settings = self.settings.lock().unwrap();
        let mut current = serde_json::to_value(&*settings)?;
        if let (Some(current_map), Some(partial_map)) =
            (current.as_object_mut(), partial.as_object())
        {
            for (key, value) in partial_map {
                current_map.insert(key.clone(), value.clone());
            }
        }
        *settings = serde_json::from_value(current)?;
        Ok(settings.clone())
    }
}

#[async_trait]
impl ActivitySink for MemoryStore {
    async fn add_event(&self, event: &ActivityEvent, _workspace: &str) -> Result<(), StoreError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn add_alert(&self, alert: &Alert, _workspace: &str) -> Result<(), StoreError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }

    async fn unacknowledged_count(&self, _workspace: &str) -> Result<u64, StoreError> {
        Ok(self.alerts.lock().unwrap().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_settings_round_trip() {
        let store = MemoryStore::default();
        let settings = store.get_settings("ws").await.unwrap();
        assert!(settings.proxy_enabled);

        let updated = store
            .update_settings("ws", serde_json::json!({"enforcement_mode": "block"}))
            .await
            .unwrap();
        assert_eq!(updated.enforcement_mode, Some("block".to_string()));

        // The update persists for subsequent reads.
        let settings = store.get_settings("ws").await.unwrap();
        assert_eq!(settings.enforcement_mode, Some("block".to_string()));
    }

    #[tokio::test]
    async fn test_memory_store_partial_update_keeps_other_fields() {
        let store = MemoryStore::with_settings(ProxySettings {
            risk_threshold: 70,
            ..ProxySettings::default()
        });

        let updated = store
            .update_settings("ws", serde_json::json!({"desktop_bypass": true}))
            .await
            .unwrap();

        assert!(updated.desktop_bypass);
        assert_eq!(updated.risk_threshold, 70);
    }

    #[tokio::test]
    async fn test_memory_store_alerts() {
        let store = MemoryStore::default();
        assert_eq!(store.unacknowledged_count("ws").await.unwrap(), 0);

        store
            .add_alert(&Alert::high("engine down", "probe failed".into()), "ws")
            .await
            .unwrap();

        assert_eq!(store.unacknowledged_count("ws").await.unwrap(), 1);
        assert_eq!(store.alerts()[0].severity, AlertSeverity::High);
    }

    #[test]
    fn test_http_store_trims_trailing_slash() {
        let store = HttpStore::new("http://127.0.0.1:8787/");
        assert_eq!(store.base_url, "http://127.0.0.1:8787");
    }
}
