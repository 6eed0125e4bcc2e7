//! Key/value settings storage and first-run bootstrap.

use std::path::Path;

use sqlx::Row;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{Result, Store};
use crate::model::SettingsSnapshot;

/// Default loopback port for the control API.
pub const DEFAULT_API_PORT: i64 = 17777;

impl Store {
    /// Reads one raw setting value.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the query fails.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(r"SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// Writes one raw setting value (upsert).
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the write fails.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r"INSERT INTO settings (key, value) VALUES (?, ?)
              ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Assembles the settings snapshot from the key/value table, applying
    /// defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if a read fails.
    #[instrument(skip(self))]
    pub async fn settings_snapshot(&self) -> Result<SettingsSnapshot> {
        Ok(SettingsSnapshot {
            default_download_dir: self
                .get_setting("default_download_dir")
                .await?
                .unwrap_or_default(),
            bandwidth_limit_bps: self
                .get_setting("bandwidth_limit_bps")
                .await?
                .and_then(|s| s.parse::<i64>().ok())
                .filter(|v| *v > 0),
            minimize_to_tray: self
                .get_setting("minimize_to_tray")
                .await?
                .map_or(true, |s| s == "1"),
            theme: self
                .get_setting("theme")
                .await?
                .unwrap_or_else(|| "dark".to_string()),
            skin: self
                .get_setting("skin")
                .await?
                .unwrap_or_else(|| "default".to_string()),
            global_hotkey: self.get_setting("global_hotkey").await?.unwrap_or_default(),
            global_proxy_enabled: self
                .get_setting("global_proxy_enabled")
                .await?
                .is_some_and(|s| s == "1"),
            global_proxy_url: self
                .get_setting("global_proxy_url")
                .await?
                .filter(|s| !s.trim().is_empty()),
            local_api_port: self
                .get_setting("local_api_port")
                .await?
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(DEFAULT_API_PORT),
        })
    }

    /// Persists the whole settings snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if a write fails.
    #[instrument(skip_all)]
    pub async fn set_settings_snapshot(&self, s: &SettingsSnapshot) -> Result<()> {
        self.set_setting("default_download_dir", &s.default_download_dir)
            .await?;
        self.set_setting(
            "bandwidth_limit_bps",
            &s.bandwidth_limit_bps.unwrap_or(0).to_string(),
        )
        .await?;
        self.set_setting("minimize_to_tray", if s.minimize_to_tray { "1" } else { "0" })
            .await?;
        self.set_setting("theme", &s.theme).await?;
        self.set_setting("skin", &s.skin).await?;
        self.set_setting("global_hotkey", &s.global_hotkey).await?;
        self.set_setting(
            "global_proxy_enabled",
            if s.global_proxy_enabled { "1" } else { "0" },
        )
        .await?;
        self.set_setting(
            "global_proxy_url",
            s.global_proxy_url.as_deref().unwrap_or(""),
        )
        .await?;
        self.set_setting("local_api_port", &s.local_api_port.to_string())
            .await?;
        Ok(())
    }

    /// Returns the control API token, generating and persisting one on first
    /// run. This is the only secret in the store.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if a read or write fails.
    #[instrument(skip(self))]
    pub async fn api_token(&self) -> Result<String> {
        if let Some(token) = self.get_setting("local_api_token").await? {
            if !token.is_empty() {
                return Ok(token);
            }
        }
        let token = Uuid::new_v4().to_string();
        self.set_setting("local_api_token", &token).await?;
        info!("generated local api token");
        Ok(token)
    }

    /// First-run defaults: download dir, theme, API port, token.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if a write fails.
    #[instrument(skip(self, fallback_download_dir))]
    pub async fn ensure_bootstrap_defaults(&self, fallback_download_dir: &Path) -> Result<()> {
        let mut snap = self.settings_snapshot().await?;
        if snap.default_download_dir.is_empty() {
            snap.default_download_dir = fallback_download_dir.display().to_string();
        }
        if snap.theme.trim().is_empty() {
            snap.theme = "dark".to_string();
        }
        if snap.local_api_port <= 0 {
            snap.local_api_port = DEFAULT_API_PORT;
        }
        self.set_settings_snapshot(&snap).await?;
        let _token = self.api_token().await?;
        Ok(())
    }
}
