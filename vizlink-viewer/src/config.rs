//! Viewer configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vizlink_core::{Orientation, SessionConfig, ViewKind};

/// Top-level configuration for the viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Session settings.
    pub session: SessionSection,
    /// Viewport settings.
    pub viewport: ViewportSection,
    /// Logging.
    pub logging: LoggingSection,
}

/// Session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// WebSocket endpoint of the rendering server.
    pub endpoint: String,
    /// Server-side application name.
    pub application: String,
    /// Dataset reference (empty for demo applications).
    pub dataset_ref: String,
    /// Slice orientation for MPR views.
    pub orientation: Orientation,
    /// View kind requested from the server.
    pub view_kind: ViewKind,
    /// Interactive rendering quality hint, 1..=100.
    pub interactive_quality: u8,
    /// Connect timeout in milliseconds.
    pub timeout_ms: u64,
}

/// Viewport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportSection {
    /// Requested render width.
    pub width: u32,
    /// Requested render height.
    pub height: u32,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            session: SessionSection::default(),
            viewport: ViewportSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080/ws".into(),
            application: "cone".into(),
            dataset_ref: String::new(),
            orientation: Orientation::default(),
            view_kind: ViewKind::default(),
            interactive_quality: 50,
            timeout_ms: 10_000,
        }
    }
}

impl Default for ViewportSection {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ViewerConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Build the core session configuration.
    pub fn to_session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(&self.session.application, &self.session.endpoint);
        config.dataset_ref = self.session.dataset_ref.clone();
        config.orientation = self.session.orientation;
        config.view_kind = self.session.view_kind;
        config.interactive_quality = self.session.interactive_quality;
        config.connect_timeout = Duration::from_millis(self.session.timeout_ms);
        config
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = ViewerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("endpoint"));
        assert!(text.contains("width"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = ViewerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ViewerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.viewport.width, 1280);
        assert_eq!(parsed.session.endpoint, "ws://127.0.0.1:8080/ws");
    }

    #[test]
    fn session_config_carries_overrides() {
        let mut cfg = ViewerConfig::default();
        cfg.session.application = "mpr".into();
        cfg.session.orientation = Orientation::Sagittal;
        cfg.session.timeout_ms = 250;

        let session = cfg.to_session_config();
        assert_eq!(session.application, "mpr");
        assert_eq!(session.orientation, Orientation::Sagittal);
        assert_eq!(session.connect_timeout, Duration::from_millis(250));
    }
}
