//! Session configuration.
//!
//! A [`SessionConfig`] names the server-side application, the dataset to
//! render, and how the view should be oriented. It is validated before any
//! network I/O and is immutable once a session starts connecting.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

/// Default connect deadline when the caller does not override it.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Orientation ──────────────────────────────────────────────────

/// Slice orientation requested from the server.
///
/// Always sent during negotiation, including [`Orientation::None`] — the
/// server-side contract does not tolerate its absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Axial,
    Sagittal,
    Coronal,
    None,
}

impl Orientation {
    /// Wire spelling used in the negotiation payload.
    pub const fn as_str(self) -> &'static str {
        match self {
            Orientation::Axial => "axial",
            Orientation::Sagittal => "sagittal",
            Orientation::Coronal => "coronal",
            Orientation::None => "none",
        }
    }
}

impl std::fmt::Display for Orientation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── ViewKind ─────────────────────────────────────────────────────

/// What kind of view the server should build for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewKind {
    /// Single multi-planar-reconstruction slice view.
    #[default]
    Mpr,
    /// Volume rendering view.
    VolumeRender,
    /// Server-composited 2×2 view.
    FourView,
}

impl ViewKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ViewKind::Mpr => "mpr",
            ViewKind::VolumeRender => "volumeRender",
            ViewKind::FourView => "fourView",
        }
    }
}

impl std::fmt::Display for ViewKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── SessionConfig ────────────────────────────────────────────────

/// Configuration for one rendering session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Server-side application name (selects the session type). Must be
    /// non-empty.
    pub application: String,
    /// Dataset reference (e.g. a series UID). May be empty for demo
    /// applications that render built-in data.
    pub dataset_ref: String,
    /// Slice orientation for MPR-style views.
    pub orientation: Orientation,
    /// View kind requested from the server.
    pub view_kind: ViewKind,
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub endpoint: String,
    /// Deadline for the connect attempt.
    pub connect_timeout: Duration,
    /// Interactive rendering quality hint, 1..=100.
    pub interactive_quality: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            application: String::new(),
            dataset_ref: String::new(),
            orientation: Orientation::default(),
            view_kind: ViewKind::default(),
            endpoint: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            interactive_quality: 50,
        }
    }
}

impl SessionConfig {
    /// Convenience constructor for the common case.
    pub fn new(application: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Validate without performing any network I/O.
    ///
    /// Invalid configuration yields [`ConnectError::Rejected`].
    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.application.is_empty() {
            return Err(ConnectError::Rejected(
                "application must not be empty".into(),
            ));
        }
        if self.interactive_quality == 0 || self.interactive_quality > 100 {
            return Err(ConnectError::Rejected(format!(
                "interactive_quality out of range: {}",
                self.interactive_quality
            )));
        }
        validate_endpoint(&self.endpoint)?;
        Ok(())
    }
}

/// Check that `endpoint` parses as a `ws://` or `wss://` URL with a host.
pub(crate) fn validate_endpoint(endpoint: &str) -> Result<(), ConnectError> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| ConnectError::Rejected(format!("invalid endpoint {endpoint:?}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(ConnectError::Rejected(format!(
                "endpoint scheme must be ws or wss, got {other:?}"
            )));
        }
    }
    if url.host_str().is_none() {
        return Err(ConnectError::Rejected(
            "endpoint is missing a host".into(),
        ));
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
