#![forbid(unsafe_code)]

//! Tunables for discovery, the virtualizing controller, and the loading
//! overlay.
//!
//! Every field has a default, so hosts may pass a partial JSON object and
//! override only the keys they care about:
//!
//! ```
//! use chatvirt_core::config::ChatvirtConfig;
//!
//! let cfg = ChatvirtConfig::from_json(r#"{ "virtualizer": { "overscan_px": 600 } }"#).unwrap();
//! assert_eq!(cfg.virtualizer.overscan_px, 600.0);
//! assert_eq!(cfg.virtualizer.batch_size, 10);
//! assert_eq!(cfg.discovery.min_matches, 2);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Attribute-based turn selector used before discovery publishes one.
pub const DEFAULT_TURN_SELECTOR: &str = "[data-message-author-role]";

/// Marker attribute set on every placeholder.
pub const PLACEHOLDER_ATTR: &str = "data-nv-ph";

/// Controller tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualizerConfig {
    /// Margin added above and below the visible range.
    pub overscan_px: f64,
    /// Mount/unmount operations per batch.
    pub batch_size: usize,
    /// Delay between batches.
    pub yield_ms: u64,
    /// Floor for measured heights.
    pub min_height_px: f64,
    /// Distance from the bottom within which new replies are followed.
    pub follow_threshold_px: f64,
    pub default_selector: String,
    pub placeholder_attr: String,
}

impl Default for VirtualizerConfig {
    fn default() -> Self {
        Self {
            overscan_px: 1200.0,
            batch_size: 10,
            yield_ms: 6,
            min_height_px: 56.0,
            follow_threshold_px: 240.0,
            default_selector: DEFAULT_TURN_SELECTOR.to_owned(),
            placeholder_attr: PLACEHOLDER_ATTR.to_owned(),
        }
    }
}

/// Selector discovery tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Known turn selectors, tried in order.
    pub candidates: Vec<String>,
    /// Matches a candidate needs to be accepted.
    pub min_matches: usize,
    /// Containers scanned by the structural fallback.
    pub root_containers: String,
    /// Children a direct child needs to count as the turn list.
    pub min_children: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            candidates: [
                "[data-message-author-role]",
                r#"[data-testid="conversation-turn"]"#,
                r#"main [data-testid^="conversation-turn"]"#,
                "main [data-message-id]",
                "main article:has([data-message-author-role])",
                r#"main div[role="listitem"]"#,
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            min_matches: 2,
            root_containers: r#"main, [data-testid="conversation"]"#.to_owned(),
            min_children: 5,
        }
    }
}

/// Loading overlay tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub enabled: bool,
    /// How long requests must stay in flight before the spinner shows.
    pub request_debounce_ms: u64,
    /// Animation frames the spinner stays up after a navigation.
    pub navigation_frames: u32,
    /// How long a notice stays on screen.
    pub notice_ms: u64,
    pub spinner_id: String,
    pub notice_id: String,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_debounce_ms: 120,
            navigation_frames: 2,
            notice_ms: 3000,
            spinner_id: "chatvirt-loader".to_owned(),
            notice_id: "chatvirt-notice".to_owned(),
        }
    }
}

/// Top-level configuration accepted by hosts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatvirtConfig {
    pub virtualizer: VirtualizerConfig,
    pub discovery: DiscoveryConfig,
    pub overlay: OverlayConfig,
}

/// Configuration error with field context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The input was not valid JSON for this shape.
    Json(String),
    /// A field failed validation.
    Invalid {
        field: &'static str,
        value: String,
        message: &'static str,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, value: impl fmt::Display, message: &'static str) -> Self {
        Self::Invalid {
            field,
            value: value.to_string(),
            message,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(msg) => write!(f, "config is not valid JSON: {msg}"),
            Self::Invalid {
                field,
                value,
                message,
            } => write!(f, "{field}={value} ({message})"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ChatvirtConfig {
    /// Parse and validate a (possibly partial) JSON object.
    ///
    /// Returns the first violation when validation fails.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let cfg: Self =
            serde_json::from_str(input).map_err(|err| ConfigError::Json(err.to_string()))?;
        match cfg.validate() {
            Ok(()) => Ok(cfg),
            Err(mut errors) => Err(errors.remove(0)),
        }
    }

    /// Validate constraints and return all violations.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();
        let v = &self.virtualizer;
        validate_px("virtualizer.overscan_px", v.overscan_px, &mut errors);
        validate_px("virtualizer.min_height_px", v.min_height_px, &mut errors);
        validate_px(
            "virtualizer.follow_threshold_px",
            v.follow_threshold_px,
            &mut errors,
        );
        validate_positive("virtualizer.batch_size", v.batch_size, &mut errors);
        validate_nonempty(
            "virtualizer.default_selector",
            &v.default_selector,
            &mut errors,
        );
        validate_nonempty(
            "virtualizer.placeholder_attr",
            &v.placeholder_attr,
            &mut errors,
        );

        let d = &self.discovery;
        validate_positive("discovery.min_matches", d.min_matches, &mut errors);
        validate_positive("discovery.min_children", d.min_children, &mut errors);
        validate_nonempty("discovery.root_containers", &d.root_containers, &mut errors);

        let o = &self.overlay;
        validate_positive(
            "overlay.navigation_frames",
            o.navigation_frames as usize,
            &mut errors,
        );
        validate_nonempty("overlay.spinner_id", &o.spinner_id, &mut errors);
        validate_nonempty("overlay.notice_id", &o.notice_id, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn validate_px(field: &'static str, value: f64, errors: &mut Vec<ConfigError>) {
    if !value.is_finite() || value < 0.0 {
        errors.push(ConfigError::invalid(field, value, "must be finite and >= 0"));
    }
}

fn validate_positive(field: &'static str, value: usize, errors: &mut Vec<ConfigError>) {
    if value == 0 {
        errors.push(ConfigError::invalid(field, value, "must be >= 1"));
    }
}

fn validate_nonempty(field: &'static str, value: &str, errors: &mut Vec<ConfigError>) {
    if value.trim().is_empty() {
        errors.push(ConfigError::invalid(field, "\"\"", "must not be empty"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_validate() {
        assert_eq!(ChatvirtConfig::default().validate(), Ok(()));
    }

    #[test]
    fn empty_object_is_default() {
        assert_eq!(
            ChatvirtConfig::from_json("{}").unwrap(),
            ChatvirtConfig::default()
        );
    }

    #[test]
    fn validation_reports_every_violation() {
        let mut cfg = ChatvirtConfig::default();
        cfg.virtualizer.batch_size = 0;
        cfg.virtualizer.overscan_px = f64::NAN;
        cfg.discovery.min_matches = 0;
        let errors = cfg.validate().unwrap_err();
        let fields: Vec<&str> = errors
            .iter()
            .map(|e| match e {
                ConfigError::Invalid { field, .. } => *field,
                ConfigError::Json(_) => "json",
            })
            .collect();
        assert_eq!(
            fields,
            vec![
                "virtualizer.overscan_px",
                "virtualizer.batch_size",
                "discovery.min_matches"
            ]
        );
    }

    #[test]
    fn from_json_rejects_bad_input() {
        assert!(matches!(
            ChatvirtConfig::from_json("not json"),
            Err(ConfigError::Json(_))
        ));
        let err = ChatvirtConfig::from_json(r#"{"virtualizer":{"batch_size":0}}"#).unwrap_err();
        assert_eq!(err.to_string(), "virtualizer.batch_size=0 (must be >= 1)");
    }

    #[test]
    fn overlay_keys_override_individually() {
        let cfg = ChatvirtConfig::from_json(r#"{"overlay":{"enabled":false,"notice_ms":500}}"#)
            .unwrap();
        assert!(!cfg.overlay.enabled);
        assert_eq!(cfg.overlay.notice_ms, 500);
        assert_eq!(cfg.overlay.request_debounce_ms, 120);

        let err = ChatvirtConfig::from_json(r#"{"overlay":{"navigation_frames":0}}"#).unwrap_err();
        assert_eq!(err.to_string(), "overlay.navigation_frames=0 (must be >= 1)");
    }
}
