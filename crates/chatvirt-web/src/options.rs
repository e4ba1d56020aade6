#![forbid(unsafe_code)]

//! Boot options passed by the injecting page.
//!
//! The object is the core [`ChatvirtConfig`] (`virtualizer`, `discovery`)
//! plus a few host-only keys. Every key is optional.
//!
//! ```json
//! {
//!   "globalName": "virtualizer",
//!   "selectorGlobal": "__VIRT_MSG_SEL",
//!   "runId": "tab-3",
//!   "watchNavigation": true,
//!   "watchRequests": true,
//!   "virtualizer": { "overscan_px": 1600 }
//! }
//! ```

use chatvirt_core::config::{ChatvirtConfig, ConfigError};
use serde::Deserialize;

/// Name of the window property exposing the control API.
pub const DEFAULT_GLOBAL_NAME: &str = "virtualizer";
/// Window property that carries the turn selector between scripts.
pub const DEFAULT_SELECTOR_GLOBAL: &str = "__VIRT_MSG_SEL";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostOptions {
    /// Window property the control handle is stored under; empty disables.
    pub global_name: String,
    /// Window property mirrored with the resolved selector; empty disables.
    pub selector_global: String,
    /// Tag stamped on every drained JSONL pass record.
    pub run_id: String,
    /// Re-run discovery on `pushState`, `replaceState`, and `popstate`.
    pub watch_navigation: bool,
    /// Count `fetch` calls in flight for the loading spinner.
    pub watch_requests: bool,
    #[serde(flatten)]
    pub config: ChatvirtConfig,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            global_name: DEFAULT_GLOBAL_NAME.to_owned(),
            selector_global: DEFAULT_SELECTOR_GLOBAL.to_owned(),
            run_id: "chatvirt".to_owned(),
            watch_navigation: true,
            watch_requests: true,
            config: ChatvirtConfig::default(),
        }
    }
}

impl HostOptions {
    /// Parse and validate. `None`, blank input, and `null` yield defaults.
    pub fn parse(input: Option<&str>) -> Result<Self, ConfigError> {
        let input = input.map(str::trim).unwrap_or_default();
        if input.is_empty() || input == "null" {
            return Ok(Self::default());
        }
        let options: Self =
            serde_json::from_str(input).map_err(|err| ConfigError::Json(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, name) in [
            ("globalName", &self.global_name),
            ("selectorGlobal", &self.selector_global),
        ] {
            if !name.is_empty() && !is_identifier(name) {
                return Err(ConfigError::Invalid {
                    field,
                    value: name.clone(),
                    message: "must be a JavaScript identifier",
                });
            }
        }
        match self.config.validate() {
            Ok(()) => Ok(()),
            Err(mut errors) => Err(errors.remove(0)),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_input_is_default() {
        assert_eq!(HostOptions::parse(None).unwrap(), HostOptions::default());
        assert_eq!(HostOptions::parse(Some("  ")).unwrap(), HostOptions::default());
        assert_eq!(HostOptions::parse(Some("null")).unwrap(), HostOptions::default());
    }

    #[test]
    fn host_keys_and_nested_config() {
        let opts = HostOptions::parse(Some(
            r#"{"globalName":"nv","runId":"t1","watchNavigation":false,"virtualizer":{"overscan_px":1600}}"#,
        ))
        .unwrap();
        assert_eq!(opts.global_name, "nv");
        assert_eq!(opts.run_id, "t1");
        assert!(!opts.watch_navigation);
        assert_eq!(opts.config.virtualizer.overscan_px, 1600.0);
        assert_eq!(opts.config.discovery, Default::default());
    }

    #[test]
    fn request_watching_and_overlay_keys() {
        let opts = HostOptions::parse(Some(
            r#"{"watchRequests":false,"overlay":{"notice_ms":1500,"spinner_id":"nv-spin"}}"#,
        ))
        .unwrap();
        assert!(!opts.watch_requests);
        assert!(opts.watch_navigation);
        assert_eq!(opts.config.overlay.notice_ms, 1500);
        assert_eq!(opts.config.overlay.spinner_id, "nv-spin");
        assert_eq!(opts.config.overlay.request_debounce_ms, 120);

        let err = HostOptions::parse(Some(r#"{"overlay":{"navigation_frames":0}}"#)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn empty_global_names_are_allowed() {
        let opts = HostOptions::parse(Some(r#"{"globalName":"","selectorGlobal":""}"#)).unwrap();
        assert!(opts.global_name.is_empty());
        assert!(opts.selector_global.is_empty());
    }

    #[test]
    fn rejects_bad_identifier_and_bad_config() {
        let err = HostOptions::parse(Some(r#"{"globalName":"1abc"}"#)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "globalName", .. }));

        let err = HostOptions::parse(Some(r#"{"selectorGlobal":"a-b"}"#)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "selectorGlobal", .. }));

        let err = HostOptions::parse(Some(r#"{"virtualizer":{"batch_size":0}}"#)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = HostOptions::parse(Some("{not json")).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}
