//! Setting schema catalog
//!
//! The catalog is loaded once at startup from a JSON file and never
//! mutated at runtime. It is the authority the merger consults to
//! decide how a raw key/value pair folds into the final snapshot:
//! scope (global vs multisite), validation pattern, and whether the
//! key accepts numbered `_<N>` variants.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

// ============================================================================
// Setting
// ============================================================================

/// Scope of a setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingScope {
    /// Exactly one un-prefixed value in the snapshot
    Global,
    /// May carry one name-prefixed override per declared service name
    Multisite,
}

/// Schema definition of one setting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    /// Base key (without any `_<N>` suffix)
    pub key: String,

    /// Default value applied when nothing declares the key
    pub default: String,

    /// Validation pattern the value must fully match
    pub regex: String,

    /// Scoping rule
    pub scope: SettingScope,

    /// Whether numbered `KEY_<N>` variants are accepted
    #[serde(default)]
    pub multiple: bool,
}

// ============================================================================
// Catalog
// ============================================================================

/// Result of resolving a raw key against the catalog
#[derive(Debug)]
pub struct ResolvedKey<'a> {
    /// The schema entry governing this key
    pub setting: &'a Setting,

    /// The numeric suffix, when the raw key was a numbered variant
    pub suffix: Option<u32>,
}

/// Read-only catalog of setting definitions, keyed by base key
pub struct SettingCatalog {
    settings: HashMap<String, Setting>,
    patterns: HashMap<String, Regex>,
}

impl SettingCatalog {
    /// Build a catalog from a list of settings
    ///
    /// An invalid validation pattern is a startup-fatal condition: a
    /// catalog the merger cannot trust must never be half-loaded.
    pub fn from_settings(settings: Vec<Setting>) -> Result<Self> {
        let mut map = HashMap::with_capacity(settings.len());
        let mut patterns = HashMap::with_capacity(settings.len());

        for setting in settings {
            let anchored = format!("^(?:{})$", setting.regex);
            let pattern = Regex::new(&anchored).map_err(|e| {
                Error::startup(format!(
                    "invalid validation pattern for '{}': {}",
                    setting.key, e
                ))
            })?;
            patterns.insert(setting.key.clone(), pattern);
            map.insert(setting.key.clone(), setting);
        }

        Ok(Self {
            settings: map,
            patterns,
        })
    }

    /// Load the catalog from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::startup(format!("cannot read schema catalog {}: {}", path.display(), e))
        })?;
        let settings: Vec<Setting> = serde_json::from_str(&content).map_err(|e| {
            Error::startup(format!(
                "malformed schema catalog {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_settings(settings)
    }

    /// Number of settings in the catalog
    pub fn len(&self) -> usize {
        self.settings.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Iterate over all settings
    pub fn iter(&self) -> impl Iterator<Item = &Setting> {
        self.settings.values()
    }

    /// Resolve a raw key to its governing setting
    ///
    /// A key ending in `_<N>` resolves by stripping the suffix and
    /// checking the base key; the numbered form is accepted only when
    /// the base is marked `multiple`.
    pub fn resolve(&self, raw_key: &str) -> Option<ResolvedKey<'_>> {
        if let Some(setting) = self.settings.get(raw_key) {
            return Some(ResolvedKey {
                setting,
                suffix: None,
            });
        }

        let (base, suffix) = split_numbered_suffix(raw_key)?;
        let setting = self.settings.get(base)?;
        if !setting.multiple {
            return None;
        }
        Some(ResolvedKey {
            setting,
            suffix: Some(suffix),
        })
    }

    /// Validate a raw key/value pair against the catalog
    ///
    /// Returns the resolved setting on success, or the rejection reason.
    /// Unknown keys and invalid values are both rejections, never errors:
    /// the merger drops the pair and continues.
    pub fn validate<'a>(
        &'a self,
        raw_key: &str,
        value: &str,
    ) -> std::result::Result<ResolvedKey<'a>, RejectReason> {
        let resolved = self
            .resolve(raw_key)
            .ok_or_else(|| RejectReason::UnknownKey(raw_key.to_string()))?;

        let pattern = &self.patterns[&resolved.setting.key];
        if !pattern.is_match(value) {
            return Err(RejectReason::PatternMismatch {
                key: raw_key.to_string(),
                pattern: resolved.setting.regex.clone(),
            });
        }

        Ok(resolved)
    }
}

/// Why a raw key/value pair was rejected by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Key (after suffix stripping) is not in the catalog, or carries
    /// a numbered suffix on a non-multiple base
    UnknownKey(String),
    /// Value failed the validation pattern
    PatternMismatch { key: String, pattern: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownKey(key) => write!(f, "unknown setting '{}'", key),
            Self::PatternMismatch { key, pattern } => {
                write!(f, "value for '{}' does not match pattern '{}'", key, pattern)
            }
        }
    }
}

/// Split `KEY_<N>` into `(KEY, N)`; `None` when there is no numeric suffix
fn split_numbered_suffix(raw_key: &str) -> Option<(&str, u32)> {
    let idx = raw_key.rfind('_')?;
    let (base, digits) = (&raw_key[..idx], &raw_key[idx + 1..]);
    if base.is_empty() || digits.is_empty() {
        return None;
    }
    let suffix: u32 = digits.parse().ok()?;
    Some((base, suffix))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SettingCatalog {
        SettingCatalog::from_settings(vec![
            Setting {
                key: "SERVER_NAME".to_string(),
                default: String::new(),
                regex: r"[^ ]*( [^ ]+)*".to_string(),
                scope: SettingScope::Global,
                multiple: false,
            },
            Setting {
                key: "USE_X".to_string(),
                default: "no".to_string(),
                regex: "yes|no".to_string(),
                scope: SettingScope::Multisite,
                multiple: false,
            },
            Setting {
                key: "REVERSE_PROXY_URL".to_string(),
                default: String::new(),
                regex: ".*".to_string(),
                scope: SettingScope::Multisite,
                multiple: true,
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve_plain_key() {
        let cat = catalog();
        let resolved = cat.resolve("USE_X").unwrap();
        assert_eq!(resolved.setting.key, "USE_X");
        assert!(resolved.suffix.is_none());
    }

    #[test]
    fn test_resolve_numbered_variant() {
        let cat = catalog();
        let resolved = cat.resolve("REVERSE_PROXY_URL_2").unwrap();
        assert_eq!(resolved.setting.key, "REVERSE_PROXY_URL");
        assert_eq!(resolved.suffix, Some(2));
    }

    #[test]
    fn test_numbered_variant_rejected_on_non_multiple() {
        let cat = catalog();
        assert!(cat.resolve("USE_X_1").is_none());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let cat = catalog();
        assert!(cat.resolve("NOT_A_SETTING").is_none());
        assert!(matches!(
            cat.validate("NOT_A_SETTING", "v"),
            Err(RejectReason::UnknownKey(_))
        ));
    }

    #[test]
    fn test_value_pattern_anchored() {
        let cat = catalog();
        assert!(cat.validate("USE_X", "yes").is_ok());
        // "yesyes" must not pass a partial match of "yes|no"
        assert!(matches!(
            cat.validate("USE_X", "yesyes"),
            Err(RejectReason::PatternMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_pattern_is_startup_fatal() {
        let result = SettingCatalog::from_settings(vec![Setting {
            key: "BAD".to_string(),
            default: String::new(),
            regex: "(".to_string(),
            scope: SettingScope::Global,
            multiple: false,
        }]);
        match result {
            Err(err) => assert!(!err.is_recoverable()),
            Ok(_) => panic!("expected a startup error"),
        }
    }

    #[test]
    fn test_split_numbered_suffix() {
        assert_eq!(split_numbered_suffix("KEY_3"), Some(("KEY", 3)));
        assert_eq!(split_numbered_suffix("KEY"), None);
        assert_eq!(split_numbered_suffix("KEY_"), None);
        assert_eq!(split_numbered_suffix("KEY_X"), None);
    }
}
