//! Classifier configuration
//!
//! Defines the typed configuration record with the recognized tuning options,
//! the named presets, JSON config-file loading, and per-key overrides used by
//! the CLI. Unknown keys and out-of-range values are rejected with
//! `ConfigInvalid` at startup.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ProbeError, ProbeResult};

/// Environment variable overriding the default store location
pub const DB_PATH_ENV: &str = "MAILPROBE_DB";

/// Default store directory name under the home directory
const DEFAULT_DB_DIR: &str = ".mailprobe";

/// Classifier tuning options
///
/// Defaults follow Graham's scheme. All options are recognized by name in
/// config files and as CLI overrides; anything else is `ConfigInvalid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Terms seen fewer than this many times in total are ignored by the
    /// scorer until the threshold is reached
    pub min_token_count: u32,
    /// Maximum tokens selected per message for scoring
    pub max_discriminators: usize,
    /// A token participates only if its probability deviates from 0.5 by at
    /// least this much
    pub min_deviation: f64,
    /// Messages scoring at or above this are labeled spam
    pub spam_threshold: f64,
    /// Weight multiplier applied to good counts in probability estimation
    pub terms_for_good: u32,
    /// Weight multiplier applied to spam counts in probability estimation
    pub terms_for_spam: u32,
    /// Lower clamp for per-token probability
    pub min_prob: f64,
    /// Upper clamp for per-token probability
    pub max_prob: f64,
    /// Probability assigned to terms below `min_token_count` when forced
    /// into the computation, and the score when no token survives selection
    pub default_prob: f64,
    /// Consecutive body tokens joined into phrase tokens
    pub phrase_length: usize,
    /// Collapse runs of non-ASCII bytes in any field to a sentinel token
    pub replace_non_ascii: bool,
    /// Emit only header-derived tokens
    pub ignore_body: bool,
    /// In-memory LRU size for the term store
    pub cache_size: usize,
    /// Maintenance deletes records with total count <= 1 whose last sighting
    /// is at least this many days old
    pub expiry_days: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::graham()
    }
}

impl ProbeConfig {
    /// Graham preset: the defaults
    pub fn graham() -> Self {
        Self {
            min_token_count: 5,
            max_discriminators: 27,
            min_deviation: 0.1,
            spam_threshold: 0.9,
            terms_for_good: 2,
            terms_for_spam: 1,
            min_prob: 0.0001,
            max_prob: 0.9999,
            default_prob: 0.4,
            phrase_length: 2,
            replace_non_ascii: true,
            ignore_body: false,
            cache_size: 2500,
            expiry_days: 7,
        }
    }

    /// Conservative preset: biased further against false positives
    pub fn conservative() -> Self {
        Self {
            spam_threshold: 0.95,
            terms_for_good: 5,
            ..Self::graham()
        }
    }

    /// Aggressive preset: lower threshold, no extra weight on good counts
    pub fn aggressive() -> Self {
        Self {
            spam_threshold: 0.7,
            terms_for_good: 1,
            ..Self::graham()
        }
    }

    /// Look up a preset by name
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for unrecognized preset names.
    pub fn preset(name: &str) -> ProbeResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "graham" => Ok(Self::graham()),
            "conservative" => Ok(Self::conservative()),
            "aggressive" => Ok(Self::aggressive()),
            other => Err(ProbeError::config(format!("unknown preset '{other}'"))),
        }
    }

    /// Load configuration from a JSON file
    ///
    /// Missing keys take their defaults; unknown keys are rejected.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the file cannot be read, parsed, or fails
    /// range validation.
    pub fn load_file(path: &Path) -> ProbeResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ProbeError::config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            ProbeError::config(format!("invalid config file {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply a single `key=value` override
    ///
    /// Accepts exactly the field names of this record. Used by the CLI to map
    /// `--<key> VALUE` flags onto the typed record.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for unknown keys or unparseable values.
    pub fn set(&mut self, key: &str, value: &str) -> ProbeResult<()> {
        match key {
            "min_token_count" => self.min_token_count = parse_value(key, value)?,
            "max_discriminators" => self.max_discriminators = parse_value(key, value)?,
            "min_deviation" => self.min_deviation = parse_value(key, value)?,
            "spam_threshold" => self.spam_threshold = parse_value(key, value)?,
            "terms_for_good" => self.terms_for_good = parse_value(key, value)?,
            "terms_for_spam" => self.terms_for_spam = parse_value(key, value)?,
            "min_prob" => self.min_prob = parse_value(key, value)?,
            "max_prob" => self.max_prob = parse_value(key, value)?,
            "default_prob" => self.default_prob = parse_value(key, value)?,
            "phrase_length" => self.phrase_length = parse_value(key, value)?,
            "replace_non_ascii" => self.replace_non_ascii = parse_bool(key, value)?,
            "ignore_body" => self.ignore_body = parse_bool(key, value)?,
            "cache_size" => self.cache_size = parse_value(key, value)?,
            "expiry_days" => self.expiry_days = parse_value(key, value)?,
            other => {
                return Err(ProbeError::config(format!("unknown config key '{other}'")));
            }
        }
        Ok(())
    }

    /// Check option ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` naming the offending option.
    pub fn validate(&self) -> ProbeResult<()> {
        if self.max_discriminators == 0 {
            return Err(ProbeError::config("max_discriminators must be at least 1"));
        }
        if self.phrase_length == 0 {
            return Err(ProbeError::config("phrase_length must be at least 1"));
        }
        if self.cache_size == 0 {
            return Err(ProbeError::config("cache_size must be at least 1"));
        }
        if !(0.0..=0.5).contains(&self.min_deviation) {
            return Err(ProbeError::config("min_deviation must be in [0, 0.5]"));
        }
        if !(0.0..=1.0).contains(&self.spam_threshold) || self.spam_threshold == 0.0 {
            return Err(ProbeError::config("spam_threshold must be in (0, 1]"));
        }
        for (name, value) in [
            ("min_prob", self.min_prob),
            ("max_prob", self.max_prob),
            ("default_prob", self.default_prob),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ProbeError::config(format!("{name} must be in [0, 1]")));
            }
        }
        if self.min_prob >= self.max_prob {
            return Err(ProbeError::config("min_prob must be below max_prob"));
        }
        if self.terms_for_good == 0 || self.terms_for_spam == 0 {
            return Err(ProbeError::config(
                "terms_for_good and terms_for_spam must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Parse a typed config value, naming the key on failure
fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> ProbeResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ProbeError::config(format!("invalid value for {key}: '{value}'")))
}

/// Parse a boolean config value with flexible spellings
///
/// Accepts `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive.
fn parse_bool(key: &str, value: &str) -> ProbeResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(ProbeError::config(format!(
            "invalid boolean value for {key}: '{value}'"
        ))),
    }
}

/// Resolve the store path
///
/// Precedence: explicit `-d` flag, then the `MAILPROBE_DB` environment
/// variable, then `~/.mailprobe` (falling back to the working directory when
/// no home directory is set).
pub fn resolve_store_path(flag: Option<PathBuf>) -> PathBuf {
    if let Some(path) = flag {
        return path;
    }
    if let Some(path) = env::var_os(DB_PATH_ENV) {
        return PathBuf::from(path);
    }
    match env::var_os("HOME") {
        Some(home) => Path::new(&home).join(DEFAULT_DB_DIR),
        None => PathBuf::from(DEFAULT_DB_DIR),
    }
}

#[cfg(test)]
mod tests {
    use super::ProbeConfig;

    #[test]
    fn presets_differ_only_where_documented() {
        let graham = ProbeConfig::graham();
        let conservative = ProbeConfig::conservative();
        assert_eq!(conservative.spam_threshold, 0.95);
        assert_eq!(conservative.terms_for_good, 5);
        assert_eq!(conservative.min_token_count, graham.min_token_count);

        let aggressive = ProbeConfig::aggressive();
        assert_eq!(aggressive.spam_threshold, 0.7);
        assert_eq!(aggressive.terms_for_good, 1);
    }

    #[test]
    fn unknown_preset_is_rejected() {
        assert!(ProbeConfig::preset("paranoid").is_err());
    }

    #[test]
    fn set_applies_typed_overrides() {
        let mut config = ProbeConfig::default();
        config.set("spam_threshold", "0.95").expect("valid override");
        config.set("replace_non_ascii", "off").expect("valid bool");
        assert_eq!(config.spam_threshold, 0.95);
        assert!(!config.replace_non_ascii);

        assert!(config.set("spam_threshhold", "0.9").is_err());
        assert!(config.set("cache_size", "many").is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_options() {
        let mut config = ProbeConfig::default();
        config.min_prob = 0.5;
        config.max_prob = 0.4;
        assert!(config.validate().is_err());

        let mut config = ProbeConfig::default();
        config.max_discriminators = 0;
        assert!(config.validate().is_err());

        assert!(ProbeConfig::default().validate().is_ok());
    }

    #[test]
    fn config_file_rejects_unknown_keys() {
        let parsed: Result<ProbeConfig, _> =
            serde_json::from_str(r#"{ "spam_threshold": 0.8, "shields": 11 }"#);
        assert!(parsed.is_err());

        let parsed: ProbeConfig =
            serde_json::from_str(r#"{ "spam_threshold": 0.8 }"#).expect("known keys parse");
        assert_eq!(parsed.spam_threshold, 0.8);
        assert_eq!(parsed.min_token_count, 5);
    }
}
