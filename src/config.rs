//! Harness options: defaults, then a TOML file, then `TEMPO_*` environment
//! overrides.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "TEMPO_CONFIG";
/// Config file picked up from the working directory when nothing else is set.
pub const DEFAULT_CONFIG_FILE: &str = "tempo.toml";

static GLOBAL: OnceLock<Arc<Options>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Global kill switch: when off, breakpoints call their target directly.
    pub enable_intrusive_profiling: bool,
    /// Hand batching and inserts to a background worker instead of blocking.
    pub enable_asynchronous_payload_delivery: bool,
    /// Base connection URL. Unset means SQLite files in the temp directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_url: Option<String>,
    /// Database used when neither the breakpoint nor the test context names one.
    pub database_name: String,
    /// Test case name used when neither the breakpoint nor the test context names one.
    pub test_case_name: String,
    /// Jobs the async delivery worker will queue before dropping new ones.
    pub delivery_queue_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable_intrusive_profiling: true,
            enable_asynchronous_payload_delivery: false,
            connection_url: None,
            database_name: "tempo".into(),
            test_case_name: "default".into(),
            delivery_queue_capacity: 256,
        }
    }
}

impl Options {
    /// Parse options from TOML text. `origin` names the source in errors.
    pub fn from_toml(text: &str, origin: &str) -> Result<Self, Error> {
        let options: Options =
            toml_edit::de::from_str(text).map_err(|e| Error::InvalidConfig {
                origin: origin.to_owned(),
                reason: e.to_string().trim().to_owned(),
            })?;
        options.validate(origin)?;
        Ok(options)
    }

    /// Load options the way the CLI and harnesses do.
    ///
    /// File: `explicit`, else `$TEMPO_CONFIG`, else `./tempo.toml` if present,
    /// else defaults. Environment overrides are applied on top.
    pub fn load(explicit: Option<&Path>) -> Result<Self, Error> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                local.is_file().then_some(local)
            });

        let mut options = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
                    path: path.clone(),
                    source,
                })?;
                Options::from_toml(&text, &path.display().to_string())?
            }
            None => Options::default(),
        };
        options.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(options)
    }

    /// Process-wide options, loaded with [`Options::load`] on first use and
    /// fixed for the life of the process.
    ///
    /// Breakpoints built without explicit options use these, so the kill
    /// switch and the connection settings in `tempo.toml` or `TEMPO_*` reach
    /// every breakpoint. A configuration that fails to load is logged and
    /// replaced by defaults.
    pub fn global() -> Arc<Options> {
        Arc::clone(GLOBAL.get_or_init(|| {
            let options = Options::load(None).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring tempo configuration, using defaults");
                Options::default()
            });
            Arc::new(options)
        }))
    }

    /// Apply `TEMPO_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), Error> {
        if let Some(v) = lookup("TEMPO_ENABLE_INTRUSIVE_PROFILING") {
            self.enable_intrusive_profiling = parse_bool("TEMPO_ENABLE_INTRUSIVE_PROFILING", &v)?;
        }
        if let Some(v) = lookup("TEMPO_ENABLE_ASYNCHRONOUS_PAYLOAD_DELIVERY") {
            self.enable_asynchronous_payload_delivery =
                parse_bool("TEMPO_ENABLE_ASYNCHRONOUS_PAYLOAD_DELIVERY", &v)?;
        }
        if let Some(v) = lookup("TEMPO_CONNECTION_URL") {
            self.connection_url = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = lookup("TEMPO_DATABASE_NAME") {
            self.database_name = v;
        }
        if let Some(v) = lookup("TEMPO_TEST_CASE_NAME") {
            self.test_case_name = v;
        }
        self.validate("environment")
    }

    /// Render as TOML, the format `from_toml` reads.
    pub fn to_toml(&self) -> String {
        // Every field is a plain scalar, so serialization cannot fail.
        toml_edit::ser::to_string_pretty(self).unwrap_or_default()
    }

    fn validate(&self, origin: &str) -> Result<(), Error> {
        let invalid = |reason: &str| Error::InvalidConfig {
            origin: origin.to_owned(),
            reason: reason.to_owned(),
        };
        if self.database_name.trim().is_empty() {
            return Err(invalid("database_name must not be empty"));
        }
        if self.delivery_queue_capacity == 0 {
            return Err(invalid("delivery_queue_capacity must be at least 1"));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::InvalidConfig {
            origin: key.to_owned(),
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let options = Options::from_toml("", "test").unwrap();
        assert_eq!(options, Options::default());
        assert!(options.enable_intrusive_profiling);
        assert!(!options.enable_asynchronous_payload_delivery);
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let options = Options::from_toml(
            r#"
enable_asynchronous_payload_delivery = true
connection_url = "sqlite:///var/lib/tempo/"
database_name = "bench"
"#,
            "test",
        )
        .unwrap();
        assert!(options.enable_asynchronous_payload_delivery);
        assert_eq!(options.connection_url.as_deref(), Some("sqlite:///var/lib/tempo/"));
        assert_eq!(options.database_name, "bench");
        assert_eq!(options.test_case_name, "default");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Options::from_toml("enable_profiling = true", "tempo.toml").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("tempo.toml"), "unexpected error: {msg}");
        assert!(msg.contains("enable_profiling"), "unexpected error: {msg}");
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let err = Options::from_toml("delivery_queue_capacity = 0", "test").unwrap_err();
        assert!(err.to_string().contains("delivery_queue_capacity"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut options = Options::from_toml("enable_intrusive_profiling = true", "test").unwrap();
        options
            .apply_overrides(env(&[
                ("TEMPO_ENABLE_INTRUSIVE_PROFILING", "off"),
                ("TEMPO_ENABLE_ASYNCHRONOUS_PAYLOAD_DELIVERY", "YES"),
                ("TEMPO_DATABASE_NAME", "ci"),
            ]))
            .unwrap();
        assert!(!options.enable_intrusive_profiling);
        assert!(options.enable_asynchronous_payload_delivery);
        assert_eq!(options.database_name, "ci");
    }

    #[test]
    fn empty_connection_url_override_clears_it() {
        let mut options = Options {
            connection_url: Some("sqlite:///tmp/".into()),
            ..Options::default()
        };
        options
            .apply_overrides(env(&[("TEMPO_CONNECTION_URL", "")]))
            .unwrap();
        assert_eq!(options.connection_url, None);
    }

    #[test]
    fn bad_boolean_names_the_variable() {
        let mut options = Options::default();
        let err = options
            .apply_overrides(env(&[("TEMPO_ENABLE_INTRUSIVE_PROFILING", "maybe")]))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("TEMPO_ENABLE_INTRUSIVE_PROFILING"), "{msg}");
        assert!(msg.contains("maybe"), "{msg}");
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tempo.toml");
        fs::write(&path, "test_case_name = \"nightly\"\n").unwrap();
        let options = Options::load(Some(&path)).unwrap();
        assert_eq!(options.test_case_name, "nightly");
    }

    #[test]
    fn load_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = Options::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }), "got {err:?}");
    }

    #[test]
    fn to_toml_round_trips() {
        let options = Options {
            connection_url: Some("file:///tmp/runs".into()),
            delivery_queue_capacity: 8,
            ..Options::default()
        };
        let text = options.to_toml();
        assert_eq!(Options::from_toml(&text, "rendered").unwrap(), options);
    }
}
