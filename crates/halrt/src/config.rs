//! Runtime configuration read from `HALRT_*` environment variables or JSON.

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::check::DEFAULT_MAX_MISMATCHES;
use crate::hal::{HalError, HalResult};

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub interpreter_workers: usize,
    pub host_memory_limit: Option<usize>,
    pub dylib_cache_dir: PathBuf,
    pub dylib_compiler: String,
    pub cuda_library: Option<PathBuf>,
    pub check_max_mismatches: usize,
    pub default_driver: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interpreter_workers: 2,
            host_memory_limit: None,
            dylib_cache_dir: env::temp_dir().join("halrt_dylib"),
            dylib_compiler: "cc".to_string(),
            cuda_library: None,
            check_max_mismatches: DEFAULT_MAX_MISMATCHES,
            default_driver: "interp".to_string(),
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

/// Accepts plain integers and `k`/`m`/`g` suffixes (binary multiples).
fn parse_size(value: &str) -> Option<usize> {
    let normalized = value.trim().to_ascii_lowercase();
    let (digits, scale) = match normalized.chars().last()? {
        'k' => (&normalized[..normalized.len() - 1], 1usize << 10),
        'm' => (&normalized[..normalized.len() - 1], 1 << 20),
        'g' => (&normalized[..normalized.len() - 1], 1 << 30),
        _ => (normalized.as_str(), 1),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(scale)
}

fn parse_env<T>(key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let value = non_empty(key)?;
    let parsed = parse(&value);
    if parsed.is_none() {
        tracing::warn!(key, value = %value, "ignoring unparsable configuration value");
    }
    parsed
}

impl RuntimeConfig {
    /// Defaults overridden by whichever environment variables are set.
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workers) = parse_env("HALRT_INTERP_WORKERS", |v| v.parse::<usize>().ok()) {
            config.interpreter_workers = workers.max(1);
        }
        if let Some(value) = non_empty("HALRT_HOST_MEMORY_LIMIT") {
            match value.to_ascii_lowercase().as_str() {
                "none" | "off" | "0" => config.host_memory_limit = None,
                _ => {
                    if let Some(limit) = parse_env("HALRT_HOST_MEMORY_LIMIT", parse_size) {
                        config.host_memory_limit = Some(limit);
                    }
                }
            }
        }
        if let Some(dir) = non_empty("HALRT_DYLIB_CACHE_DIR") {
            config.dylib_cache_dir = PathBuf::from(dir);
        }
        if let Some(cc) = non_empty("CC") {
            config.dylib_compiler = cc;
        }
        if let Some(path) = non_empty("HALRT_CUDA_LIBRARY") {
            config.cuda_library = Some(PathBuf::from(path));
        }
        if let Some(max) = parse_env("HALRT_CHECK_MAX_MISMATCHES", |v| v.parse::<usize>().ok()) {
            config.check_max_mismatches = max;
        }
        if let Some(driver) = non_empty("HALRT_DRIVER") {
            config.default_driver = driver;
        }
        config
    }

    pub fn from_json(text: &str) -> HalResult<Self> {
        serde_json::from_str(text)
            .map_err(|err| HalError::invalid_argument(format!("invalid runtime config: {err}")))
    }

    /// Environment view, read once per process.
    pub fn global() -> &'static RuntimeConfig {
        GLOBAL.get_or_init(|| {
            let config = Self::from_env();
            tracing::debug!(?config, "runtime configuration loaded");
            config
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_accept_binary_suffixes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("64k"), Some(64 << 10));
        assert_eq!(parse_size(" 2M "), Some(2 << 20));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = RuntimeConfig::from_json(r#"{"interpreter_workers": 4}"#).unwrap();
        assert_eq!(config.interpreter_workers, 4);
        assert_eq!(config.check_max_mismatches, DEFAULT_MAX_MISMATCHES);
        assert_eq!(config.default_driver, "interp");
    }

    #[test]
    fn malformed_json_is_invalid_argument() {
        let err = RuntimeConfig::from_json("{").unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }
}
