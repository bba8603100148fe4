//! Configuration loading
//!
//! Reads an optional JSON5 file, substitutes `${VAR}` references from the
//! environment, and extracts a typed [`GatewayConfig`]. A missing file is not
//! an error; every key has a default. `WALLET_GATEWAY_DEV` and
//! `WALLET_GATEWAY_PORT` override the file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "WALLET_GATEWAY_CONFIG";

/// Environment override for development mode.
pub const DEV_MODE_ENV: &str = "WALLET_GATEWAY_DEV";

/// Environment override for the listening port.
pub const PORT_ENV: &str = "WALLET_GATEWAY_PORT";

pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.json5";
pub const DEFAULT_DEV_PORT: u16 = 8082;
pub const DEFAULT_DEV_ORIGIN: &str = "http://localhost:8080";
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 180;

const ENV_VAR_PATTERN: &str = r"\$\$?\{([A-Z_][A-Z0-9_]*)\}";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Settings the gateway reads at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub dev_mode: bool,
    pub dev_port: u16,
    /// `0` lets the OS pick a free port.
    pub port: u16,
    pub certificate_path: PathBuf,
    pub dev_origin: String,
    pub downloads_dir: Option<PathBuf>,
    pub keep_alive: Duration,
    /// Exposes the test keystore endpoints of the backend.
    pub testing: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            dev_port: DEFAULT_DEV_PORT,
            port: 0,
            certificate_path: PathBuf::from(crate::tls::DEFAULT_CERTIFICATE_PATH),
            dev_origin: DEFAULT_DEV_ORIGIN.to_string(),
            downloads_dir: None,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            testing: false,
        }
    }
}

impl GatewayConfig {
    /// Extract settings from a parsed config document.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let gateway = value.get("gateway");

        let dev_mode = read_bool(gateway, "devMode")?.unwrap_or(defaults.dev_mode);
        let dev_port = read_port(gateway, "devPort")?.unwrap_or(defaults.dev_port);
        let port = read_port(gateway, "port")?.unwrap_or(defaults.port);
        let certificate_path = read_str(gateway, "certificatePath")?
            .map(PathBuf::from)
            .unwrap_or(defaults.certificate_path);
        let dev_origin = read_str(gateway, "devOrigin")?
            .map(str::to_string)
            .unwrap_or(defaults.dev_origin);
        let downloads_dir = read_str(gateway, "downloadsDir")?.map(PathBuf::from);
        let keep_alive = match gateway.and_then(|g| g.get("keepAliveSecs")) {
            None => defaults.keep_alive,
            Some(v) => Duration::from_secs(v.as_u64().ok_or_else(|| ConfigError::InvalidValue {
                key: "gateway.keepAliveSecs".to_string(),
                message: format!("expected a non-negative integer, got {}", v),
            })?),
        };
        let testing = read_bool(value.get("backend"), "testing")?.unwrap_or(defaults.testing);

        Ok(Self {
            dev_mode,
            dev_port,
            port,
            certificate_path,
            dev_origin,
            downloads_dir,
            keep_alive,
            testing,
        })
    }

    /// Apply `WALLET_GATEWAY_DEV` and `WALLET_GATEWAY_PORT`.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw) = env::var(DEV_MODE_ENV) {
            self.dev_mode = parse_flag(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: DEV_MODE_ENV.to_string(),
                message: format!("expected a boolean, got {:?}", raw),
            })?;
        }
        if let Ok(raw) = env::var(PORT_ENV) {
            self.port = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: PORT_ENV.to_string(),
                message: format!("expected a port number, got {:?}", raw),
            })?;
        }
        Ok(())
    }

    /// Configured downloads directory, else the platform default.
    pub fn downloads_dir(&self) -> Option<PathBuf> {
        self.downloads_dir.clone().or_else(dirs::download_dir)
    }
}

/// Config file path: `WALLET_GATEWAY_CONFIG` or `config/gateway.json5`.
pub fn get_config_path() -> PathBuf {
    env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load the config from [`get_config_path`] with env overrides applied.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from(&get_config_path())
}

pub fn load_config_from(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let value = load_document(path)?;
    let mut config = GatewayConfig::from_value(&value)?;
    config.apply_env_overrides()?;
    debug!(target: "config", path = %path.display(), ?config, "configuration loaded");
    Ok(config)
}

/// Read and parse the raw document; `{}` when the file does not exist.
pub fn load_document(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut value = parse_json5(&content, path)?;
    substitute_env_vars(&mut value)?;
    Ok(value)
}

fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Replace `${VAR}` in every string; `$${VAR}` is a literal `${VAR}`.
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    let pattern = Regex::new(ENV_VAR_PATTERN).map_err(|e| ConfigError::InvalidValue {
        key: "env pattern".to_string(),
        message: e.to_string(),
    })?;
    substitute_in_value(value, &pattern)
}

fn substitute_in_value(value: &mut Value, pattern: &Regex) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => *s = substitute_env_in_string(s, pattern)?,
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_in_value(v, pattern)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_in_value(item, pattern)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_env_in_string(s: &str, pattern: &Regex) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in pattern.captures_iter(s) {
        let (Some(full), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        result.push_str(&s[last_end..full.start()]);
        if full.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", name.as_str()));
        } else {
            let value = env::var(name.as_str()).map_err(|_| ConfigError::MissingEnvVar {
                var: name.as_str().to_string(),
            })?;
            result.push_str(&value);
        }
        last_end = full.end();
    }
    result.push_str(&s[last_end..]);
    Ok(result)
}

fn read_bool(section: Option<&Value>, key: &str) -> Result<Option<bool>, ConfigError> {
    match section.and_then(|s| s.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => parse_flag(s).map(Some).ok_or_else(|| invalid(key, "a boolean", s)),
        Some(other) => Err(invalid(key, "a boolean", other)),
    }
}

fn read_port(section: Option<&Value>, key: &str) -> Result<Option<u16>, ConfigError> {
    match section.and_then(|s| s.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid(key, "a port number", v)),
    }
}

fn read_str<'a>(section: Option<&'a Value>, key: &str) -> Result<Option<&'a str>, ConfigError> {
    match section.and_then(|s| s.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(invalid(key, "a string", other)),
    }
}

fn invalid(key: &str, expected: &str, got: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected {}, got {}", expected, got),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serializes tests that touch process environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("gateway.json5");
        fs::write(&path, content).unwrap();
        path
    }

    fn clear_overrides() {
        env::remove_var(DEV_MODE_ENV);
        env::remove_var(PORT_ENV);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_overrides();
        let dir = TempDir::new().unwrap();
        let config = load_config_from(&dir.path().join("absent.json5")).unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.dev_port, 8082);
        assert_eq!(config.keep_alive, Duration::from_secs(180));
        assert_eq!(config.certificate_path, PathBuf::from("config/server.pem"));
    }

    #[test]
    fn test_json5_file_is_parsed() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_overrides();
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{
                // development setup
                gateway: {
                    devMode: true,
                    devPort: 9000,
                    certificatePath: "/tmp/cert.pem",
                    downloadsDir: "/data/downloads",
                    keepAliveSecs: 30,
                },
                backend: { testing: true },
            }"#,
        );
        let config = load_config_from(&path).unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.dev_port, 9000);
        assert_eq!(config.certificate_path, PathBuf::from("/tmp/cert.pem"));
        assert_eq!(config.downloads_dir(), Some(PathBuf::from("/data/downloads")));
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert!(config.testing);
    }

    #[test]
    fn test_parse_error_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{ gateway: ");
        let err = load_document(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("gateway.json5"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = GatewayConfig::from_value(&json!({"gateway": {"port": 70000}})).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = GatewayConfig::from_value(&json!({"gateway": {"devMode": 3}})).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err =
            GatewayConfig::from_value(&json!({"gateway": {"keepAliveSecs": -1}})).unwrap_err();
        assert!(err.to_string().contains("keepAliveSecs"));
    }

    #[test]
    fn test_string_flags_accepted() {
        let config =
            GatewayConfig::from_value(&json!({"gateway": {"devMode": "yes"}})).unwrap();
        assert!(config.dev_mode);
    }

    #[test]
    fn test_env_substitution() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::set_var("WALLET_GATEWAY_TEST_CERT_DIR", "/var/lib/gw");
        let mut value = json!({
            "gateway": {
                "certificatePath": "${WALLET_GATEWAY_TEST_CERT_DIR}/server.pem",
                "devOrigin": "$${NOT_SUBSTITUTED}",
            }
        });
        substitute_env_vars(&mut value).unwrap();
        env::remove_var("WALLET_GATEWAY_TEST_CERT_DIR");

        assert_eq!(value["gateway"]["certificatePath"], "/var/lib/gw/server.pem");
        assert_eq!(value["gateway"]["devOrigin"], "${NOT_SUBSTITUTED}");
    }

    #[test]
    fn test_missing_env_var_is_error() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::remove_var("WALLET_GATEWAY_TEST_UNSET");
        let mut value = json!({"a": "${WALLET_GATEWAY_TEST_UNSET}"});
        let err = substitute_env_vars(&mut value).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { var } if var == "WALLET_GATEWAY_TEST_UNSET"));
    }

    #[test]
    fn test_env_overrides_take_precedence() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{ gateway: { devMode: false, port: 1234 } }"#);

        env::set_var(DEV_MODE_ENV, "1");
        env::set_var(PORT_ENV, "4321");
        let config = load_config_from(&path);
        clear_overrides();

        let config = config.unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.port, 4321);
    }

    #[test]
    fn test_bad_env_override_is_error() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::set_var(PORT_ENV, "not-a-port");
        let result = GatewayConfig::default().apply_env_overrides();
        clear_overrides();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
