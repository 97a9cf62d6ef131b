use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Who may bind to a project's room and read its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomAccess {
    /// Any authenticated user.
    #[default]
    Permissive,
    /// Project members only.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: SocketAddr,
    pub jwt_secret: String,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub persist_timeout: Duration,
    pub room_access: RoomAccess,
    pub last_admin_guard: bool,
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            jwt_secret: String::new(),
            handshake_timeout: Duration::from_secs(10),
            persist_timeout: Duration::from_secs(5),
            room_access: RoomAccess::Permissive,
            last_admin_guard: true,
            tls: None,
        }
    }
}

impl Config {
    /// Reads `PROMA_CONFIG` (if set) and then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("PROMA_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Config::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("PROMA_BIND") {
            self.bind = value.parse().map_err(|_| ConfigError::Invalid {
                key: "PROMA_BIND",
                value,
            })?;
        }
        if let Some(value) = lookup("JWT_SECRET") {
            self.jwt_secret = value;
        }
        if let Some(value) = lookup("PROMA_ROOM_ACCESS") {
            self.room_access = match value.to_ascii_lowercase().as_str() {
                "permissive" => RoomAccess::Permissive,
                "strict" => RoomAccess::Strict,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "PROMA_ROOM_ACCESS",
                        value,
                    })
                }
            };
        }
        if let Some(value) = lookup("PROMA_LAST_ADMIN_GUARD") {
            self.last_admin_guard = value.parse().map_err(|_| ConfigError::Invalid {
                key: "PROMA_LAST_ADMIN_GUARD",
                value,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    #[test]
    fn toml_fills_missing_fields_with_defaults() {
        let config = Config::from_toml(
            r#"
            bind = "127.0.0.1:7000"
            persist_timeout = "250ms"
            room_access = "strict"

            [tls]
            cert_path = "ssl/cert.pem"
            key_path = "ssl/key.pem"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.persist_timeout, Duration::from_millis(250));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.room_access, RoomAccess::Strict);
        assert!(config.last_admin_guard);
        assert_eq!(config.tls.unwrap().cert_path, PathBuf::from("ssl/cert.pem"));
    }

    #[test]
    fn environment_overrides_take_precedence() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("JWT_SECRET", "s3cret"),
            ("PROMA_ROOM_ACCESS", "Strict"),
            ("PROMA_LAST_ADMIN_GUARD", "false"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.jwt_secret, "s3cret");
        assert_eq!(config.room_access, RoomAccess::Strict);
        assert!(!config.last_admin_guard);
    }

    #[test]
    fn bad_override_is_reported() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| (key == "PROMA_BIND").then(|| "nowhere".into()));
        assert_matches!(result, Err(ConfigError::Invalid { key: "PROMA_BIND", .. }));
    }
}
