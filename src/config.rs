use actix_web::http::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::errors::ConfigError;

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const CONFIG_PATH_ENV: &str = "PRINT_SERVER_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub response_headers: BTreeMap<String, String>,
    pub tls: TlsConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            response_headers: BTreeMap::new(),
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls.enabled {
            "https"
        } else {
            "http"
        }
    }

    /// Parses the configured response headers into typed pairs.
    pub fn header_pairs(&self) -> Result<Vec<(HeaderName, HeaderValue)>, ConfigError> {
        self.response_headers
            .iter()
            .map(|(name, value)| {
                let header_name = HeaderName::try_from(name.as_str())
                    .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
                let header_value = HeaderValue::try_from(value.as_str())
                    .map_err(|_| ConfigError::InvalidHeader(format!("{}: {}", name, value)))?;
                Ok((header_name, header_value))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.header_pairs()?;
        Ok(())
    }
}

pub fn parse_host(host: &str) -> Result<IpAddr, ConfigError> {
    host.trim()
        .parse()
        .map_err(|e| ConfigError::InvalidHost(format!("{}: {}", host, e)))
}

/// Parses a `Name: value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String), ConfigError> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| ConfigError::InvalidHeader(raw.to_string()))?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() || value.is_empty() {
        return Err(ConfigError::InvalidHeader(raw.to_string()));
    }
    Ok((name.to_string(), value.to_string()))
}

pub fn ensure_regular_file(path: &Path) -> Result<(), ConfigError> {
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(ConfigError::NotAFile {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Persisted settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `$PRINT_SERVER_CONFIG`, or `config.yaml` in the working directory.
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ServerConfig, ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                debug!("Loading config from {:?}", self.path);
                let config: ServerConfig = serde_yaml::from_str(&contents)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {:?}, using defaults", self.path);
                Ok(ServerConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Loads, applies `mutate`, validates and atomically writes the result back.
    pub fn transaction<F>(&self, mutate: F) -> Result<ServerConfig, ConfigError>
    where
        F: FnOnce(&mut ServerConfig) -> Result<(), ConfigError>,
    {
        let mut config = self.load()?;
        mutate(&mut config)?;
        config.validate()?;
        self.write(&config)?;
        Ok(config)
    }

    fn write(&self, config: &ServerConfig) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(config)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        std::io::Write::write_all(&mut tmp, yaml.as_bytes())?;
        tmp.persist(&self.path).map_err(|e| ConfigError::Io(e.error))?;

        info!("Saved config to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8888);
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:8888");
        assert!(!config.tls.enabled);
        assert!(!config.auth.enabled);
        assert_eq!(config.scheme(), "http");
    }

    #[test]
    fn test_yaml_uses_camel_case_keys() {
        let yaml = r#"
host: 127.0.0.1
port: 9100
responseHeaders:
  Access-Control-Allow-Origin: "*"
tls:
  enabled: true
  certFile: /etc/print/cert.pem
  keyFile: /etc/print/key.pem
auth:
  enabled: true
  username: admin
  password: secret
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.host, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(config.port, 9100);
        assert_eq!(config.response_headers["Access-Control-Allow-Origin"], "*");
        assert_eq!(config.tls.cert_file, PathBuf::from("/etc/print/cert.pem"));
        assert_eq!(config.auth.username, "admin");

        let out = serde_yaml::to_string(&config).unwrap();
        assert!(out.contains("responseHeaders:"));
        assert!(out.contains("certFile:"));
    }

    #[test]
    fn test_partial_yaml_falls_back_to_defaults() {
        let config: ServerConfig = serde_yaml::from_str("port: 9000\n").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, ServerConfig::default().host);
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut config = ServerConfig::default();
        config
            .response_headers
            .insert("Bad Header".to_string(), "x".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidHeader(_))));
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Access-Control-Allow-Origin: *").unwrap(),
            ("Access-Control-Allow-Origin".to_string(), "*".to_string())
        );
        assert!(parse_header("X-Missing-Colon").is_err());
        assert!(parse_header("X-Empty:   ").is_err());
    }

    #[test]
    fn test_parse_host() {
        assert!(parse_host("::1").is_ok());
        assert!(matches!(parse_host("localhost"), Err(ConfigError::InvalidHost(_))));
    }

    #[test]
    fn test_ensure_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ensure_regular_file(dir.path()),
            Err(ConfigError::NotAFile { .. })
        ));

        let file = dir.path().join("cert.pem");
        std::fs::write(&file, "pem").unwrap();
        assert!(ensure_regular_file(&file).is_ok());
        assert!(ensure_regular_file(&dir.path().join("missing.pem")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_regular_file_rejects_devices() {
        assert!(matches!(
            ensure_regular_file(Path::new("/dev/null")),
            Err(ConfigError::NotAFile { .. })
        ));
    }

    #[test]
    fn test_store_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("config.yaml"));
        assert_eq!(store.load().unwrap(), ServerConfig::default());
    }

    #[test]
    fn test_store_transaction_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("config.yaml"));

        let saved = store
            .transaction(|c| {
                c.port = 9191;
                c.auth.enabled = true;
                c.auth.username = "user".to_string();
                Ok(())
            })
            .unwrap();
        assert_eq!(saved.port, 9191);

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded, saved);
    }

    #[test]
    fn test_store_transaction_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("config.yaml"));

        let result = store.transaction(|c| {
            c.response_headers
                .insert("X-Good".to_string(), "bad\nvalue".to_string());
            Ok(())
        });
        assert!(result.is_err());
        assert!(!store.path().exists());
    }
}
