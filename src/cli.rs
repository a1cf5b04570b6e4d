use clap::Parser;
use std::path::PathBuf;

use crate::config::{parse_header, parse_host, ConfigStore, ServerConfig};
use crate::errors::ConfigError;

#[derive(Debug, Parser)]
#[command(
    name = "print_server",
    about = "HTTP print server for PDFs and web pages",
    version
)]
pub struct Args {
    /// Address to listen on.
    #[arg(long, value_name = "IP")]
    pub host: Option<String>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Response header added to every reply; may be repeated.
    #[arg(long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,

    /// Serve HTTPS using --cert-file and --key-file.
    #[arg(long)]
    pub tls: bool,

    #[arg(long, value_name = "PATH")]
    pub cert_file: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    pub key_file: Option<PathBuf>,

    /// Require Basic auth with this username.
    #[arg(long)]
    pub auth_username: Option<String>,

    /// Require Basic auth with this password.
    #[arg(long)]
    pub auth_password: Option<String>,

    /// Settings file (defaults to $PRINT_SERVER_CONFIG, then ./config.yaml).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Chrome or Chromium binary used to render pages.
    #[arg(long, env = "CHROME_PATH", value_name = "PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Write the resulting settings back to the settings file.
    #[arg(long)]
    pub save: bool,
}

impl Args {
    pub fn config_store(&self) -> ConfigStore {
        match &self.config {
            Some(path) => ConfigStore::open(path),
            None => ConfigStore::from_env(),
        }
    }

    /// Overlays the flags that were given onto `config`.
    pub fn apply(&self, config: &mut ServerConfig) -> Result<(), ConfigError> {
        if let Some(host) = &self.host {
            config.host = parse_host(host)?;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        // Any --header replaces the stored set rather than adding to it.
        if !self.headers.is_empty() {
            config.response_headers = self
                .headers
                .iter()
                .map(|raw| parse_header(raw))
                .collect::<Result<_, _>>()?;
        }

        if self.tls {
            config.tls.enabled = true;
        }
        if let Some(cert_file) = &self.cert_file {
            config.tls.cert_file = cert_file.clone();
        }
        if let Some(key_file) = &self.key_file {
            config.tls.key_file = key_file.clone();
        }

        if self.auth_username.is_some() || self.auth_password.is_some() {
            config.auth.enabled = true;
        }
        if let Some(username) = &self.auth_username {
            config.auth.username = username.clone();
        }
        if let Some(password) = &self.auth_password {
            config.auth.password = password.clone();
        }
        Ok(())
    }

    /// Loads the stored settings with the flags applied, saving them with `--save`.
    pub fn resolve_config(&self) -> Result<ServerConfig, ConfigError> {
        let store = self.config_store();
        if self.save {
            return store.transaction(|config| self.apply(config));
        }
        let mut config = store.load()?;
        self.apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("print_server").chain(extra.iter().copied())).unwrap()
    }

    #[test]
    fn test_no_flags_keeps_config() {
        let mut config = ServerConfig::default();
        args(&[]).apply(&mut config).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = ServerConfig::default();
        args(&[
            "--host",
            "127.0.0.1",
            "--port",
            "9100",
            "--header",
            "Access-Control-Allow-Origin: *",
            "--header",
            "X-Frame-Options: DENY",
            "--tls",
            "--cert-file",
            "cert.pem",
            "--key-file",
            "key.pem",
        ])
        .apply(&mut config)
        .unwrap();

        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:9100");
        assert_eq!(config.response_headers.len(), 2);
        assert_eq!(config.response_headers["X-Frame-Options"], "DENY");
        assert!(config.tls.enabled);
        assert_eq!(config.tls.key_file, PathBuf::from("key.pem"));
        assert!(!config.auth.enabled);
    }

    #[test]
    fn test_header_flags_replace_stored_headers() {
        let mut config = ServerConfig::default();
        config
            .response_headers
            .insert("X-Stale".to_string(), "1".to_string());
        config
            .response_headers
            .insert("X-Frame-Options".to_string(), "SAMEORIGIN".to_string());

        args(&["--header", "X-Frame-Options: DENY"])
            .apply(&mut config)
            .unwrap();
        assert_eq!(config.response_headers.len(), 1);
        assert_eq!(config.response_headers["X-Frame-Options"], "DENY");

        // Without the flag the stored headers are kept.
        args(&["--port", "9100"]).apply(&mut config).unwrap();
        assert_eq!(config.response_headers.len(), 1);
    }

    #[test]
    fn test_either_auth_flag_enables_auth() {
        let mut config = ServerConfig::default();
        args(&["--auth-password", "secret"]).apply(&mut config).unwrap();
        assert!(config.auth.enabled);
        assert_eq!(config.auth.username, "");
        assert_eq!(config.auth.password, "secret");
    }

    #[test]
    fn test_bad_header_and_host_rejected() {
        let mut config = ServerConfig::default();
        assert!(matches!(
            args(&["--header", "NoColon"]).apply(&mut config),
            Err(ConfigError::InvalidHeader(_))
        ));
        assert!(matches!(
            args(&["--host", "printer.local"]).apply(&mut config),
            Err(ConfigError::InvalidHost(_))
        ));
        assert!(Args::try_parse_from(["print_server", "--port", "70000"]).is_err());
    }

    #[test]
    fn test_save_persists_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        let path_arg = path.to_string_lossy().into_owned();

        let config = args(&["--config", &path_arg, "--port", "9300", "--save"])
            .resolve_config()
            .unwrap();
        assert_eq!(config.port, 9300);

        // Flags not given fall back to what was saved.
        let reloaded = args(&["--config", &path_arg]).resolve_config().unwrap();
        assert_eq!(reloaded.port, 9300);
    }

    #[test]
    fn test_without_save_nothing_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        let path_arg = path.to_string_lossy().into_owned();

        args(&["--config", &path_arg, "--port", "9300"])
            .resolve_config()
            .unwrap();
        assert!(!path.exists());
    }
}
