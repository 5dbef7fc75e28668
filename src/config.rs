use anyhow::{Context, Result};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
};

use crate::thumbnail::DEFAULT_IMAGE_HOST;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tubefetch-env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_YTDLP: &str = "yt-dlp";
pub const DEFAULT_STATIC_ROOT: &str = "static";
pub const PORT_ENV: &str = "TUBEFETCH_PORT";

/// Used when no secret is configured. Startup warns about it.
pub const DEFAULT_SESSION_SECRET: &str = "tubefetch-dev-secret";

/// Raw values as they appear in the env file; unset keys stay `None`.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub session_secret: Option<String>,
    pub log_level: Option<String>,
    pub temp_root: Option<PathBuf>,
    pub ytdlp_path: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
    pub static_root: Option<PathBuf>,
    pub thumbnail_host: Option<String>,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub session_secret: String,
    pub log_level: String,
    pub temp_root: PathBuf,
    pub ytdlp_path: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub static_root: PathBuf,
    pub thumbnail_host: String,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("session_secret", &"<redacted>")
            .field("log_level", &self.log_level)
            .field("temp_root", &self.temp_root)
            .field("ytdlp_path", &self.ytdlp_path)
            .field("cookies_file", &self.cookies_file)
            .field("static_root", &self.static_root)
            .field("thumbnail_host", &self.thumbnail_host)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env_config(EnvConfig::default())
    }
}

impl ServerConfig {
    fn from_env_config(cfg: EnvConfig) -> Self {
        Self {
            host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cfg.port.unwrap_or(DEFAULT_PORT),
            session_secret: cfg
                .session_secret
                .unwrap_or_else(|| DEFAULT_SESSION_SECRET.to_string()),
            log_level: cfg
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            temp_root: cfg.temp_root.unwrap_or_else(env::temp_dir),
            ytdlp_path: cfg
                .ytdlp_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP)),
            cookies_file: cfg.cookies_file,
            static_root: cfg
                .static_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_ROOT)),
            thumbnail_host: cfg
                .thumbnail_host
                .unwrap_or_else(|| DEFAULT_IMAGE_HOST.to_string()),
        }
    }

    pub fn uses_default_secret(&self) -> bool {
        self.session_secret == DEFAULT_SESSION_SECRET
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            match key.trim() {
                "TUBEFETCH_HOST" => cfg.host = non_empty(value),
                "TUBEFETCH_PORT" => {
                    let port: u16 = value
                        .parse()
                        .with_context(|| format!("Parsing TUBEFETCH_PORT from {}", path.display()))?;
                    cfg.port = Some(port);
                }
                "SESSION_SECRET" => cfg.session_secret = non_empty(value),
                "LOG_LEVEL" => cfg.log_level = non_empty(value),
                "TEMP_ROOT" => cfg.temp_root = non_empty(value).map(PathBuf::from),
                "YTDLP_PATH" => cfg.ytdlp_path = non_empty(value).map(PathBuf::from),
                "COOKIES_FILE" => cfg.cookies_file = non_empty(value).map(PathBuf::from),
                "STATIC_ROOT" => cfg.static_root = non_empty(value).map(PathBuf::from),
                "THUMBNAIL_HOST" => cfg.thumbnail_host = non_empty(value),
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

/// Loads the config file, falling back to defaults when it does not exist.
pub fn load_server_config_from(path: impl AsRef<Path>) -> Result<ServerConfig> {
    let cfg = read_env_config(path.as_ref())?.unwrap_or_default();
    Ok(ServerConfig::from_env_config(cfg))
}

/// Applies a port given through the environment, which wins over the file.
pub fn apply_port_override(config: &mut ServerConfig, raw: Option<&str>) -> Result<()> {
    if let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        config.port = raw
            .parse()
            .with_context(|| format!("Parsing {PORT_ENV}={raw}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn read_env_config_extracts_port() {
        let cfg = make_config("# comment\nTUBEFETCH_PORT=\"4242\"\n\n");
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.port, Some(4242));
        assert!(parsed.host.is_none());
    }

    #[test]
    fn bad_port_is_an_error() {
        let cfg = make_config("TUBEFETCH_PORT=\"not-a-port\"\n");
        assert!(read_env_config(cfg.path()).is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_server_config_from(dir.path().join("absent")).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.ytdlp_path, PathBuf::from(DEFAULT_YTDLP));
        assert_eq!(config.thumbnail_host, DEFAULT_IMAGE_HOST);
        assert!(config.cookies_file.is_none());
        assert!(config.uses_default_secret());
    }

    #[test]
    fn file_values_override_defaults() {
        let cfg = make_config(
            "TUBEFETCH_HOST=\"0.0.0.0\"\nSESSION_SECRET=\"s3cret\"\nTEMP_ROOT=\"/var/tmp/tf\"\n\
             COOKIES_FILE=\"/etc/tubefetch/cookies.txt\"\nLOG_LEVEL=\"debug\"\nYTDLP_PATH=\"\"\n",
        );
        let config = load_server_config_from(cfg.path()).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:5000");
        assert_eq!(config.temp_root, PathBuf::from("/var/tmp/tf"));
        assert_eq!(
            config.cookies_file,
            Some(PathBuf::from("/etc/tubefetch/cookies.txt"))
        );
        assert_eq!(config.log_level, "debug");
        // Empty values keep the default.
        assert_eq!(config.ytdlp_path, PathBuf::from(DEFAULT_YTDLP));
        assert!(!config.uses_default_secret());
    }

    #[test]
    fn debug_redacts_secret() {
        let cfg = make_config("SESSION_SECRET=\"hunter2\"\n");
        let config = load_server_config_from(cfg.path()).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn port_override_from_environment() {
        let mut config = ServerConfig::default();
        apply_port_override(&mut config, Some("8081")).unwrap();
        assert_eq!(config.port, 8081);
        apply_port_override(&mut config, None).unwrap();
        assert_eq!(config.port, 8081);
        assert!(apply_port_override(&mut config, Some("99999")).is_err());
    }
}
