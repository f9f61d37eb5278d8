//! Configuration loading and parsing.
//!
//! Merges CLI flags / environment variables over an optional TOML file and
//! resolves defaults into [`Settings`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::Args;
use crate::cookies::CookieSources;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_WORK_DIR: &str = "temp";
const DEFAULT_PUBLIC_DIR: &str = "public";
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Top-level server configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    /// Bind host (defaults to 0.0.0.0).
    pub host: Option<String>,
    /// Listen port.
    pub port: Option<u16>,
    /// Working directory for artifacts.
    pub work_dir: Option<String>,
    /// Static asset directory.
    pub public_dir: Option<String>,
    /// Extractor binary path.
    pub extractor_path: Option<String>,
    /// Overall extraction budget per download, in seconds.
    pub timeout_secs: Option<u64>,
    /// Cookie sources.
    pub cookies: Option<CookiesConfig>,
}

/// Cookie source selectors from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct CookiesConfig {
    /// Browser name for `--cookies-from-browser`.
    pub browser: Option<String>,
    /// Inline base64 cookie file.
    pub base64: Option<String>,
    /// Path to a cookie file.
    pub file: Option<String>,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: SocketAddr,
    pub work_dir: PathBuf,
    pub public_dir: PathBuf,
    pub extractor_override: Option<PathBuf>,
    pub timeout: Duration,
    pub cookie_sources: CookieSources,
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ServerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Load the TOML file named by `--config`, or an empty config when absent.
pub fn load_config(path: Option<&PathBuf>) -> Result<ServerConfig> {
    match path {
        Some(path) => ServerConfig::load(path),
        None => Ok(ServerConfig::default()),
    }
}

/// Resolve settings with precedence CLI/env > TOML > defaults.
pub fn resolve_settings(args: &Args, cfg: &ServerConfig) -> Result<Settings> {
    let host = match args.host {
        Some(host) => host,
        None => match non_empty(cfg.host.as_deref()) {
            Some(host) => host
                .parse::<IpAddr>()
                .with_context(|| format!("parse host {host}"))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        },
    };
    let port = args.port.or(cfg.port).unwrap_or(DEFAULT_PORT);

    let work_dir = args
        .work_dir
        .clone()
        .or_else(|| non_empty(cfg.work_dir.as_deref()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR));
    let public_dir = args
        .public_dir
        .clone()
        .or_else(|| non_empty(cfg.public_dir.as_deref()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PUBLIC_DIR));
    let extractor_override = args
        .extractor_path
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .or_else(|| non_empty(cfg.extractor_path.as_deref()).map(PathBuf::from));

    let timeout_secs = args
        .timeout_secs
        .or(cfg.timeout_secs)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(anyhow::anyhow!("timeout_secs must be greater than zero"));
    }

    let file_cookies = cfg.cookies.as_ref();
    let cookie_sources = CookieSources {
        browser: non_empty(args.cookies_browser.as_deref())
            .or_else(|| non_empty(file_cookies.and_then(|c| c.browser.as_deref())))
            .map(str::to_string),
        inline_base64: non_empty(args.cookies_base64.as_deref())
            .or_else(|| non_empty(file_cookies.and_then(|c| c.base64.as_deref())))
            .map(str::to_string),
        file: args
            .cookies_file
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .or_else(|| {
                non_empty(file_cookies.and_then(|c| c.file.as_deref())).map(PathBuf::from)
            }),
    };

    Ok(Settings {
        bind: SocketAddr::new(host, port),
        work_dir,
        public_dir,
        extractor_override,
        timeout: Duration::from_secs(timeout_secs),
        cookie_sources,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
