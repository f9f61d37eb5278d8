use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug, Default)]
#[command(name = "audio-fetch-server", version = VERSION)]
pub struct Args {
    /// Optional server config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// HTTP bind host, e.g. 0.0.0.0
    #[arg(long, env = "HOST")]
    pub host: Option<IpAddr>,

    /// HTTP listen port
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Directory for per-job audio artifacts and the materialized cookie file
    #[arg(long, env = "WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Directory of static files served at `/`
    #[arg(long, env = "PUBLIC_DIR")]
    pub public_dir: Option<PathBuf>,

    /// Extractor binary override (defaults to the first yt-dlp found)
    #[arg(long, env = "YTDLP_PATH")]
    pub extractor_path: Option<PathBuf>,

    /// Browser to read cookies from (passed to --cookies-from-browser)
    #[arg(long, env = "YTDLP_COOKIES_BROWSER")]
    pub cookies_browser: Option<String>,

    /// Base64-encoded Netscape cookie file
    #[arg(long, env = "YTDLP_COOKIES_BASE64", hide_env_values = true)]
    pub cookies_base64: Option<String>,

    /// Path to a Netscape cookie file
    #[arg(long, env = "YTDLP_COOKIES_FILE")]
    pub cookies_file: Option<PathBuf>,

    /// Wall-clock budget for all extractor attempts of one download, in seconds
    #[arg(long, env = "DOWNLOAD_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,
}
