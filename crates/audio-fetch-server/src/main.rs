//! Audio Fetch Server: an HTTP service that turns a media URL into a WAV file.
//!
//! ## Request flow
//! 1. **Validate**: the URL is trimmed and share links are canonicalized.
//! 2. **Extract**: `yt-dlp` runs under a deadline, rotating client profiles
//!    when the site challenges it as a bot.
//! 3. **Deliver**: the artifact is streamed back and deleted afterwards.

mod api;
mod artifact;
mod cli;
mod config;
mod cookies;
mod errors;
mod extractor;
mod job;
mod openapi;
mod profiles;
mod response_gate;
mod source_url;
mod startup;
mod state;
mod supervisor;
#[cfg(test)]
mod test_support;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,actix_web=info,audio_fetch_server=info")
        }))
        .init();

    startup::run(args).await
}
