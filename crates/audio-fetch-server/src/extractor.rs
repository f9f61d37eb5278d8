//! Extractor binary resolution and argument-vector construction.
//!
//! Commands are always discrete argument tokens handed straight to `exec`;
//! nothing here is ever interpreted by a shell.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use crate::cookies::CookieConfig;
use crate::profiles::{ClientProfile, GENERIC_IDENTITY};

/// Bare command name looked up on `PATH` when no candidate exists.
pub const DEFAULT_EXTRACTOR: &str = "yt-dlp";

const EXTRACTOR_CANDIDATES: [&str; 3] = [
    "/usr/local/bin/yt-dlp",
    "/usr/bin/yt-dlp",
    "/opt/homebrew/bin/yt-dlp",
];

const POSTPROCESSOR_ARGS: &str = "ffmpeg:-acodec pcm_s16le -ar 44100 -threads 0 -preset ultrafast";

/// Extension of the artifact the extractor is asked to produce.
pub const AUDIO_EXTENSION: &str = "wav";

/// Pick the extractor binary: explicit override, else the first well-known
/// install location that exists, else the bare name resolved via `PATH`.
pub fn resolve_extractor_path(override_path: Option<&Path>) -> PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }
    EXTRACTOR_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXTRACTOR))
}

/// A fully built extractor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExtractorCommand {
    /// Download best audio and transcode it to 16-bit 44.1 kHz WAV.
    pub fn download(
        program: &Path,
        url: &str,
        output_template: &Path,
        profile: &ClientProfile,
        cookies: &CookieConfig,
    ) -> Self {
        let mut args: Vec<OsString> = [
            "-f",
            "bestaudio",
            "-x",
            "--audio-format",
            AUDIO_EXTENSION,
            "--no-playlist",
            "--postprocessor-args",
            POSTPROCESSOR_ARGS,
            "--no-warnings",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        push_identity(&mut args, profile, cookies);
        args.push("-o".into());
        args.push(output_template.into());
        push_url(&mut args, url);
        Self {
            program: program.to_path_buf(),
            args,
        }
    }

    /// Print the media title only.
    pub fn title(program: &Path, url: &str, profile: &ClientProfile, cookies: &CookieConfig) -> Self {
        let mut args: Vec<OsString> = vec!["--get-title".into(), "--no-playlist".into()];
        push_identity(&mut args, profile, cookies);
        push_url(&mut args, url);
        Self {
            program: program.to_path_buf(),
            args,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(program: &Path, args: &[&str]) -> Self {
        Self {
            program: program.to_path_buf(),
            args: args.iter().map(OsString::from).collect(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Program file name used in user-facing messages.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or_else(|| OsStr::new(DEFAULT_EXTRACTOR))
            .to_string_lossy()
            .to_string()
    }

    /// Render for logs only; never executed.
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }
}

/// Cookies pin the generic identity so the user agent matches the browser the
/// cookies came from; otherwise the profile picks both identity and client.
fn push_identity(args: &mut Vec<OsString>, profile: &ClientProfile, cookies: &CookieConfig) {
    args.push("--user-agent".into());
    if cookies.has_cookies() {
        args.push(GENERIC_IDENTITY.into());
        cookies.push_extractor_args(args);
    } else {
        args.push(profile.identity.into());
        args.push("--extractor-args".into());
        args.push(format!("youtube:player_client={}", profile.player_client).into());
    }
}

fn push_url(args: &mut Vec<OsString>, url: &str) {
    // `--` keeps a URL that starts with `-` from being parsed as an option.
    args.push("--".into());
    args.push(url.into());
}
