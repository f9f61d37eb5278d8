//! Download failure taxonomy and diagnostic classification.
//!
//! The extractor reports failures as free-form text on stderr. The signature
//! table below maps known phrases to failure kinds; the phrases are empirical
//! and follow whatever the extractor currently prints.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use actix_web::HttpResponse;
use audio_fetch_types::ErrorResponse;
use regex::Regex;

const GENERIC_FAILURE: &str = "Failed to download audio";
const DIAGNOSTIC_TAIL_LINES: usize = 3;

/// Exit status a POSIX shell uses for "command not found".
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

static ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ERROR:\s*(.+?)\s*(?:\n|$)").expect("error line regex"));

/// Failure kinds a signature can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    BotChallenge,
    ToolMissing,
}

/// Lowercase substrings matched against extractor diagnostics.
pub const DIAGNOSTIC_SIGNATURES: &[(&str, SignatureKind)] = &[
    ("sign in to confirm", SignatureKind::BotChallenge),
    ("not a bot", SignatureKind::BotChallenge),
    ("confirm you're not a robot", SignatureKind::BotChallenge),
    ("http error 429", SignatureKind::BotChallenge),
    ("too many requests", SignatureKind::BotChallenge),
    ("captcha", SignatureKind::BotChallenge),
    ("command not found", SignatureKind::ToolMissing),
];

/// Return the first signature kind found in `text` (case-insensitive).
pub fn match_signature(text: &str) -> Option<SignatureKind> {
    if text.is_empty() {
        return None;
    }
    let lower = text.to_lowercase();
    DIAGNOSTIC_SIGNATURES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, kind)| *kind)
}

/// True when the diagnostic text says the extractor was challenged as a bot.
pub fn is_bot_challenge(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let lower = text.to_lowercase();
    DIAGNOSTIC_SIGNATURES
        .iter()
        .any(|(needle, kind)| *kind == SignatureKind::BotChallenge && lower.contains(needle))
}

/// Terminal outcome of a download job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    /// Missing or malformed URL.
    Validation(String),
    /// Extractor binary missing.
    ToolNotFound { tool: String },
    /// Spawning the extractor failed for another reason.
    SpawnFailure(String),
    /// Every profile was challenged.
    BotDetection { message: String },
    /// The extractor exited non-zero.
    Extraction { message: String },
    /// The job deadline passed.
    ProcessTimeout { elapsed: Duration },
    /// The extractor was terminated by a signal.
    ProcessKilled { signal: Option<i32> },
    /// The extractor succeeded but no artifact appeared.
    OutputMissing,
    /// The work directory could not be read.
    Io(String),
    /// Streaming the artifact to the client failed.
    Delivery(String),
}

impl DownloadError {
    /// Message placed in the JSON error body.
    pub fn message(&self) -> String {
        match self {
            DownloadError::Validation(msg) => msg.clone(),
            DownloadError::ToolNotFound { tool } => {
                format!("{tool} is not installed. Please install it first.")
            }
            DownloadError::SpawnFailure(cause) => {
                format!("Failed to start download process: {cause}")
            }
            DownloadError::BotDetection { message } | DownloadError::Extraction { message } => {
                message.clone()
            }
            DownloadError::ProcessTimeout { elapsed } => format!(
                "Download timeout after {:.1} seconds. The video may be too long or the server is slow.",
                elapsed.as_secs_f64()
            ),
            DownloadError::ProcessKilled { .. } => {
                "Download was terminated. The process may have been killed.".to_string()
            }
            DownloadError::OutputMissing => "Audio file not found after conversion".to_string(),
            DownloadError::Io(_) => "Error processing file".to_string(),
            DownloadError::Delivery(cause) => format!("Failed to send audio: {cause}"),
        }
    }

    /// Stable kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DownloadError::Validation(_) => "validation",
            DownloadError::ToolNotFound { .. } => "tool_not_found",
            DownloadError::SpawnFailure(_) => "spawn_failure",
            DownloadError::BotDetection { .. } => "bot_detection",
            DownloadError::Extraction { .. } => "extraction",
            DownloadError::ProcessTimeout { .. } => "timeout",
            DownloadError::ProcessKilled { .. } => "killed",
            DownloadError::OutputMissing => "output_missing",
            DownloadError::Io(_) => "io",
            DownloadError::Delivery(_) => "delivery",
        }
    }

    /// Convert a download error into an HTTP response.
    pub fn into_response(self) -> HttpResponse {
        let body = ErrorResponse::new(self.message());
        match self {
            DownloadError::Validation(_) => HttpResponse::BadRequest().json(body),
            _ => HttpResponse::InternalServerError().json(body),
        }
    }
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::Io(cause) => write!(f, "{}: {cause}", self.message()),
            _ => f.write_str(&self.message()),
        }
    }
}

impl std::error::Error for DownloadError {}

/// Classify a non-zero extractor exit into a terminal error.
pub fn classify_failure(
    tool: &str,
    exit_code: Option<i32>,
    signal: Option<i32>,
    stderr: &str,
) -> DownloadError {
    if let Some(signal) = signal {
        return DownloadError::ProcessKilled {
            signal: Some(signal),
        };
    }
    if exit_code == Some(EXIT_COMMAND_NOT_FOUND)
        || match_signature(stderr) == Some(SignatureKind::ToolMissing)
    {
        return DownloadError::ToolNotFound {
            tool: tool.to_string(),
        };
    }
    let message = diagnostic_message(stderr);
    if is_bot_challenge(stderr) {
        DownloadError::BotDetection { message }
    } else {
        DownloadError::Extraction { message }
    }
}

/// Pick the most useful line from extractor diagnostics: the first `ERROR:`
/// line, else the last few non-empty lines, else a generic message.
pub fn diagnostic_message(stderr: &str) -> String {
    if let Some(caps) = ERROR_LINE.captures(stderr) {
        let msg = caps[1].trim();
        if !msg.is_empty() {
            return msg.to_string();
        }
    }
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.is_empty() {
        return GENERIC_FAILURE.to_string();
    }
    let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    lines[start..].join(" ")
}
