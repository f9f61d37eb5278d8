//! Cookie provisioning for the extractor.
//!
//! Cookie material is resolved exactly once at startup into an immutable
//! [`CookieConfig`] which every job borrows through an `Arc`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use base64::{Engine as _, engine::general_purpose};

/// File name used when inline cookie material is materialized on disk.
pub const COOKIE_FILE_NAME: &str = "cookies.txt";

/// Accepted first lines of a Netscape-format cookie jar.
const COOKIE_MAGIC_HEADERS: [&[u8]; 2] = [b"# Netscape HTTP Cookie File", b"# HTTP Cookie File"];

/// Raw cookie selectors gathered from CLI/env/TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieSources {
    pub browser: Option<String>,
    pub inline_base64: Option<String>,
    pub file: Option<PathBuf>,
}

/// Where the active cookie material came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieSource {
    None,
    Browser(String),
    Inline,
    File,
}

/// Immutable, process-wide cookie state.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    source: CookieSource,
    path: Option<PathBuf>,
    valid: bool,
}

impl CookieConfig {
    /// No cookies: jobs fall back to profile rotation.
    pub fn none() -> Self {
        Self {
            source: CookieSource::None,
            path: None,
            valid: false,
        }
    }

    pub fn browser(name: impl Into<String>) -> Self {
        Self {
            source: CookieSource::Browser(name.into()),
            path: None,
            valid: true,
        }
    }

    pub fn file(source: CookieSource, path: PathBuf) -> Self {
        Self {
            source,
            path: Some(path),
            valid: true,
        }
    }

    pub fn source(&self) -> &CookieSource {
        &self.source
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// True when the extractor will be handed cookie material.
    pub fn has_cookies(&self) -> bool {
        self.valid && self.source != CookieSource::None
    }

    /// Append the extractor flags that select this cookie source.
    pub fn push_extractor_args(&self, args: &mut Vec<OsString>) {
        if !self.has_cookies() {
            return;
        }
        match (&self.source, self.path.as_ref()) {
            (CookieSource::Browser(name), _) => {
                args.push("--cookies-from-browser".into());
                args.push(name.into());
            }
            (CookieSource::Inline | CookieSource::File, Some(path)) => {
                args.push("--cookies".into());
                args.push(path.into());
            }
            _ => {}
        }
    }
}

/// Resolve cookie material in priority order: browser, inline base64,
/// explicit file, conventional default file.
///
/// Failures are logged and fall through to the next source; provisioning never
/// aborts startup.
pub fn provision(sources: &CookieSources, work_dir: &Path, default_path: &Path) -> CookieConfig {
    if let Some(browser) = sources.browser.as_deref() {
        tracing::info!(browser = %browser, "using cookies from browser");
        return CookieConfig::browser(browser);
    }

    if let Some(encoded) = sources.inline_base64.as_deref() {
        let target = work_dir.join(COOKIE_FILE_NAME);
        match materialize_inline(encoded, &target) {
            Ok(()) => {
                tracing::info!(path = %target.display(), "materialized inline cookies");
                return CookieConfig::file(CookieSource::Inline, target);
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "ignoring inline cookies");
            }
        }
    }

    if let Some(path) = sources.file.as_ref() {
        if path.is_file() {
            tracing::info!(path = %path.display(), "using cookie file");
            return CookieConfig::file(CookieSource::File, path.clone());
        }
        tracing::warn!(path = %path.display(), "cookie file not found; ignoring");
    }

    if default_path.is_file() {
        tracing::info!(path = %default_path.display(), "using default cookie file");
        return CookieConfig::file(CookieSource::File, default_path.to_path_buf());
    }

    tracing::info!("no cookies configured; client profile rotation enabled");
    CookieConfig::none()
}

/// Decode, verify and persist base64 cookie material.
fn materialize_inline(encoded: &str, target: &Path) -> Result<()> {
    let decoded = decode_cookie_material(encoded)?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create cookie dir {:?}", parent))?;
    }
    std::fs::write(target, &decoded).with_context(|| format!("write cookies {:?}", target))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restrict cookies {:?}", target))?;
    }
    Ok(())
}

/// Decode base64 cookie material and check the cookie-jar header.
pub fn decode_cookie_material(encoded: &str) -> Result<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(anyhow!("cookie material is empty"));
    }
    let decoded = general_purpose::STANDARD
        .decode(compact.as_bytes())
        .context("decode base64 cookie material")?;
    let body = decoded.trim_ascii_start();
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    if !COOKIE_MAGIC_HEADERS
        .iter()
        .any(|magic| body.starts_with(magic))
    {
        return Err(anyhow!("decoded cookies are not a Netscape cookie file"));
    }
    Ok(decoded)
}
