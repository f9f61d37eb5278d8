//! Source URL validation and share-link canonicalization.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::DownloadError;

static VIDEO_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:youtube\.com/watch\?(?:[^#\s]*&)?v=|youtu\.be/|youtube\.com/(?:shorts|embed|live)/)([^&\s?#/]+)",
    )
    .expect("video id regex")
});

/// Validate a request URL and rewrite recognized share links into the
/// long-form watch URL carrying only the video id.
pub fn normalize_source_url(raw: Option<&str>) -> Result<String, DownloadError> {
    let url = raw.map(str::trim).unwrap_or_default();
    if url.is_empty() {
        return Err(DownloadError::Validation("URL is required".to_string()));
    }
    Ok(canonicalize(url))
}

fn canonicalize(url: &str) -> String {
    match VIDEO_ID.captures(url) {
        Some(caps) => format!("https://www.youtube.com/watch?v={}", &caps[1]),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_link_is_canonicalized() {
        assert_eq!(
            normalize_source_url(Some("https://youtu.be/abc123?t=5")).unwrap(),
            "https://www.youtube.com/watch?v=abc123"
        );
    }

    #[test]
    fn watch_url_drops_extra_params() {
        assert_eq!(
            normalize_source_url(Some("https://www.youtube.com/watch?v=abc123&list=PL1&index=2"))
                .unwrap(),
            "https://www.youtube.com/watch?v=abc123"
        );
        assert_eq!(
            normalize_source_url(Some("https://m.youtube.com/watch?feature=share&v=xyz")).unwrap(),
            "https://www.youtube.com/watch?v=xyz"
        );
    }

    #[test]
    fn shorts_are_canonicalized() {
        assert_eq!(
            normalize_source_url(Some("https://youtube.com/shorts/q1w2e3?feature=share")).unwrap(),
            "https://www.youtube.com/watch?v=q1w2e3"
        );
    }

    #[test]
    fn other_hosts_pass_through_trimmed() {
        assert_eq!(
            normalize_source_url(Some("  https://soundcloud.com/artist/track ")).unwrap(),
            "https://soundcloud.com/artist/track"
        );
    }

    #[test]
    fn missing_url_is_a_validation_error() {
        for raw in [None, Some(""), Some("   ")] {
            assert_eq!(
                normalize_source_url(raw),
                Err(DownloadError::Validation("URL is required".to_string()))
            );
        }
    }
}
