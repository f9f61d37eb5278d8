//! Client profile catalog and fallback policy.

use crate::errors::is_bot_challenge;
use crate::supervisor::ProcessOutcome;

/// Identity presented to the extractor for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientProfile {
    /// Short name used in logs.
    pub name: &'static str,
    /// User-agent string.
    pub identity: &'static str,
    /// Value for `--extractor-args youtube:player_client=...`.
    pub player_client: &'static str,
    /// Position in the fallback order.
    pub ordinal: usize,
}

/// Identity used whenever cookies are configured, so the user agent matches
/// the browser the cookies were exported from.
pub const GENERIC_IDENTITY: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub static CLIENT_PROFILES: [ClientProfile; 4] = [
    ClientProfile {
        name: "android",
        identity: "com.google.android.youtube/19.09.37 (Linux; U; Android 14) gzip",
        player_client: "android",
        ordinal: 0,
    },
    ClientProfile {
        name: "ios",
        identity: "com.google.ios.youtube/19.09.3 (iPhone16,2; U; CPU iOS 17_4 like Mac OS X)",
        player_client: "ios",
        ordinal: 1,
    },
    ClientProfile {
        name: "web",
        identity: GENERIC_IDENTITY,
        player_client: "web",
        ordinal: 2,
    },
    ClientProfile {
        name: "mweb",
        identity: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
        player_client: "mweb",
        ordinal: 3,
    },
];

/// Walks the profile catalog when the extractor gets challenged.
#[derive(Debug, Clone, Copy)]
pub struct ProfileSequencer {
    profiles: &'static [ClientProfile],
}

impl Default for ProfileSequencer {
    fn default() -> Self {
        Self::new(&CLIENT_PROFILES)
    }
}

impl ProfileSequencer {
    pub fn new(profiles: &'static [ClientProfile]) -> Self {
        assert!(!profiles.is_empty(), "profile catalog must not be empty");
        Self { profiles }
    }

    pub fn initial(&self) -> usize {
        0
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn get(&self, index: usize) -> &'static ClientProfile {
        &self.profiles[index.min(self.profiles.len() - 1)]
    }

    /// Decide whether a failed attempt should be retried with the next profile.
    ///
    /// Only bot-challenge failures without cookies advance, and never past the
    /// last profile. Everything else is terminal.
    pub fn should_advance(&self, outcome: &ProcessOutcome, has_cookies: bool, index: usize) -> bool {
        if has_cookies || index + 1 >= self.profiles.len() {
            return false;
        }
        match outcome {
            ProcessOutcome::Failure { stdout, stderr, .. } => {
                is_bot_challenge(stderr) || is_bot_challenge(stdout)
            }
            _ => false,
        }
    }
}
