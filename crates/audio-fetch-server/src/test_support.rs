//! Helpers shared by unit tests.

use std::path::{Path, PathBuf};

use crate::extractor::ExtractorCommand;

/// Fresh directory under the system temp dir.
pub(crate) fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "audio-fetch-{tag}-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// `/bin/sh -c <script>` wrapped as an extractor command.
pub(crate) fn shell_command(script: &str) -> ExtractorCommand {
    ExtractorCommand::from_parts(Path::new("/bin/sh"), &["-c", script])
}

/// Write an executable stand-in for the extractor.
///
/// The script sees the real extractor argument vector in `"$@"`.
#[cfg(unix)]
pub(crate) fn fake_extractor(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-yt-dlp");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake extractor");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake extractor");
    path
}
