#![forbid(unsafe_code)]

//! Helpers shared by unit tests that need a fake fetch tool.

use std::{
    fs,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Writes an executable bash script named `yt-dlp` into `dir`.
pub fn install_ytdlp_stub(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("yt-dlp");
    let script = format!("#!/usr/bin/env bash\nset -u\n{body}\n");
    fs::write(&path, script).unwrap();
    #[cfg(unix)]
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Bash snippet that sets `$out` to the value following `-o`.
pub const PARSE_OUTPUT: &str = r#"out=""
prev=""
for arg in "$@"; do
  if [[ "$prev" == "-o" ]]; then out="$arg"; fi
  prev="$arg"
done"#;
