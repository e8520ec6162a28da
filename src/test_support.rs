//! Stand-in downloader scripts for tests.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use tempfile::{TempDir, tempdir};

use crate::{
    downloader::{Downloader, ToolConfig},
    storage::ArtifactStore,
};

/// Writes what the real tool would for `-o <template> [--audio-format f] -- <id>`.
pub const WRITES_OUTPUT: &str = r#"
ext="${format:-m4a}"
target=$(printf '%s' "$output" | sed "s/%(id)s/$id/; s/%(ext)s/$ext/")
sidecar=$(printf '%s' "$output" | sed "s/%(id)s/$id/; s/\.%(ext)s/.info.json/")
echo audio > "$target"
echo '{}' > "$sidecar"
"#;

/// Installs an executable `youtube-dl` script in `dir`. The script parses the
/// arguments into `$output`, `$format` and `$id`, appends `"$id $format"` to
/// `calls.log` next to itself, then runs `body`.
pub fn install_stub(dir: &Path, body: &str) -> PathBuf {
    let script_path = dir.join("youtube-dl");
    let script = format!(
        r#"#!/bin/sh
output=""
format=""
id=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) shift; output="$1" ;;
    --audio-format) shift; format="$1" ;;
    --) shift; id="$1" ;;
  esac
  shift
done
echo "$id $format" >> "$(dirname "$0")/calls.log"
{body}
"#
    );
    fs::write(&script_path, script).unwrap();
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
    }
    script_path
}

/// A storage directory plus a downloader wired to a stub script.
pub struct Fixture {
    _temp: TempDir,
    pub storage: PathBuf,
    calls: PathBuf,
    pub downloader: Downloader,
}

impl Fixture {
    pub fn new(body: &str) -> Self {
        Self::with_timeout(body, None)
    }

    pub fn with_timeout(body: &str, timeout: Option<Duration>) -> Self {
        let temp = tempdir().unwrap();
        let storage = temp.path().join("storage");
        fs::create_dir_all(&storage).unwrap();
        let bin = temp.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let calls = bin.join("calls.log");
        let program = install_stub(&bin, body);

        let downloader = Downloader::new(
            ArtifactStore::new(&storage),
            ToolConfig {
                program,
                timeout,
                ..ToolConfig::default()
            },
        );
        Self {
            _temp: temp,
            storage,
            calls,
            downloader,
        }
    }

    /// One `"<id> <format>"` line per tool invocation.
    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(&self.calls)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Drops a pre-existing artifact into storage.
    pub fn put(&self, name: &str) {
        fs::write(self.storage.join(name), "old").unwrap();
    }
}
