//! The directory downloaded artifacts live in.

use std::{
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tracing::debug;

/// Sidecar written by the downloader next to each artifact.
pub const SIDECAR_SUFFIX: &str = ".info.json";

/// Fragments the downloader leaves behind while it is still working.
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl"];

/// Size and modification time of an artifact, used to tell whether the
/// downloader rewrote it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactStamp {
    len: u64,
    modified: Option<SystemTime>,
}

/// Flat directory of `<id>.<ext>` files produced by the downloader.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the directory if needed.
    pub fn ensure_root(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Output template handed to the downloader's `-o` flag.
    pub fn output_template(&self) -> String {
        self.root
            .join("%(id)s.%(ext)s")
            .to_string_lossy()
            .into_owned()
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Returns the name of the first artifact stored for `id`.
    ///
    /// Directory order decides between several candidates. A missing or
    /// unreadable directory simply means there is nothing yet.
    pub async fn find_existing(&self, id: &str) -> Option<String> {
        self.find_where(id, |_| true).await
    }

    /// Like [`find_existing`](Self::find_existing), restricted to artifact
    /// names accepted by `keep`.
    pub async fn find_where(&self, id: &str, keep: impl Fn(&str) -> bool) -> Option<String> {
        if id.is_empty() {
            return None;
        }
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %self.root.display(), %err, "storage directory not readable");
                return None;
            }
        };

        let prefix = format!("{id}.");
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_artifact_of(&name, &prefix) && keep(&name) {
                return Some(name);
            }
        }
        None
    }

    /// `None` when the file is gone or unreadable.
    pub async fn stamp(&self, file_name: &str) -> Option<ArtifactStamp> {
        let metadata = tokio::fs::metadata(self.path_for(file_name)).await.ok()?;
        Some(ArtifactStamp {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }

    pub async fn remove(&self, file_name: &str) -> io::Result<()> {
        tokio::fs::remove_file(self.path_for(file_name)).await
    }
}

fn is_artifact_of(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix)
        && !name.ends_with(SIDECAR_SUFFIX)
        && !PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Whether `file_name` carries the extension of the requested format.
/// No requested format accepts anything.
pub fn matches_format(file_name: &str, format: Option<&str>) -> bool {
    let Some(format) = format else {
        return true;
    };
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(format))
}
