//! Error kinds produced while turning a request into an audio file.

use std::{io, path::PathBuf, process::ExitStatus, time::Duration};

use thiserror::Error;

/// Why a request did not yield an artifact, or what went wrong on the side.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Nothing usable was left after extracting the identifier.
    #[error("video identifier is empty")]
    InvalidIdentifier,

    /// Another request holds the identifier.
    #[error("video {id} is already being downloaded")]
    AlreadyInProgress { id: String },

    /// The downloader ran but no output file showed up.
    #[error("no output file produced for video {id}{}", describe_tool(.tool))]
    DownloadFailed {
        id: String,
        command: String,
        tool: Option<ToolFailure>,
    },

    /// A stale artifact could not be removed after a successful download.
    /// Only ever reported as a warning.
    #[error("cannot delete stale artifact {}: {source}", path.display())]
    CleanupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The downloader misbehaved but still left an output file behind.
    #[error(transparent)]
    Tool(#[from] ToolFailure),
}

/// Ways the external downloader can fail, kept apart for logging.
#[derive(Debug, Error)]
pub enum ToolFailure {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Exit { program: String, status: ExitStatus },

    #[error("{program} did not finish within {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
}

fn describe_tool(tool: &Option<ToolFailure>) -> String {
    tool.as_ref()
        .map(|failure| format!(" ({failure})"))
        .unwrap_or_default()
}
