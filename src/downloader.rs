//! Resolve-or-fetch orchestration around the external downloader.
//!
//! A request first checks the storage directory for an artifact left by an
//! earlier run. Only when nothing suitable exists is the downloader started,
//! and the directory is checked again afterwards: the presence of an output
//! file, not the tool's exit status, decides whether the request succeeded.
//! Every request for an identifier holds that identifier in the in-flight set
//! from start to finish so the tool never runs twice for the same video.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{
    error::{DownloadError, ToolFailure},
    in_flight::{InFlightGuard, InFlightSet},
    storage::{ArtifactStore, matches_format},
    video_id::extract_video_id,
};

pub const DEFAULT_DOWNLOADER_BIN: &str = "youtube-dl";
pub const DEFAULT_MAX_FILESIZE: &str = "20M";

/// Audio container the user asked the downloader to convert to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat(String);

impl AudioFormat {
    /// Returns `None` for blank input, meaning "whatever the tool produces".
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(Self(value.to_ascii_lowercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How to run the external downloader.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub program: PathBuf,
    /// Size cap used in the format selector, e.g. `20M`.
    pub max_filesize: String,
    /// Kill the tool after this long. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_DOWNLOADER_BIN),
            max_filesize: DEFAULT_MAX_FILESIZE.to_string(),
            timeout: None,
        }
    }
}

impl ToolConfig {
    /// Arguments for one download. The identifier always comes after `--` so
    /// it can never be taken for an option.
    pub fn arguments(&self, id: &str, template: &str, format: Option<&AudioFormat>) -> Vec<String> {
        let cap = &self.max_filesize;
        let mut args = vec![
            "-x".to_string(),
            "--write-info-json".to_string(),
            "--no-progress".to_string(),
            "-f".to_string(),
            format!("bestaudio[filesize<{cap}]/best[filesize<{cap}]/worstaudio/worst"),
            "-o".to_string(),
            template.to_string(),
        ];
        if let Some(format) = format {
            args.push("--audio-format".to_string());
            args.push(format.to_string());
        }
        args.push("--".to_string());
        args.push(id.to_string());
        args
    }

    fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

/// Human readable rendering of an invocation, for logs and error pages.
pub fn describe_command(program: &Path, args: &[String]) -> String {
    let mut rendered = program.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || "'\"[]<>*?&|;$".contains(c)) {
            rendered.push('\'');
            rendered.push_str(&arg.replace('\'', r"'\''"));
            rendered.push('\'');
        } else {
            rendered.push_str(arg);
        }
    }
    rendered
}

/// Successful outcome of a request.
#[derive(Debug)]
pub struct Resolution {
    /// Artifact name relative to the storage directory.
    pub file_name: String,
    /// The downloader invocation, or `None` when an existing file was reused.
    pub command: Option<String>,
    /// Problems that did not prevent the artifact from being produced.
    pub warnings: Vec<DownloadError>,
}

/// Shared handle; clones talk to the same in-flight set.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

struct DownloaderInner {
    store: ArtifactStore,
    tool: ToolConfig,
    in_flight: InFlightSet,
}

impl Downloader {
    pub fn new(store: ArtifactStore, tool: ToolConfig) -> Self {
        Self {
            inner: Arc::new(DownloaderInner {
                store,
                tool,
                in_flight: InFlightSet::new(),
            }),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    pub fn in_flight(&self) -> &InFlightSet {
        &self.inner.in_flight
    }

    /// Reserves `id` for the caller, or reports that someone else holds it.
    pub fn claim(&self, id: &str) -> Result<InFlightGuard<'_>, DownloadError> {
        self.inner
            .in_flight
            .claim(id)
            .ok_or_else(|| DownloadError::AlreadyInProgress { id: id.to_string() })
    }

    /// Full request path used by the front ends: extract the identifier,
    /// reserve it, resolve it, and release it again whatever happened.
    pub async fn request(
        &self,
        raw: &str,
        format: Option<&AudioFormat>,
    ) -> Result<Resolution, DownloadError> {
        let id = extract_video_id(raw);
        if id.is_empty() {
            return Err(DownloadError::InvalidIdentifier);
        }
        let guard = self.claim(&id)?;
        let result = self.resolve(guard.id(), format).await;
        drop(guard);
        result
    }

    /// Returns an artifact for `id`, downloading it when no suitable one
    /// exists. Callers are expected to hold the identifier via
    /// [`claim`](Self::claim).
    pub async fn resolve(
        &self,
        id: &str,
        format: Option<&AudioFormat>,
    ) -> Result<Resolution, DownloadError> {
        let store = &self.inner.store;
        let wanted = format.map(AudioFormat::as_str);

        if let Some(existing) = store
            .find_where(id, |name| matches_format(name, wanted))
            .await
        {
            info!(%id, file = %existing, "reusing existing artifact");
            return Ok(Resolution {
                file_name: existing,
                command: None,
                warnings: Vec::new(),
            });
        }

        // Anything still stored for `id` has the wrong format. It is replaced
        // only once the tool has produced something else.
        let stale = store.find_existing(id).await;
        if let Some(stale) = &stale {
            info!(
                %id,
                file = %stale,
                format = wanted.unwrap_or_default(),
                "existing artifact has the wrong format"
            );
        }

        let stale_stamp = match &stale {
            Some(name) => store.stamp(name).await,
            None => None,
        };

        let tool = &self.inner.tool;
        let args = tool.arguments(id, &store.output_template(), format);
        let command = describe_command(&tool.program, &args);
        info!(%id, %command, "running downloader");
        let tool_failure = run_tool(tool, &args).await.err();

        let fresh = |name: &str| stale.as_deref() != Some(name);
        let produced = match store
            .find_where(id, |name| fresh(name) && matches_format(name, wanted))
            .await
        {
            Some(name) => Some(name),
            None => store.find_where(id, fresh).await,
        };

        // Formats such as vorbis land under another extension, so the "stale"
        // file may be exactly what the tool just wrote again. Trust it when the
        // tool succeeded or the file changed during the run.
        let rewritten = match (&produced, &stale) {
            (None, Some(name)) => match store.stamp(name).await {
                Some(now) => tool_failure.is_none() || Some(now) != stale_stamp,
                None => false,
            },
            _ => false,
        };
        let (produced, stale) = if rewritten {
            debug!(%id, "downloader rewrote the existing artifact");
            (stale, None)
        } else {
            (produced, stale)
        };
        let Some(file_name) = produced else {
            warn!(%id, %command, "cannot find output file");
            return Err(DownloadError::DownloadFailed {
                id: id.to_string(),
                command,
                tool: tool_failure,
            });
        };

        let mut warnings = Vec::new();
        if let Some(failure) = tool_failure {
            warn!(%id, error = %failure, "downloader reported a failure but produced {file_name}");
            warnings.push(DownloadError::Tool(failure));
        }
        if let Some(stale) = stale {
            match store.remove(&stale).await {
                Ok(()) => debug!(%id, file = %stale, "removed stale artifact"),
                Err(source) => {
                    let err = DownloadError::CleanupFailed {
                        path: store.path_for(&stale),
                        source,
                    };
                    warn!(%id, error = %err, "stale artifact left behind");
                    warnings.push(err);
                }
            }
        }

        Ok(Resolution {
            file_name,
            command: Some(command),
            warnings,
        })
    }
}

async fn run_tool(tool: &ToolConfig, args: &[String]) -> Result<(), ToolFailure> {
    let program = tool.program_name();
    let child = Command::new(&tool.program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ToolFailure::Launch {
            program: program.clone(),
            source,
        })?;

    let output = match tool.timeout {
        Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolFailure::TimedOut {
                program: program.clone(),
                timeout,
            })?,
        None => child.wait_with_output().await,
    }
    .map_err(|source| ToolFailure::Launch {
        program: program.clone(),
        source,
    })?;

    debug!(
        stdout = %String::from_utf8_lossy(&output.stdout),
        "downloader output"
    );
    if output.status.success() {
        Ok(())
    } else {
        debug!(stderr = %String::from_utf8_lossy(&output.stderr), "downloader errors");
        Err(ToolFailure::Exit {
            program,
            status: output.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Fixture, WRITES_OUTPUT};
    use std::fs;
    use tempfile::tempdir;

    fn mp3() -> AudioFormat {
        AudioFormat::parse("mp3").unwrap()
    }

    #[test]
    fn audio_format_parse_normalizes() {
        assert_eq!(AudioFormat::parse("  "), None);
        assert_eq!(AudioFormat::parse(" MP3 ").unwrap().as_str(), "mp3");
    }

    #[test]
    fn arguments_follow_the_download_contract() {
        let tool = ToolConfig::default();
        let args = tool.arguments("alpha", "/tmp/ytdl/%(id)s.%(ext)s", None);
        assert_eq!(
            args,
            vec![
                "-x",
                "--write-info-json",
                "--no-progress",
                "-f",
                "bestaudio[filesize<20M]/best[filesize<20M]/worstaudio/worst",
                "-o",
                "/tmp/ytdl/%(id)s.%(ext)s",
                "--",
                "alpha",
            ]
        );

        let with_format = tool.arguments("-rf", "/t/%(id)s.%(ext)s", Some(&mp3()));
        let tail: Vec<_> = with_format.iter().rev().take(4).rev().cloned().collect();
        assert_eq!(tail, vec!["--audio-format", "mp3", "--", "-rf"]);
    }

    #[test]
    fn describe_command_quotes_special_arguments() {
        let rendered = describe_command(
            Path::new("youtube-dl"),
            &["-f".into(), "best[filesize<20M]".into(), "--".into(), "a b".into()],
        );
        assert_eq!(rendered, "youtube-dl -f 'best[filesize<20M]' -- 'a b'");
    }

    #[tokio::test]
    async fn existing_artifact_skips_the_tool() {
        let fixture = Fixture::new(WRITES_OUTPUT);
        fixture.put("alpha.webm");

        let resolution = fixture.downloader.resolve("alpha", None).await.unwrap();
        assert_eq!(resolution.file_name, "alpha.webm");
        assert!(resolution.command.is_none());
        assert!(fixture.invocations().is_empty());
    }

    #[tokio::test]
    async fn existing_artifact_with_requested_format_skips_the_tool() {
        let fixture = Fixture::new(WRITES_OUTPUT);
        fixture.put("alpha.mp3");

        let resolution = fixture
            .downloader
            .resolve("alpha", Some(&mp3()))
            .await
            .unwrap();
        assert_eq!(resolution.file_name, "alpha.mp3");
        assert!(fixture.invocations().is_empty());
    }

    #[tokio::test]
    async fn missing_artifact_is_downloaded() {
        let fixture = Fixture::new(WRITES_OUTPUT);

        let resolution = fixture.downloader.resolve("alpha", None).await.unwrap();
        assert_eq!(resolution.file_name, "alpha.m4a");
        assert!(resolution.warnings.is_empty());
        assert!(resolution.command.unwrap().contains("-- alpha"));
        assert_eq!(fixture.invocations(), vec!["alpha "]);
        assert!(fixture.storage.join("alpha.info.json").exists());
    }

    #[tokio::test]
    async fn wrong_format_is_replaced_after_download() {
        let fixture = Fixture::new(WRITES_OUTPUT);
        fixture.put("alpha.m4a");

        let resolution = fixture
            .downloader
            .resolve("alpha", Some(&mp3()))
            .await
            .unwrap();
        assert_eq!(fixture.invocations(), vec!["alpha mp3"]);
        assert_eq!(resolution.file_name, "alpha.mp3");
        assert!(resolution.warnings.is_empty());
        assert!(fixture.storage.join("alpha.mp3").exists());
        assert!(!fixture.storage.join("alpha.m4a").exists());
    }

    #[tokio::test]
    async fn wrong_format_is_kept_when_download_fails() {
        let fixture = Fixture::new("exit 1");
        fixture.put("alpha.m4a");

        let err = fixture
            .downloader
            .resolve("alpha", Some(&mp3()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::DownloadFailed {
                tool: Some(ToolFailure::Exit { .. }),
                ..
            }
        ));
        assert!(fixture.storage.join("alpha.m4a").exists());
    }

    const VORBIS_AS_OGG: &str = r#"
target=$(printf '%s' "$output" | sed "s/%(id)s/$id/; s/%(ext)s/ogg/")
echo "audio $(date +%s%N)" > "$target"
"#;

    #[tokio::test]
    async fn repeated_request_keeps_artifact_with_foreign_extension() {
        let fixture = Fixture::new(VORBIS_AS_OGG);
        let vorbis = AudioFormat::parse("vorbis").unwrap();

        let first = fixture
            .downloader
            .resolve("alpha", Some(&vorbis))
            .await
            .unwrap();
        assert_eq!(first.file_name, "alpha.ogg");

        let second = fixture
            .downloader
            .resolve("alpha", Some(&vorbis))
            .await
            .unwrap();
        assert_eq!(second.file_name, "alpha.ogg");
        assert!(second.warnings.is_empty());
        assert!(fixture.storage.join("alpha.ogg").exists());
        assert_eq!(fixture.invocations(), vec!["alpha vorbis", "alpha vorbis"]);
    }

    #[tokio::test]
    async fn rewritten_artifact_is_kept_despite_failing_exit() {
        let fixture = Fixture::new(&format!("{VORBIS_AS_OGG}\nexit 1"));
        fixture.put("alpha.ogg");
        let vorbis = AudioFormat::parse("vorbis").unwrap();

        let resolution = fixture
            .downloader
            .resolve("alpha", Some(&vorbis))
            .await
            .unwrap();
        assert_eq!(resolution.file_name, "alpha.ogg");
        assert!(matches!(
            resolution.warnings.as_slice(),
            [DownloadError::Tool(ToolFailure::Exit { .. })]
        ));
        assert!(fixture.storage.join("alpha.ogg").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cleanup_failure_is_only_a_warning() {
        let fixture = Fixture::new(WRITES_OUTPUT);
        // A directory named like an artifact cannot be removed with remove_file.
        fs::create_dir(fixture.storage.join("alpha.m4a")).unwrap();

        let resolution = fixture
            .downloader
            .resolve("alpha", Some(&mp3()))
            .await
            .unwrap();
        assert_eq!(resolution.file_name, "alpha.mp3");
        assert!(matches!(
            resolution.warnings.as_slice(),
            [DownloadError::CleanupFailed { .. }]
        ));
    }

    #[tokio::test]
    async fn no_output_is_a_failure_even_with_a_clean_exit() {
        let fixture = Fixture::new("exit 0");

        let err = fixture.downloader.resolve("alpha", None).await.unwrap_err();
        match err {
            DownloadError::DownloadFailed { id, tool, command } => {
                assert_eq!(id, "alpha");
                assert!(tool.is_none());
                assert!(command.ends_with("-- alpha"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn no_output_with_failing_tool_reports_the_exit() {
        let fixture = Fixture::new("echo boom >&2\nexit 3");

        let err = fixture.downloader.resolve("alpha", None).await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::DownloadFailed {
                tool: Some(ToolFailure::Exit { .. }),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn output_wins_over_non_zero_exit() {
        let fixture = Fixture::new(&format!("{WRITES_OUTPUT}\nexit 1"));

        let resolution = fixture.downloader.resolve("alpha", None).await.unwrap();
        assert_eq!(resolution.file_name, "alpha.m4a");
        assert_eq!(resolution.warnings.len(), 1);
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_failure() {
        let temp = tempdir().unwrap();
        let downloader = Downloader::new(
            ArtifactStore::new(temp.path()),
            ToolConfig {
                program: temp.path().join("does-not-exist"),
                ..ToolConfig::default()
            },
        );

        let err = downloader.resolve("alpha", None).await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::DownloadFailed {
                tool: Some(ToolFailure::Launch { .. }),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn slow_tool_is_killed_after_timeout() {
        let fixture = Fixture::with_timeout("sleep 5", Some(Duration::from_millis(200)));

        let err = fixture.downloader.resolve("alpha", None).await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::DownloadFailed {
                tool: Some(ToolFailure::TimedOut { .. }),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn request_rejects_empty_identifier() {
        let fixture = Fixture::new(WRITES_OUTPUT);
        let err = fixture
            .downloader
            .request("https://youtu.be/", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidIdentifier));
        assert!(fixture.invocations().is_empty());
    }

    #[tokio::test]
    async fn request_extracts_identifier_and_releases_it() {
        let fixture = Fixture::new(WRITES_OUTPUT);
        let resolution = fixture
            .downloader
            .request("https://www.youtube.com/watch?v=b8g1o8Ph7LQ", None)
            .await
            .unwrap();
        assert_eq!(resolution.file_name, "b8g1o8Ph7LQ.m4a");
        assert!(fixture.downloader.in_flight().is_empty());
    }

    #[tokio::test]
    async fn failed_request_still_releases_identifier() {
        let fixture = Fixture::new("exit 1");
        assert!(fixture.downloader.request("alpha", None).await.is_err());
        assert!(!fixture.downloader.in_flight().contains("alpha"));
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_id_run_the_tool_once() {
        let fixture = Fixture::new(&format!("sleep 1\n{WRITES_OUTPUT}"));

        let (first, second) = tokio::join!(
            fixture.downloader.request("alpha", None),
            fixture.downloader.request("https://youtu.be/alpha", None),
        );

        assert_eq!(first.unwrap().file_name, "alpha.m4a");
        assert!(matches!(
            second,
            Err(DownloadError::AlreadyInProgress { ref id }) if id == "alpha"
        ));
        assert_eq!(fixture.invocations().len(), 1);
        assert!(fixture.downloader.in_flight().is_empty());
    }

    #[tokio::test]
    async fn claim_blocks_other_requests() {
        let fixture = Fixture::new(WRITES_OUTPUT);
        let guard = fixture.downloader.claim("alpha").unwrap();
        let err = fixture.downloader.request("alpha", None).await.unwrap_err();
        assert!(matches!(err, DownloadError::AlreadyInProgress { .. }));
        drop(guard);
        assert!(fixture.downloader.request("alpha", None).await.is_ok());
    }
}
