//! Score and performance files fetched from the cloud service.

use async_trait::async_trait;
use futures::StreamExt;
use anyhow::bail;
use reqwest::{Client, Url};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

/// Which file to fetch for a given id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Score,
    Audio,
    Midi,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Score => "score",
            FileKind::Audio => "audio",
            FileKind::Midi => "midi",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of score and performance files.
///
/// `None` means the file could not be retrieved. Implementations log the
/// reason; callers do not retry.
#[async_trait]
pub trait FileProvider: Send + Sync {
    async fn fetch(&self, id: &str, kind: FileKind, dest: &Path) -> Option<PathBuf>;
}

/// Fetches files from the cloud service's `get-*-file-by-id` endpoints.
pub struct CloudFileProvider {
    client: Client,
    base_url: Url,
}

impl CloudFileProvider {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            bail!("cloud base url {} cannot hold a path", base_url);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// Endpoint for one file. The id is a single percent-encoded path segment.
    pub fn url_for(&self, id: &str, kind: FileKind) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("cloud")
                .push(&format!("get-{}-file-by-id", kind))
                .push(id);
        }
        url
    }

    async fn download(&self, id: &str, kind: FileKind, dest: &Path) -> anyhow::Result<Option<PathBuf>> {
        let url = self.url_for(id, kind);
        debug!(%url, "fetching {} file", kind);

        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            error!(%url, status = %response.status(), "cloud service refused file request");
            return Ok(None);
        }

        let Some(original) = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename)
        else {
            error!(%url, "response has no content-disposition filename");
            return Ok(None);
        };

        let path = dest.join(stored_file_name(kind, &original, chrono::Local::now()));
        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;

        debug!(path = %path.display(), bytes = written, "stored {} file", kind);
        Ok(Some(path))
    }
}

#[async_trait]
impl FileProvider for CloudFileProvider {
    async fn fetch(&self, id: &str, kind: FileKind, dest: &Path) -> Option<PathBuf> {
        match self.download(id, kind, dest).await {
            Ok(path) => path,
            Err(e) => {
                error!(file.id = %id, file.kind = %kind, "error getting file from cloud: {:#}", e);
                None
            }
        }
    }
}

/// Extract `filename="..."` (or an unquoted filename) from a content-disposition value.
///
/// Directory components are stripped so the name cannot escape the session directory.
pub fn disposition_filename(header: &str) -> Option<String> {
    let raw = header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))?;

    let name = raw.trim_matches('"');
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// `{kind}_{YYYYmmdd_HHMMSS}_{original}`
pub fn stored_file_name<Tz>(kind: FileKind, original: &str, at: chrono::DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: fmt::Display,
{
    format!("{}_{}_{}", kind, at.format("%Y%m%d_%H%M%S"), original)
}

/// Per-session working directory, removed when the session ends.
pub struct WorkDir {
    dir: Option<TempDir>,
}

impl WorkDir {
    /// Create a fresh directory under `root`, creating `root` if needed.
    pub fn create_in(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix("session-").tempdir_in(root)?;
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }

    /// Remove the directory. Later calls do nothing.
    pub fn release(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!(path = %path.display(), "removed session directory"),
                Err(e) => warn!(path = %path.display(), "failed to remove session directory: {}", e),
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.dir.is_none()
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        self.release();
    }
}
