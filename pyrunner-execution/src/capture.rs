//! Per-execution working directories and file capture

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use pyrunner_config::ExecutionConfig;
use pyrunner_ipc::ExecutionUpdate;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::ExecutionError;

const DEFAULT_MIMETYPE: &str = "application/octet-stream";

const MIMETYPES: &[(&str, &str)] = &[
    ("csv", "text/csv"),
    ("tsv", "text/tab-separated-values"),
    ("txt", "text/plain"),
    ("log", "text/plain"),
    ("md", "text/markdown"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("py", "text/x-python"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("parquet", "application/vnd.apache.parquet"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("xls", "application/vnd.ms-excel"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("mp4", "video/mp4"),
];

/// Guess a MIME type from a file name's extension
pub fn guess_mimetype(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    extension
        .and_then(|ext| {
            MIMETYPES
                .iter()
                .find(|(known, _)| *known == ext)
                .map(|(_, mimetype)| *mimetype)
        })
        .unwrap_or(DEFAULT_MIMETYPE)
}

/// Temporary directory an execution runs in.
///
/// The directory is removed on [`close`](Self::close) or when the workspace is
/// dropped, whichever comes first.
#[derive(Debug)]
pub struct ExecutionWorkspace {
    dir: TempDir,
    capture_downloads: bool,
    max_download_bytes: u64,
}

impl ExecutionWorkspace {
    /// Create a uniquely named directory under the configured root
    pub fn create(config: &ExecutionConfig) -> Result<Self, ExecutionError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pyrunner-");

        let dir = match &config.workdir_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| ExecutionError::WorkspaceError(format!("Failed to create workdir: {}", e)))?;

        debug!("Created execution workspace at {}", dir.path().display());

        Ok(Self {
            dir,
            capture_downloads: config.capture_downloads,
            max_download_bytes: config.max_download_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Turn every regular file left in the workspace into an update.
    ///
    /// Files are visited in relative-path order. Files above the size limit
    /// are reported as a `stderr` line instead of being attached.
    pub async fn collect_downloads(&self) -> Result<Vec<ExecutionUpdate>, ExecutionError> {
        if !self.capture_downloads {
            return Ok(Vec::new());
        }

        let root = self.dir.path().to_path_buf();
        let max_bytes = self.max_download_bytes;

        tokio::task::spawn_blocking(move || scan_directory(&root, max_bytes))
            .await
            .map_err(|e| ExecutionError::WorkspaceError(format!("File capture task failed: {}", e)))?
    }

    /// Remove the directory. Failures are logged, never returned.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!("Failed to remove execution workspace {}: {}", path.display(), e);
        }
    }
}

fn scan_directory(root: &Path, max_bytes: u64) -> Result<Vec<ExecutionUpdate>, ExecutionError> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable workspace entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| ExecutionError::WorkspaceError(e.to_string()))?;
        let name = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        files.push((name, entry.into_path()));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut updates = Vec::with_capacity(files.len());
    for (filename, path) in files {
        let size = std::fs::metadata(&path)
            .map_err(|e| ExecutionError::WorkspaceError(format!("{}: {}", filename, e)))?
            .len();

        if size > max_bytes {
            updates.push(ExecutionUpdate::stderr(format!(
                "File '{}' was not attached: {} bytes exceeds the {} byte limit",
                filename, size, max_bytes
            )));
            continue;
        }

        let bytes = std::fs::read(&path)
            .map_err(|e| ExecutionError::WorkspaceError(format!("{}: {}", filename, e)))?;

        updates.push(ExecutionUpdate::Download {
            mimetype: guess_mimetype(&filename).to_string(),
            data: STANDARD.encode(bytes),
            filename,
        });
    }

    Ok(updates)
}
