//! Remote artifact sync.
//!
//! Uploads a checkpoint file or directory to an object store addressed by a
//! `scheme://bucket/key-prefix` URI, preserving relative paths. The store
//! transport and progress reporting are both injected: the transport via
//! [`ObjectStore`], progress via a [`ProgressNotifier`] observer invoked per
//! uploaded file instead of a global logger.
//!
//! Uploads triggered from the training loop run on a background worker and
//! operate on a staged snapshot of the checkpoint, so a newer checkpoint
//! written mid-upload cannot corrupt the transfer.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use crate::{Result, TextRlError};

/// Parsed remote location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteUri {
    pub scheme: String,
    pub bucket: String,
    /// Key prefix with any trailing slash trimmed; may be empty
    pub prefix: String,
}

impl RemoteUri {
    /// Parse `scheme://bucket/key-prefix`.
    ///
    /// A missing scheme separator or empty bucket is a reported error; the
    /// caller performs zero uploads in that case.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| {
            TextRlError::Persistence(format!("invalid remote uri `{uri}`: missing scheme"))
        })?;
        if scheme.is_empty() {
            return Err(TextRlError::Persistence(format!(
                "invalid remote uri `{uri}`: empty scheme"
            )));
        }
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_end_matches('/')),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(TextRlError::Persistence(format!(
                "invalid remote uri `{uri}`: empty bucket"
            )));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })
    }

    fn key_for(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{relative}", self.prefix)
        }
    }
}

/// Transport for one stored object. Implementations own scheme support and
/// may reject URIs they do not understand.
pub trait ObjectStore: Send {
    fn put(&mut self, local: &Path, bucket: &str, key: &str) -> Result<()>;
}

/// Observer for transfer progress, invoked after each uploaded file.
pub trait ProgressNotifier: Send {
    fn transferred(&mut self, local: &Path, bytes: u64, total_bytes: u64);
}

/// Default notifier: reports through tracing at coarse intervals.
pub struct LogNotifier {
    last_reported_mb: u64,
}

impl LogNotifier {
    const REPORT_EVERY_MB: u64 = 50;

    pub fn new() -> Self {
        Self { last_reported_mb: 0 }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressNotifier for LogNotifier {
    fn transferred(&mut self, local: &Path, _bytes: u64, total_bytes: u64) {
        let total_mb = total_bytes / (1024 * 1024);
        if total_mb >= self.last_reported_mb + Self::REPORT_EVERY_MB {
            self.last_reported_mb = total_mb;
            tracing::info!(file = %local.display(), total_mb, "Transfer progress");
        }
    }
}

/// Upload a file, or recursively a directory, to the remote location.
///
/// Directory uploads preserve paths relative to `local`. Returns the number
/// of files uploaded.
pub fn sync_path(
    store: &mut dyn ObjectStore,
    notifier: &mut dyn ProgressNotifier,
    local: &Path,
    remote: &RemoteUri,
) -> Result<usize> {
    let mut uploaded = 0usize;
    let mut total_bytes = 0u64;

    if local.is_file() {
        let name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                TextRlError::Persistence(format!("unrepresentable file name: {}", local.display()))
            })?;
        total_bytes += upload_one(store, notifier, local, remote, name, total_bytes)?;
        uploaded += 1;
    } else if local.is_dir() {
        for file in walk_files(local)? {
            let relative = file
                .strip_prefix(local)
                .map_err(|e| TextRlError::Persistence(format!("bad relative path: {e}")))?
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            total_bytes += upload_one(store, notifier, &file, remote, &relative, total_bytes)?;
            uploaded += 1;
        }
    } else {
        return Err(TextRlError::Persistence(format!(
            "no such file or directory: {}",
            local.display()
        )));
    }

    tracing::info!(
        files = uploaded,
        remote = format!("{}://{}/{}", remote.scheme, remote.bucket, remote.prefix),
        "Finished remote sync"
    );
    Ok(uploaded)
}

fn upload_one(
    store: &mut dyn ObjectStore,
    notifier: &mut dyn ProgressNotifier,
    file: &Path,
    remote: &RemoteUri,
    relative: &str,
    bytes_so_far: u64,
) -> Result<u64> {
    let size = fs::metadata(file)?.len();
    store.put(file, &remote.bucket, &remote.key_for(relative))?;
    notifier.transferred(file, size, bytes_so_far + size);
    Ok(size)
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

enum UploadJob {
    Upload(PathBuf),
    Shutdown,
}

/// Background checkpoint uploader.
///
/// `enqueue` stages a snapshot copy of the checkpoint directory and hands it
/// to a worker thread, so the training loop never blocks on the transport
/// and later checkpoints cannot touch an in-flight upload. Upload failures
/// are logged; they do not stop training.
pub struct BackgroundUploader {
    sender: Sender<UploadJob>,
    handle: Option<JoinHandle<()>>,
    staging_root: PathBuf,
    job_counter: u64,
}

impl BackgroundUploader {
    pub fn new(mut store: Box<dyn ObjectStore>, remote: RemoteUri, staging_root: PathBuf) -> Self {
        let (sender, receiver) = unbounded::<UploadJob>();
        let handle = std::thread::spawn(move || {
            let mut notifier = LogNotifier::new();
            while let Ok(job) = receiver.recv() {
                match job {
                    UploadJob::Upload(staged) => {
                        match sync_path(store.as_mut(), &mut notifier, &staged, &remote) {
                            Ok(files) => tracing::info!(files, "Background upload complete"),
                            Err(e) => tracing::warn!("Background upload failed: {e}"),
                        }
                        if let Err(e) = fs::remove_dir_all(&staged) {
                            tracing::debug!("Failed to remove staging copy: {e}");
                        }
                    }
                    UploadJob::Shutdown => break,
                }
            }
        });
        Self {
            sender,
            handle: Some(handle),
            staging_root,
            job_counter: 0,
        }
    }

    /// Snapshot a checkpoint directory and queue it for upload.
    pub fn enqueue(&mut self, checkpoint: &Path) -> Result<()> {
        self.job_counter += 1;
        let staged = self
            .staging_root
            .join(format!(".staging-{:04}", self.job_counter));
        copy_dir(checkpoint, &staged)?;
        self.sender
            .send(UploadJob::Upload(staged))
            .map_err(|_| TextRlError::Persistence("upload worker is gone".into()))?;
        Ok(())
    }

    /// Finish queued uploads and stop the worker.
    pub fn shutdown(mut self) {
        let _ = self.sender.send(UploadJob::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for file in walk_files(from)? {
        let relative = file
            .strip_prefix(from)
            .map_err(|e| TextRlError::Persistence(format!("bad relative path: {e}")))?;
        let target = to.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&file, &target)?;
    }
    Ok(())
}

/// Object store writing into a local directory tree; the `file` scheme.
/// Useful for tests and as the reference transport.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&mut self, local: &Path, bucket: &str, key: &str) -> Result<()> {
        let target = self.root.join(bucket).join(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(local, &target)?;
        Ok(())
    }
}
