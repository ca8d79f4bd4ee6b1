use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use canvas_core::File;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::SyncError;
use super::paths::{child_path, course_dir};
use super::tasks::{cancellable, send};
use super::tree::{CourseTree, TreeFolder};

/// A remote file that is missing or stale locally, with the path it belongs at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileToSync {
    pub file: File,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMetadata {
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Read-only view of the local filesystem used while diffing.
pub trait MetadataProbe: Send + Sync {
    /// `Ok(None)` when nothing exists at `path`.
    fn probe(&self, path: &Path) -> impl Future<Output = io::Result<Option<LocalMetadata>>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDisk;

impl MetadataProbe for LocalDisk {
    async fn probe(&self, path: &Path) -> io::Result<Option<LocalMetadata>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(LocalMetadata {
                is_dir: meta.is_dir(),
                size: meta.len(),
                modified: meta.modified().ok(),
            })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Walks `tree` depth-first and sends a [`FileToSync`] for every file that
/// is absent under `sync_root` or differs in size or modification time.
///
/// Each folder is probed once. Below a folder that does not exist no
/// further probes happen: all of its files are due. Entries of one folder
/// whose names map to the same local path are synced once: the file with
/// the lowest id wins, then files beat subfolders. Returns the number of
/// records sent.
pub async fn diff_tree<P: MetadataProbe>(
    tree: &CourseTree,
    sync_root: &Path,
    probe: &P,
    tx: &mpsc::Sender<FileToSync>,
    cancel: &CancellationToken,
) -> Result<usize, SyncError> {
    let Some(root) = &tree.root else {
        return Ok(0);
    };
    let course_root = course_dir(sync_root, &tree.course.name);
    let mut pending: Vec<(&TreeFolder, PathBuf, bool)> =
        vec![(root, child_path(&course_root, &root.folder.name), false)];
    let mut queued = 0usize;

    while let Some((folder, dir, ancestor_absent)) = pending.pop() {
        let absent = ancestor_absent || !folder_exists(probe, &dir, cancel).await?;
        let mut claimed = HashSet::new();

        for file in &folder.files {
            let path = child_path(&dir, &file.display_name);
            if !claimed.insert(path.clone()) {
                tracing::warn!(
                    file_id = file.id,
                    name = %file.display_name,
                    path = %path.display(),
                    "skipping file whose local path is already taken"
                );
                continue;
            }
            if absent || file_is_due(probe, file, &path, cancel).await? {
                send(
                    tx,
                    FileToSync {
                        file: file.clone(),
                        path,
                    },
                    cancel,
                )
                .await?;
                queued += 1;
            }
        }

        let mut children = Vec::with_capacity(folder.folders.len());
        for child in &folder.folders {
            let path = child_path(&dir, &child.folder.name);
            if !claimed.insert(path.clone()) {
                tracing::warn!(
                    folder_id = child.folder.id,
                    name = %child.folder.name,
                    path = %path.display(),
                    "skipping folder whose local path is already taken"
                );
                continue;
            }
            children.push((child, path, absent));
        }
        pending.extend(children.into_iter().rev());
    }

    tracing::debug!(course_id = tree.course.id, queued, "course diffed against disk");
    Ok(queued)
}

/// Runs [`diff_tree`] to completion and returns the records in traversal order.
pub async fn collect_files_to_sync<P: MetadataProbe>(
    tree: &CourseTree,
    sync_root: &Path,
    probe: &P,
) -> Result<Vec<FileToSync>, SyncError> {
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let walk = async move {
        let result = diff_tree(tree, sync_root, probe, &tx, &cancel).await;
        drop(tx);
        result
    };
    let gather = async {
        let mut records = Vec::new();
        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        records
    };
    let (walked, records) = tokio::join!(walk, gather);
    walked?;
    Ok(records)
}

async fn folder_exists<P: MetadataProbe>(
    probe: &P,
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<bool, SyncError> {
    match probe_path(probe, dir, cancel).await? {
        None => Ok(false),
        Some(meta) if meta.is_dir => Ok(true),
        Some(_) => Err(SyncError::io(
            dir,
            io::Error::new(io::ErrorKind::NotADirectory, "expected a directory"),
        )),
    }
}

async fn file_is_due<P: MetadataProbe>(
    probe: &P,
    file: &File,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<bool, SyncError> {
    match probe_path(probe, path, cancel).await? {
        None => Ok(true),
        Some(meta) if meta.is_dir => Err(SyncError::io(
            path,
            io::Error::new(io::ErrorKind::IsADirectory, "expected a file"),
        )),
        Some(meta) => Ok(is_stale(file, &meta)),
    }
}

async fn probe_path<P: MetadataProbe>(
    probe: &P,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<Option<LocalMetadata>, SyncError> {
    cancellable(cancel, async {
        probe
            .probe(path)
            .await
            .map_err(|source| SyncError::io(path, source))
    })
    .await
}

/// Size and modification time must both match for a local copy to count as current.
fn is_stale(file: &File, local: &LocalMetadata) -> bool {
    local.size != file.size || local.modified.map(OffsetDateTime::from) != Some(file.updated_at)
}
