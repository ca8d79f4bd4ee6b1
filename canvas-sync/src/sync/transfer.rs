use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use canvas_core::{CanvasClient, File};
use filetime::FileTime;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::diff::FileToSync;
use super::error::SyncError;
use super::tasks::cancellable;

pub const DEFAULT_DOWNLOAD_WORKERS: usize = 10;

const PARTIAL_PREFIX: &str = ".canvas-sync-";
const PARTIAL_SUFFIX: &str = ".partial";

/// Counters for the end-of-run summary. Nothing reads them to make decisions.
#[derive(Debug, Default)]
pub struct SyncStats {
    files_synced: AtomicU64,
    bytes_transferred: AtomicU64,
}

impl SyncStats {
    pub fn record(&self, bytes: u64) {
        self.files_synced.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn files_synced(&self) -> u64 {
        self.files_synced.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }
}

/// Downloads `file` to `target`.
///
/// The body is streamed into a uniquely named temporary file next to
/// `target`, stamped with the remote modification time and renamed into
/// place, so `target` never holds a partial download. On failure or
/// cancellation the temporary file is removed. Returns the number of bytes
/// written.
pub async fn download_to_path(
    client: &CanvasClient,
    file: &File,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<u64, SyncError> {
    let parent = target.parent().ok_or_else(|| {
        SyncError::io(
            target,
            io::Error::new(io::ErrorKind::InvalidInput, "download target has no parent"),
        )
    })?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|source| SyncError::io(parent, source))?;

    let dir = parent.to_path_buf();
    let partial = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(&dir)
            .map_err(|source| SyncError::io(&dir, source))
    })
    .await??;
    // The TempPath deletes the file on drop until it is persisted.
    let (handle, partial_path) = partial.into_parts();
    let mut out = tokio::fs::File::from_std(handle);

    let written = cancellable(cancel, async {
        let response = client.download(&file.url).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk)
                .await
                .map_err(|source| SyncError::io(&partial_path, source))?;
            written += chunk.len() as u64;
        }
        out.flush()
            .await
            .map_err(|source| SyncError::io(&partial_path, source))?;
        out.sync_all()
            .await
            .map_err(|source| SyncError::io(&partial_path, source))?;
        Ok(written)
    })
    .await?;
    drop(out);

    if written != file.size {
        return Err(SyncError::SizeMismatch {
            path: target.to_path_buf(),
            expected: file.size,
            actual: written,
        });
    }

    let mtime = FileTime::from_system_time(file.updated_at.into());
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || {
        filetime::set_file_mtime(&partial_path, mtime)
            .map_err(|source| SyncError::io(&partial_path, source))?;
        partial_path
            .persist(&target)
            .map_err(|err| SyncError::io(&target, err.error))
    })
    .await??;
    Ok(written)
}

/// Drains `queue` with `workers` concurrent downloaders until it closes.
///
/// The first failing download cancels the other workers and is returned.
pub async fn run_downloaders(
    client: &CanvasClient,
    queue: mpsc::Receiver<FileToSync>,
    workers: usize,
    stats: Arc<SyncStats>,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    let scope = cancel.child_token();
    let _cancel_on_exit = scope.clone().drop_guard();
    let queue = Arc::new(Mutex::new(queue));
    let mut pool = JoinSet::new();

    for worker in 0..workers.max(1) {
        let client = client.clone();
        let queue = Arc::clone(&queue);
        let stats = Arc::clone(&stats);
        let scope = scope.clone();
        pool.spawn(async move { download_worker(worker, &client, &queue, &stats, &scope).await });
    }

    while let Some(joined) = pool.join_next().await {
        joined??;
    }
    Ok(())
}

async fn download_worker(
    worker: usize,
    client: &CanvasClient,
    queue: &Mutex<mpsc::Receiver<FileToSync>>,
    stats: &SyncStats,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    loop {
        let next = cancellable(cancel, async { Ok(queue.lock().await.recv().await) }).await?;
        let Some(item) = next else {
            return Ok(());
        };

        let bytes = download_to_path(client, &item.file, &item.path, cancel).await?;
        stats.record(bytes);
        tracing::info!(worker, path = %item.path.display(), bytes, "downloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;
    use time::OffsetDateTime;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote_file(server: &MockServer, id: u64, size: u64, updated: i64) -> File {
        File {
            id,
            folder_id: 1,
            display_name: format!("{id}.bin"),
            size,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::from_unix_timestamp(updated).unwrap(),
            url: Url::parse(&format!("{}/files/{id}", server.uri())).unwrap(),
        }
    }

    fn leftovers(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(PARTIAL_PREFIX))
            })
            .collect()
    }

    #[tokio::test]
    async fn downloads_file_with_remote_mtime() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/deeper/out.txt");
        let client = CanvasClient::new(&server.uri(), "test-token").unwrap();
        let file = remote_file(&server, 1, 5, 1_700_000_000);

        let written = download_to_path(&client, &file, &target, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 5);
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        let mtime = FileTime::from_last_modification_time(&std::fs::metadata(&target).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_700_000_000);
        assert!(leftovers(target.parent().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn failed_download_leaves_existing_target_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/2"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("keep.txt");
        std::fs::write(&target, b"previous").unwrap();
        let client = CanvasClient::new(&server.uri(), "test-token").unwrap();
        let file = remote_file(&server, 2, 3, 1_700_000_000);

        let err = download_to_path(&client, &file, &target, &CancellationToken::new())
            .await
            .expect_err("server error");

        assert!(matches!(err, SyncError::Api(_)));
        assert_eq!(std::fs::read(&target).unwrap(), b"previous");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn truncated_body_is_not_published() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hal"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("short.txt");
        let client = CanvasClient::new(&server.uri(), "test-token").unwrap();
        let file = remote_file(&server, 3, 10, 1_700_000_000);

        let err = download_to_path(&client, &file, &target, &CancellationToken::new())
            .await
            .expect_err("size mismatch");

        assert!(matches!(
            err,
            SyncError::SizeMismatch {
                expected: 10,
                actual: 3,
                ..
            }
        ));
        assert!(!target.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn unpublishable_download_is_cleaned_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/5"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("taken");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("inside.txt"), b"x").unwrap();
        let client = CanvasClient::new(&server.uri(), "test-token").unwrap();
        let file = remote_file(&server, 5, 4, 1_700_000_000);

        let err = download_to_path(&client, &file, &target, &CancellationToken::new())
            .await
            .expect_err("a directory occupies the target");

        match err {
            SyncError::Io { path, .. } => assert_eq!(path, target),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(target.join("inside.txt").exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("slow.txt");
        let client = CanvasClient::new(&server.uri(), "test-token").unwrap();
        let file = remote_file(&server, 4, 4, 1_700_000_000);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            download_to_path(&client, &file, &target, &cancel),
        )
        .await
        .expect("cancellation is prompt")
        .expect_err("cancelled");

        assert!(err.is_cancelled());
        assert!(!target.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn pool_drains_queue_and_counts_transfers() {
        let server = MockServer::start().await;
        for id in 1..=4u64 {
            Mock::given(method("GET"))
                .and(path(format!("/files/{id}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; id as usize]))
                .mount(&server)
                .await;
        }

        let dir = tempdir().unwrap();
        let client = CanvasClient::new(&server.uri(), "test-token").unwrap();
        let (tx, rx) = mpsc::channel(2);
        let stats = Arc::new(SyncStats::default());
        let cancel = CancellationToken::new();

        let records: Vec<FileToSync> = (1..=4u64)
            .map(|id| FileToSync {
                file: remote_file(&server, id, id, 1_700_000_000),
                path: dir.path().join("shared").join(format!("{id}.bin")),
            })
            .collect();
        let producer = async move {
            for record in records {
                tx.send(record).await.unwrap();
            }
        };

        let ((), result) = tokio::join!(
            producer,
            run_downloaders(&client, rx, 3, Arc::clone(&stats), &cancel)
        );
        result.unwrap();

        assert_eq!(stats.files_synced(), 4);
        assert_eq!(stats.bytes_transferred(), 1 + 2 + 3 + 4);
        for id in 1..=4u64 {
            let body = std::fs::read(dir.path().join("shared").join(format!("{id}.bin"))).unwrap();
            assert_eq!(body.len() as u64, id);
        }
    }

    #[tokio::test]
    async fn pool_stops_on_first_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = CanvasClient::new(&server.uri(), "test-token").unwrap();
        let (tx, rx) = mpsc::channel(1);
        tx.send(FileToSync {
            file: remote_file(&server, 9, 1, 1_700_000_000),
            path: dir.path().join("missing.bin"),
        })
        .await
        .unwrap();

        // The sender stays open: the pool must return because of the failure, not end of queue.
        let err = run_downloaders(
            &client,
            rx,
            2,
            Arc::new(SyncStats::default()),
            &CancellationToken::new(),
        )
        .await
        .expect_err("404");
        drop(tx);

        assert!(matches!(err, SyncError::Api(_)));
    }
}
