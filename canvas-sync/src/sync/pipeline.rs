use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use canvas_core::{CanvasClient, Course};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::diff::{FileToSync, LocalDisk, diff_tree};
use super::enumerate::{build_course_tree, enumerate_courses};
use super::error::SyncError;
use super::tasks::{fan_out, send};
use super::transfer::{DEFAULT_DOWNLOAD_WORKERS, SyncStats, run_downloaders};
use super::tree::CourseTree;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub directory: PathBuf,
    pub ignored_courses: HashSet<u64>,
    pub download_workers: usize,
    pub channel_capacity: usize,
}

impl SyncOptions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ignored_courses: HashSet::new(),
            download_workers: DEFAULT_DOWNLOAD_WORKERS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    fn capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub files_synced: u64,
    pub bytes_transferred: u64,
}

/// Mirrors every visible course into [`SyncOptions::directory`].
#[derive(Debug, Clone)]
pub struct Syncer {
    client: CanvasClient,
    options: SyncOptions,
}

impl Syncer {
    pub fn new(client: CanvasClient, options: SyncOptions) -> Self {
        Self { client, options }
    }

    /// Runs listing, tree building, diffing and downloading concurrently.
    ///
    /// The first failing stage cancels the others and its error is returned
    /// once everything has unwound. Files already downloaded stay in place.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncReport, SyncError> {
        let scope = cancel.child_token();
        let _cancel_on_exit = scope.clone().drop_guard();
        let stats = Arc::new(SyncStats::default());
        let (records_tx, records_rx) = mpsc::channel(self.options.capacity());

        tokio::try_join!(
            self.discover(records_tx, &scope),
            run_downloaders(
                &self.client,
                records_rx,
                self.options.download_workers,
                Arc::clone(&stats),
                &scope,
            ),
        )?;

        Ok(SyncReport {
            files_synced: stats.files_synced(),
            bytes_transferred: stats.bytes_transferred(),
        })
    }

    /// Lists what [`Syncer::run`] would download, sorted by destination path.
    pub async fn plan(&self, cancel: &CancellationToken) -> Result<Vec<FileToSync>, SyncError> {
        let scope = cancel.child_token();
        let _cancel_on_exit = scope.clone().drop_guard();
        let (records_tx, mut records_rx) = mpsc::channel(self.options.capacity());

        let collect = async {
            let mut records = Vec::new();
            while let Some(record) = records_rx.recv().await {
                records.push(record);
            }
            Ok::<_, SyncError>(records)
        };
        let ((), mut records) = tokio::try_join!(self.discover(records_tx, &scope), collect)?;
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    /// Courses, trees and diffs; every record lands on `records`.
    async fn discover(
        &self,
        records: mpsc::Sender<FileToSync>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let capacity = self.options.capacity();
        let (courses_tx, courses_rx) = mpsc::channel(capacity);
        let (trees_tx, trees_rx) = mpsc::channel(capacity);

        tokio::try_join!(
            enumerate_courses(&self.client, courses_tx, cancel),
            self.build_trees(courses_rx, trees_tx, cancel),
            self.diff_trees(trees_rx, records, cancel),
        )?;
        Ok(())
    }

    async fn build_trees(
        &self,
        courses: mpsc::Receiver<Vec<Course>>,
        trees: mpsc::Sender<CourseTree>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let capacity = self.options.capacity();
        fan_out(courses, cancel, |batch, tasks| {
            for course in batch {
                if self.options.ignored_courses.contains(&course.id) {
                    tracing::debug!(course_id = course.id, name = %course.name, "skipping ignored course");
                    continue;
                }
                let client = self.client.clone();
                let trees = trees.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let tree = build_course_tree(&client, course, capacity, &cancel).await?;
                    tracing::info!(
                        course_id = tree.course.id,
                        name = %tree.course.name,
                        files = tree.file_count(),
                        "course listed"
                    );
                    send(&trees, tree, &cancel).await
                });
            }
            Ok(())
        })
        .await
    }

    async fn diff_trees(
        &self,
        trees: mpsc::Receiver<CourseTree>,
        records: mpsc::Sender<FileToSync>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        fan_out(trees, cancel, |tree, tasks| {
            let directory = self.options.directory.clone();
            let records = records.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let queued = diff_tree(&tree, &directory, &LocalDisk, &records, &cancel).await?;
                tracing::debug!(course_id = tree.course.id, queued, "course diffed");
                Ok(())
            });
            Ok(())
        })
        .await
    }
}
