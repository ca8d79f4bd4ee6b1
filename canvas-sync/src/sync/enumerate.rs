use canvas_core::{CanvasClient, Course, File, Folder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::SyncError;
use super::fetch::fetch_pages;
use super::tasks::fan_out;
use super::tree::{CourseTree, run_tree_builder};

/// Lists every course visible to the token, one batch per page.
pub async fn enumerate_courses(
    client: &CanvasClient,
    tx: mpsc::Sender<Vec<Course>>,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    let pages = fetch_pages(client, client.courses_url()?, tx, cancel).await?;
    tracing::debug!(pages, "course listing complete");
    Ok(())
}

pub async fn enumerate_folders(
    client: &CanvasClient,
    course_id: u64,
    tx: mpsc::Sender<Vec<Folder>>,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    let pages = fetch_pages(client, client.folders_url(course_id)?, tx, cancel).await?;
    tracing::debug!(course_id, pages, "folder listing complete");
    Ok(())
}

/// Lists the files of every folder id received on `folder_ids`.
///
/// Folders are listed concurrently as their ids arrive. `tx` closes once the
/// id channel is closed and every started listing has finished.
pub async fn enumerate_files(
    client: &CanvasClient,
    folder_ids: mpsc::Receiver<u64>,
    tx: mpsc::Sender<Vec<File>>,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    let scope = cancel.child_token();
    let _cancel_on_exit = scope.clone().drop_guard();

    fan_out(folder_ids, &scope, |folder_id, tasks| {
        let url = client.files_url(folder_id)?;
        let client = client.clone();
        let tx = tx.clone();
        let scope = scope.clone();
        tasks.spawn(async move {
            let pages = fetch_pages(&client, url, tx, &scope).await?;
            tracing::trace!(folder_id, pages, "file listing complete");
            Ok(())
        });
        Ok(())
    })
    .await
}

/// Builds the folder tree of one course.
///
/// The folder listing, the per-folder file listings and the tree builder run
/// concurrently, connected by channels of `capacity` slots.
pub async fn build_course_tree(
    client: &CanvasClient,
    course: Course,
    capacity: usize,
    cancel: &CancellationToken,
) -> Result<CourseTree, SyncError> {
    let scope = cancel.child_token();
    let _cancel_on_exit = scope.clone().drop_guard();
    let capacity = capacity.max(1);
    let course_id = course.id;

    let (folders_tx, folders_rx) = mpsc::channel(capacity);
    let (ids_tx, ids_rx) = mpsc::channel(capacity);
    let (files_tx, files_rx) = mpsc::channel(capacity);

    let (_, _, tree) = tokio::try_join!(
        enumerate_folders(client, course_id, folders_tx, &scope),
        enumerate_files(client, ids_rx, files_tx, &scope),
        run_tree_builder(course, folders_rx, files_rx, ids_tx, &scope),
    )?;
    Ok(tree)
}
