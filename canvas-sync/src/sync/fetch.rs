use canvas_core::{CanvasClient, Page};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::SyncError;
use super::tasks::{cancellable, send};

/// Fetches a paginated listing starting at `start`, emitting every page as
/// one batch on `tx`.
///
/// Each page fetch runs as its own task; the request for a `rel="next"` page
/// is started as soon as the link is known, before the current batch is
/// handed downstream. Returns the number of pages once every fetch has
/// completed. The first failing page cancels the remaining fetches.
pub async fn fetch_pages<T>(
    client: &CanvasClient,
    start: Url,
    tx: mpsc::Sender<Vec<T>>,
    cancel: &CancellationToken,
) -> Result<usize, SyncError>
where
    T: DeserializeOwned + Send + 'static,
{
    let scope = cancel.child_token();
    let _cancel_on_exit = scope.clone().drop_guard();
    let mut pages = JoinSet::new();
    spawn_page::<T>(&mut pages, client, start, &scope);

    let mut fetched = 0usize;
    while let Some(joined) = pages.join_next().await {
        let page = joined??;
        fetched += 1;
        if let Some(next) = page.next {
            spawn_page::<T>(&mut pages, client, next, &scope);
        }
        send(&tx, page.items, &scope).await?;
    }
    Ok(fetched)
}

fn spawn_page<T>(
    pages: &mut JoinSet<Result<Page<T>, SyncError>>,
    client: &CanvasClient,
    url: Url,
    cancel: &CancellationToken,
) where
    T: DeserializeOwned + Send + 'static,
{
    let client = client.clone();
    let cancel = cancel.clone();
    pages.spawn(async move {
        cancellable(&cancel, async {
            client.list_page::<T>(&url).await.map_err(SyncError::from)
        })
        .await
    });
}
