use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::error::SyncError;

pub(crate) type TaskSet = JoinSet<Result<(), SyncError>>;

/// Runs `fut` until it finishes or `cancel` fires, whichever comes first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = fut => result,
    }
}

/// Sends on a bounded channel without outliving cancellation. A dropped
/// receiver means the consuming stage is gone, which only happens while
/// the whole run unwinds.
pub(crate) async fn send<T>(
    tx: &mpsc::Sender<T>,
    value: T,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        sent = tx.send(value) => sent.map_err(|_| SyncError::Cancelled),
    }
}

/// Starts tasks for every input received until the channel closes, then
/// waits for all of them. The first failing task ends the fan-out; the
/// remaining tasks are aborted when the set drops.
pub(crate) async fn fan_out<I, F>(
    mut inputs: mpsc::Receiver<I>,
    cancel: &CancellationToken,
    mut start: F,
) -> Result<(), SyncError>
where
    F: FnMut(I, &mut TaskSet) -> Result<(), SyncError>,
{
    let mut tasks = TaskSet::new();
    let mut accepting = true;
    while accepting || !tasks.is_empty() {
        tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            input = inputs.recv(), if accepting => match input {
                Some(input) => start(input, &mut tasks)?,
                None => accepting = false,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => joined??,
        }
    }
    Ok(())
}
