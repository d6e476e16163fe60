use std::time::Duration;

use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::WaitError;

/// Inserts `item` into a bounded queue, retrying with `poll_timeout` per
/// attempt until it fits or the shutdown signal fires.
pub async fn enqueue<T>(
    queue: &mpsc::Sender<T>,
    mut item: T,
    poll_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<(), WaitError> {
    loop {
        if shutdown.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(WaitError::Cancelled),
            sent = queue.send_timeout(item, poll_timeout) => match sent {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendTimeoutError::Timeout(unsent)) => item = unsent,
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    return Err(WaitError::ChannelClosed)
                }
            },
        }
    }
}

/// Removes an item from a bounded queue, retrying with `poll_timeout` per
/// attempt until one arrives or the shutdown signal fires.
pub async fn dequeue<T>(
    queue: &mut mpsc::Receiver<T>,
    poll_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<T, WaitError> {
    loop {
        if shutdown.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(WaitError::Cancelled),
            received = timeout(poll_timeout, queue.recv()) => match received {
                Ok(Some(item)) => return Ok(item),
                Ok(None) => return Err(WaitError::ChannelClosed),
                // Poll tick elapsed; loop to re-check the shutdown signal.
                Err(_) => {}
            },
        }
    }
}

/// Blocks until the queue has capacity for at least one more item or the
/// shutdown signal fires. Backpressure gate before producing more work.
pub async fn wait_for_queue<T>(
    queue: &mpsc::Sender<T>,
    poll_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<(), WaitError> {
    loop {
        if shutdown.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        if queue.is_closed() {
            return Err(WaitError::ChannelClosed);
        }
        if queue.capacity() > 0 {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(WaitError::Cancelled),
            _ = sleep(poll_timeout) => {}
        }
    }
}
