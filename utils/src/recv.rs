use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::{
    sync::mpsc,
    time::{timeout, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::WaitError;

/// Inbound polls never sleep longer than this, so cancellation is noticed
/// promptly no matter what window the caller asked for.
pub const MAX_POLL_SLICE: Duration = Duration::from_secs(1);

/// Receives one message from an inbound channel and decodes its JSON
/// payload.
///
/// Polls in slices of at most [`MAX_POLL_SLICE`] regardless of `window`.
/// Returns `WaitError::Timeout` if `window` elapses with nothing received
/// (`None` waits forever), or `WaitError::Cancelled` once the shutdown
/// signal fires — unless `ignore_cancel` is set, which is reserved for final
/// cleanup exchanges after the worker has already started shutting down.
pub async fn receive_with_timeout<T: DeserializeOwned>(
    channel: &mut mpsc::Receiver<Vec<u8>>,
    window: Option<Duration>,
    shutdown: &CancellationToken,
    ignore_cancel: bool,
) -> Result<T, WaitError> {
    let deadline = window.map(|window| Instant::now() + window);
    loop {
        if !ignore_cancel && shutdown.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(WaitError::Timeout);
                }
                MAX_POLL_SLICE.min(deadline - now)
            }
            None => MAX_POLL_SLICE,
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled(), if !ignore_cancel => return Err(WaitError::Cancelled),
            received = timeout(slice, channel.recv()) => match received {
                Ok(Some(payload)) => {
                    return serde_json::from_slice(&payload)
                        .map_err(|e| WaitError::Decode(e.to_string()))
                }
                Ok(None) => return Err(WaitError::ChannelClosed),
                // Slice elapsed; loop to re-check cancellation and the
                // caller's deadline.
                Err(_) => {}
            },
        }
    }
}
