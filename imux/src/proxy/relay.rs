//! Byte relay between two streams

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ReadWrite;

/// Bytes moved in each direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_device: u64,
    pub device_to_client: u64,
}

/// Copies bytes both ways until either side finishes or `cancel` fires
///
/// One task runs per direction. Whichever finishes first shuts its destination down
/// and stops the other one, which then shuts down its own destination; both streams
/// are closed by the time this returns.
pub async fn relay(
    client: Box<dyn ReadWrite>,
    device: Box<dyn ReadWrite>,
    cancel: &CancellationToken,
) -> RelayStats {
    let done = cancel.child_token();
    let (client_r, client_w) = tokio::io::split(client);
    let (device_r, device_w) = tokio::io::split(device);

    let upstream = tokio::spawn(pump(client_r, device_w, done.clone(), "client -> device"));
    let downstream = tokio::spawn(pump(device_r, client_w, done.clone(), "device -> client"));

    RelayStats {
        client_to_device: upstream.await.unwrap_or(0),
        device_to_client: downstream.await.unwrap_or(0),
    }
}

async fn pump<R, W>(mut from: R, mut to: W, done: CancellationToken, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let res = tokio::select! {
        res = tokio::io::copy(&mut from, &mut to) => Some(res),
        _ = done.cancelled() => None,
    };
    done.cancel();
    let _ = to.shutdown().await;
    match res {
        Some(Ok(n)) => {
            debug!("Relay {direction} finished after {n} bytes");
            n
        }
        Some(Err(e)) => {
            debug!("Relay {direction} failed: {e}");
            0
        }
        None => 0,
    }
}
