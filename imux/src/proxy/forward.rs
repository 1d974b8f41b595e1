//! Raw muxer forwarding
//!
//! Exposes a remote muxer on a local socket without looking at the traffic. Unlike
//! [`super::MuxProxy`] nothing is answered locally, every client gets its own
//! connection to the remote end.

use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ImuxError, usbmuxd::UsbmuxdAddr};

use super::{ProxyListener, relay::relay};

#[derive(Debug, Clone)]
pub struct Forwarder {
    remote: UsbmuxdAddr,
}

impl Forwarder {
    pub fn new(remote: UsbmuxdAddr) -> Self {
        Self { remote }
    }

    /// Relays every client on `listener` to the remote muxer until `cancel` fires
    pub async fn serve(
        &self,
        listener: ProxyListener,
        cancel: CancellationToken,
    ) -> Result<(), ImuxError> {
        info!("Forwarding {} to {}", listener.local_addr()?, self.remote);
        let mut clients = JoinSet::new();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = clients.join_next(), if !clients.is_empty() => continue,
                a = listener.accept() => a,
            };
            let (client, peer) = match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let remote = self.remote.clone();
            let cancel = cancel.child_token();
            clients.spawn(async move {
                let device = match remote.to_socket().await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Cannot reach {remote} for {peer}: {e}");
                        return;
                    }
                };
                let stats = relay(client, device, &cancel).await;
                debug!(
                    "{peer} forwarded {} bytes, received {}",
                    stats.client_to_device, stats.device_to_client
                );
            });
        }
        clients.shutdown().await;
        Ok(())
    }
}
