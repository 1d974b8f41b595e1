//! Feeds a [`Registry`] from an upstream muxer's `Listen` stream
//!
//! The monitor optionally gives devices local IDs, which a proxy needs when it merges
//! several upstreams or wants IDs that stay small. The real ID is kept as the
//! [`UPSTREAM_DEVICE_ID`] device property so `Connect` can be rewritten on the way out.

use std::{collections::HashMap, time::Duration};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ImuxError,
    registry::Registry,
    usbmuxd::{ListenEvent, UsbmuxdAddr},
};

/// Registry property holding the ID the upstream muxer uses for a device
pub const UPSTREAM_DEVICE_ID: &str = "UpstreamDeviceID";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub upstream: UsbmuxdAddr,
    /// Assign local IDs instead of reusing the upstream ones
    pub renumber: bool,
    /// Wait between losing the upstream and reconnecting
    pub reconnect_interval: Duration,
}

impl MonitorConfig {
    pub fn new(upstream: UsbmuxdAddr) -> Self {
        Self {
            upstream,
            renumber: false,
            reconnect_interval: Duration::from_secs(2),
        }
    }
}

pub struct DeviceMonitor {
    registry: Registry,
    config: MonitorConfig,
    next_id: u32,
    /// upstream ID -> local ID
    ids: HashMap<u32, u32>,
}

/// The ID to use upstream for a device the registry knows as `device_id`
pub fn upstream_device_id(registry: &Registry, device_id: u32) -> u32 {
    registry
        .device_property(device_id, UPSTREAM_DEVICE_ID)
        .and_then(|v| v.as_unsigned_integer())
        .map(|v| v as u32)
        .unwrap_or(device_id)
}

impl DeviceMonitor {
    pub fn new(registry: Registry, config: MonitorConfig) -> Self {
        Self {
            registry,
            config,
            next_id: 1,
            ids: HashMap::new(),
        }
    }

    /// Monitors until `cancel` fires, reconnecting whenever the upstream goes away
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.run_once(&cancel) => res,
            };
            match res {
                Ok(()) => warn!("Upstream muxer {} closed the listen stream", self.config.upstream),
                Err(e) => warn!("Upstream muxer {} failed: {e}", self.config.upstream),
            }
            self.upstream_lost();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
        self.upstream_lost();
        debug!("Device monitor stopped");
    }

    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<(), ImuxError> {
        let conn = self.config.upstream.connect(0).await?;
        let mut events = conn.listen().await?;
        info!("Listening on upstream muxer {}", self.config.upstream);
        while let Some(event) = events.next().await {
            self.apply(cancel, event?);
        }
        Ok(())
    }

    /// Every ID the upstream handed out is void once it is gone
    fn upstream_lost(&mut self) {
        let n = self.registry.remove_all();
        if n > 0 {
            info!("Dropped {n} devices after losing the upstream");
        }
        self.ids.clear();
    }

    pub(crate) fn apply(&mut self, cancel: &CancellationToken, event: ListenEvent) {
        match event {
            ListenEvent::Attached(entry) => {
                let upstream = entry.device_id;
                let local = match self.ids.get(&upstream) {
                    Some(l) => *l,
                    None if self.config.renumber => {
                        let l = self.next_id;
                        self.next_id = self.next_id.wrapping_add(1).max(1);
                        l
                    }
                    None => upstream,
                };
                self.ids.insert(upstream, local);
                // A changed re-announce replaces the tracked entry and its properties
                self.registry
                    .add_device(cancel, entry.with_device_id(local));
                self.registry
                    .set_device_property(local, UPSTREAM_DEVICE_ID, (upstream as u64).into());
            }
            ListenEvent::Detached { device_id } => match self.ids.remove(&device_id) {
                Some(local) => {
                    self.registry.remove_device_by_id(local);
                }
                None => warn!("Detached event for unknown upstream device {device_id}"),
            },
            ListenEvent::Paired { device_id } => {
                info!("Upstream device {device_id} paired");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::listener_fn,
        usbmuxd::{fake, test_entry},
    };

    #[test]
    fn test_renumbering_keeps_upstream_id() {
        let registry = Registry::new();
        let mut config = MonitorConfig::new(UsbmuxdAddr::default());
        config.renumber = true;
        let mut monitor = DeviceMonitor::new(registry.clone(), config);
        let cancel = CancellationToken::new();

        monitor.apply(&cancel, ListenEvent::Attached(test_entry(42, "A")));
        monitor.apply(&cancel, ListenEvent::Attached(test_entry(77, "B")));

        assert_eq!(registry.device(1).unwrap().serial(), "A");
        assert_eq!(registry.device(2).unwrap().serial(), "B");
        assert_eq!(upstream_device_id(&registry, 1), 42);
        assert_eq!(upstream_device_id(&registry, 2), 77);

        monitor.apply(&cancel, ListenEvent::Detached { device_id: 42 });
        assert!(registry.device(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reattach_keeps_local_id_and_upstream_id() {
        let registry = Registry::new();
        let mut config = MonitorConfig::new(UsbmuxdAddr::default());
        config.renumber = true;
        let mut monitor = DeviceMonitor::new(registry.clone(), config);
        let cancel = CancellationToken::new();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let removed_tx = tx.clone();
        let _sub = registry.listen(listener_fn(
            move |_, d| tx.send(format!("+{}", d.device_id)).unwrap(),
            move |_, d| removed_tx.send(format!("-{}", d.device_id)).unwrap(),
        ));

        monitor.apply(&cancel, ListenEvent::Attached(test_entry(42, "A")));
        let first = registry.device(1).unwrap();

        // Same announce again: nothing changes
        monitor.apply(&cancel, ListenEvent::Attached(test_entry(42, "A")));
        assert_eq!(registry.len(), 1);
        assert_eq!(upstream_device_id(&registry, 1), 42);

        // Same upstream ID with new properties replaces the entry under the same local ID
        let mut changed = test_entry(42, "A");
        changed.properties.connection_speed = Some(999_999);
        monitor.apply(&cancel, ListenEvent::Attached(changed));
        assert_eq!(registry.len(), 1);
        let second = registry.device(1).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.properties.connection_speed, Some(999_999));
        assert_eq!(upstream_device_id(&registry, 1), 42);

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(events, ["+1", "-1", "+1"]);
    }

    #[tokio::test]
    async fn test_upstream_loss_clears_registry() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let (msg, _) = fake::read_request(&mut sock).await;
            fake::reply(&mut sock, msg.header.tag, fake::result(0)).await;
            fake::reply(&mut sock, 0, fake::attached(&test_entry(42, "A"))).await;
            // Give the monitor a moment before the upstream disappears
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(sock);
        });

        let registry = Registry::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let removed_tx = tx.clone();
        let _sub = registry.listen(listener_fn(
            move |_, d| tx.send(format!("+{}", d.device_id)).unwrap(),
            move |_, d| removed_tx.send(format!("-{}", d.device_id)).unwrap(),
        ));

        let mut config = MonitorConfig::new(UsbmuxdAddr::TcpSocket(addr));
        config.reconnect_interval = Duration::from_secs(60);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(DeviceMonitor::new(registry.clone(), config).run(cancel.clone()));

        assert_eq!(rx.recv().await.unwrap(), "+42");
        assert_eq!(rx.recv().await.unwrap(), "-42");
        assert!(registry.is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}
