//! A muxer in front of another muxer
//!
//! [`MuxProxy`] accepts usbmux clients on a local socket and answers them from a
//! [`Registry`] that a [`DeviceMonitor`] keeps in sync with an upstream muxer. Device
//! traffic is relayed to the upstream byte for byte once a `Connect` succeeds.

use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ImuxError, ReadWrite,
    monitor::{DeviceMonitor, MonitorConfig},
    registry::Registry,
    usbmuxd::UsbmuxdAddr,
};

pub mod forward;
pub mod lockdown;
pub mod relay;
pub mod service;
pub mod transport;

use transport::Transport;

/// A bound local socket accepting muxer clients
#[derive(Debug)]
pub enum ProxyListener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, String),
    Tcp(tokio::net::TcpListener),
}

impl ProxyListener {
    /// Binds `addr`
    ///
    /// A leftover unix socket file is replaced, unless something still answers on it.
    /// The new socket is made world accessible like the system muxer's.
    pub async fn bind(addr: &UsbmuxdAddr) -> Result<Self, ImuxError> {
        match addr {
            #[cfg(unix)]
            UsbmuxdAddr::UnixSocket(path) => {
                use std::os::unix::fs::PermissionsExt;

                if std::fs::metadata(path).is_ok() {
                    if tokio::net::UnixStream::connect(path).await.is_ok() {
                        return Err(ImuxError::Socket(std::io::Error::new(
                            std::io::ErrorKind::AddrInUse,
                            format!("{path} is served by another muxer"),
                        )));
                    }
                    debug!("Removing stale socket {path}");
                    std::fs::remove_file(path)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
                Ok(Self::Unix(listener, path.clone()))
            }
            UsbmuxdAddr::TcpSocket(a) => Ok(Self::Tcp(tokio::net::TcpListener::bind(a).await?)),
        }
    }

    pub async fn accept(&self) -> Result<(Box<dyn ReadWrite>, String), ImuxError> {
        match self {
            #[cfg(unix)]
            Self::Unix(l, path) => {
                let (s, _) = l.accept().await?;
                Ok((Box::new(s), path.clone()))
            }
            Self::Tcp(l) => {
                let (s, peer) = l.accept().await?;
                Ok((Box::new(s), peer.to_string()))
            }
        }
    }

    /// The address clients should use
    pub fn local_addr(&self) -> Result<UsbmuxdAddr, ImuxError> {
        match self {
            #[cfg(unix)]
            Self::Unix(_, path) => Ok(UsbmuxdAddr::UnixSocket(path.clone())),
            Self::Tcp(l) => Ok(UsbmuxdAddr::TcpSocket(l.local_addr()?)),
        }
    }
}

#[cfg(unix)]
impl Drop for ProxyListener {
    fn drop(&mut self) {
        if let Self::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Where clients connect
    pub listen: UsbmuxdAddr,
    /// The muxer that actually sees the devices
    pub upstream: UsbmuxdAddr,
    /// Hand out local device IDs instead of the upstream ones
    pub renumber: bool,
    pub reconnect_interval: Duration,
}

impl ProxyConfig {
    pub fn new(listen: UsbmuxdAddr, upstream: UsbmuxdAddr) -> Self {
        Self {
            listen,
            upstream,
            renumber: false,
            reconnect_interval: Duration::from_secs(2),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            upstream: self.upstream.clone(),
            renumber: self.renumber,
            reconnect_interval: self.reconnect_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MuxProxy {
    registry: Registry,
    upstream: UsbmuxdAddr,
}

impl MuxProxy {
    pub fn new(registry: Registry, upstream: UsbmuxdAddr) -> Self {
        Self { registry, upstream }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Monitors the upstream and serves clients until `cancel` fires
    pub async fn run(config: ProxyConfig, cancel: CancellationToken) -> Result<(), ImuxError> {
        let registry = Registry::new();
        let listener = ProxyListener::bind(&config.listen).await?;
        info!("Serving muxer clients on {}", config.listen);

        let monitor = DeviceMonitor::new(registry.clone(), config.monitor_config());
        let monitor = tokio::spawn(monitor.run(cancel.clone()));

        let proxy = Self::new(registry, config.upstream.clone());
        let res = proxy.serve(listener, cancel.clone()).await;
        cancel.cancel();
        let _ = monitor.await;
        res
    }

    /// Accepts clients on `listener`, one task per client
    ///
    /// Client tasks are aborted when `cancel` fires.
    pub async fn serve(
        &self,
        listener: ProxyListener,
        cancel: CancellationToken,
    ) -> Result<(), ImuxError> {
        let mut clients = JoinSet::new();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = clients.join_next(), if !clients.is_empty() => continue,
                a = listener.accept() => a,
            };
            let (socket, peer) = match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            debug!("New muxer client from {peer}");
            let transport = Transport::new(
                self.registry.clone(),
                self.upstream.clone(),
                socket,
                peer.clone(),
            );
            clients.spawn(async move {
                if let Err(e) = transport.run().await {
                    warn!("Client {peer} failed: {e}");
                }
            });
        }
        clients.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usbmuxd::{fake, test_entry};

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_listener_replaces_stale_socket() {
        let path = std::env::temp_dir().join(format!("imux-test-{}.sock", std::process::id()));
        let path = path.to_string_lossy().to_string();
        let addr = UsbmuxdAddr::UnixSocket(path.clone());

        // A socket file nobody serves any more
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(std::fs::metadata(&path).is_ok());

        let listener = ProxyListener::bind(&addr).await.unwrap();
        assert!(matches!(
            ProxyListener::bind(&addr).await,
            Err(ImuxError::Socket(e)) if e.kind() == std::io::ErrorKind::AddrInUse
        ));
        drop(listener);
        assert!(std::fs::metadata(&path).is_err());
    }

    #[tokio::test]
    async fn test_serve_answers_each_client() {
        let registry = Registry::new();
        let parent = CancellationToken::new();
        registry.add_device(&parent, test_entry(5, "00008101-0005"));
        let proxy = MuxProxy::new(
            registry,
            UsbmuxdAddr::TcpSocket("127.0.0.1:9".parse().unwrap()),
        );

        let listener = ProxyListener::bind(&UsbmuxdAddr::TcpSocket("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();
        let local = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = {
            let cancel = cancel.clone();
            tokio::spawn(async move { proxy.serve(listener, cancel).await })
        };

        for _ in 0..2 {
            let mut conn = local.connect(0).await.unwrap();
            let devices = conn.get_devices().await.unwrap();
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].device_id, 5);
        }

        // The muxer protocol survives a client that never speaks
        let _idle = local.to_socket().await.unwrap();
        let mut conn = local.to_socket().await.unwrap();
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        fake::reply(&mut conn, 1, req).await;
        let (_, res) = fake::read_request(&mut conn).await;
        assert!(res.contains_key("DeviceList"));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
