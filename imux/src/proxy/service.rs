//! Stand-in for a device service port
//!
//! When lockdown opens a service port on the device, the bridge opens the same port
//! locally. The first client to connect is tunnelled to the device port; TLS is
//! terminated on both legs the way the service expects it.

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    DeviceConnection, ImuxError, pairing_file::PairingFile, provider::DeviceProvider,
    services::{is_handshake_only_ssl, lockdown_session::PhoneServiceInformation},
};

use super::relay::relay;

#[derive(Debug)]
pub struct ServiceProxy {
    provider: Arc<dyn DeviceProvider>,
    pairing_file: PairingFile,
    info: PhoneServiceInformation,
    listener: TcpListener,
}

impl ServiceProxy {
    /// Listens on `host` at the service's port
    ///
    /// Port 0 lets the system choose, which only makes sense for tests.
    pub async fn bind(
        host: std::net::IpAddr,
        provider: Arc<dyn DeviceProvider>,
        pairing_file: PairingFile,
        info: PhoneServiceInformation,
    ) -> Result<Self, ImuxError> {
        let listener = TcpListener::bind((host, info.port)).await?;
        Ok(Self {
            provider,
            pairing_file,
            info,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ImuxError> {
        Ok(self.listener.local_addr()?)
    }

    /// Tunnels exactly one client, then closes the port
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ImuxError> {
        let name = self.info.name.clone();
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{name} closed before anyone connected");
                return Ok(());
            }
            a = self.listener.accept() => a?,
        };
        drop(self.listener);
        info!("{peer} connected to {name}");

        let mut device = self.provider.connect(self.info.port).await?;
        let mut client = DeviceConnection::new(Box::new(stream), self.provider.label());

        if self.info.use_ssl {
            let pf = &self.pairing_file;
            if is_handshake_only_ssl(&name) {
                debug!("{name} authenticates with TLS, then continues in plaintext");
                tokio::try_join!(
                    client.start_server_session_handshake_only(pf),
                    device.start_session_handshake_only(pf),
                )?;
            } else {
                tokio::try_join!(client.start_server_session(pf), device.start_session(pf))?;
            }
        }

        let stats = relay(Box::new(client), Box::new(device), &cancel).await;
        debug!(
            "{name} tunnel for {peer} done ({} up, {} down)",
            stats.client_to_device, stats.device_to_client
        );
        Ok(())
    }

    /// Runs the proxy on its own task, logging the outcome
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let name = self.info.name.clone();
            if let Err(e) = self.run(cancel).await {
                warn!("Service proxy for {name} failed: {e}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        net::{IpAddr, Ipv4Addr},
        pin::Pin,
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;
    use crate::test_util::test_pairing_file;

    /// Every port echoes four bytes back, with device-side TLS when asked
    #[derive(Debug)]
    struct EchoProvider {
        tls: bool,
    }

    impl DeviceProvider for EchoProvider {
        fn connect(
            &self,
            _port: u16,
        ) -> Pin<Box<dyn Future<Output = Result<DeviceConnection, ImuxError>> + Send>> {
            let tls = self.tls;
            Box::pin(async move {
                let (a, b) = tokio::io::duplex(64 * 1024);
                tokio::spawn(async move {
                    let mut device = DeviceConnection::new(Box::new(b), "device");
                    if tls {
                        device.start_server_session(&test_pairing_file()).await.unwrap();
                    }
                    let data = device.read_raw(4).await.unwrap();
                    device.send_raw(&data).await.unwrap();
                });
                Ok(DeviceConnection::new(Box::new(a), "test"))
            })
        }

        fn label(&self) -> &str {
            "test"
        }

        fn get_pairing_file(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<PairingFile, ImuxError>> + Send>> {
            Box::pin(async { Ok(test_pairing_file()) })
        }
    }

    async fn proxy(name: &str, use_ssl: bool) -> ServiceProxy {
        let info = PhoneServiceInformation {
            port: 0,
            name: name.into(),
            use_ssl,
        };
        ServiceProxy::bind(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Arc::new(EchoProvider { tls: use_ssl }),
            test_pairing_file(),
            info,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_plain_service_single_shot() {
        let proxy = proxy("com.apple.syslog_relay", false).await;
        let addr = proxy.local_addr().unwrap();
        let task = proxy.spawn(CancellationToken::new());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        task.await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_ssl_service_is_terminated_on_both_legs() {
        let proxy = proxy("com.apple.mobile.installation_proxy", true).await;
        let addr = proxy.local_addr().unwrap();
        let task = proxy.spawn(CancellationToken::new());

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = DeviceConnection::new(Box::new(stream), "client");
        client.start_session(&test_pairing_file()).await.unwrap();
        client.send_raw(b"tls!").await.unwrap();
        assert_eq!(client.read_raw(4).await.unwrap(), b"tls!");

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_connect() {
        let proxy = proxy("com.apple.syslog_relay", false).await;
        let cancel = CancellationToken::new();
        let task = proxy.spawn(cancel.clone());
        cancel.cancel();
        task.await.unwrap();
    }
}
