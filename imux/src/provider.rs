//! Device providers
//!
//! A provider knows how to reach one device: how to open a stream to a device port and
//! where its pair record lives. Everything above the transport is written against
//! [`DeviceProvider`].

use std::{future::Future, pin::Pin};

use tracing::debug;

use crate::{
    DeviceConnection, DeviceService, ImuxError, pairing_file::PairingFile,
    services::lockdown::LockdownClient,
};

#[cfg(feature = "usbmuxd")]
use crate::usbmuxd::{DeviceEntry, UsbmuxdAddr};

/// A provider for connecting to a device
pub trait DeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<DeviceConnection, ImuxError>> + Send>>;

    fn label(&self) -> &str;

    fn get_pairing_file(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PairingFile, ImuxError>> + Send>>;
}

/// Reaches a device through a muxer
#[cfg(feature = "usbmuxd")]
#[derive(Debug, Clone)]
pub struct UsbmuxdProvider {
    pub addr: UsbmuxdAddr,
    pub tag: u32,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

#[cfg(feature = "usbmuxd")]
impl DeviceProvider for UsbmuxdProvider {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<DeviceConnection, ImuxError>> + Send>> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let device_id = self.device_id;
        let label = self.label.clone();

        Box::pin(async move {
            let usbmuxd = addr.connect(tag).await?;
            usbmuxd.connect_to_device(device_id, port, label).await
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn get_pairing_file(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PairingFile, ImuxError>> + Send>> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let udid = self.udid.clone();

        Box::pin(async move {
            let mut usbmuxd = addr.connect(tag).await?;
            usbmuxd.get_pair_record(&udid).await
        })
    }
}

/// Looks a device up on the muxer by serial number
///
/// # Errors
/// `DeviceNotFound` if it is not attached
#[cfg(feature = "usbmuxd")]
pub async fn get_device(addr: &UsbmuxdAddr, serial: &str) -> Result<DeviceEntry, ImuxError> {
    let mut usbmuxd = addr.connect(0).await?;
    usbmuxd.get_device(serial).await
}

/// Opens a ready-to-use stream to a named lockdown service
///
/// Starts a lockdown session, asks for the service and connects to the returned port.
/// When the service wants SSL the new stream is upgraded, either for the whole session
/// or, for the instruments family, for the handshake only.
pub async fn connect_to_service(
    provider: &dyn DeviceProvider,
    service_name: &str,
) -> Result<DeviceConnection, ImuxError> {
    let mut lockdown = LockdownClient::connect(provider).await?;
    let pairing_file = provider.get_pairing_file().await?;
    lockdown.start_session(&pairing_file).await?;

    let info = lockdown.start_service(service_name).await?;
    debug!(
        "{} started on port {} (ssl: {})",
        info.name, info.port, info.use_ssl
    );
    // Lockdown stays usable only for this one request
    lockdown.conn.close().await?;

    let mut conn = provider.connect(info.port).await?;
    if info.use_ssl {
        if crate::services::is_handshake_only_ssl(service_name) {
            conn.start_session_handshake_only(&pairing_file).await?;
        } else {
            conn.start_session(&pairing_file).await?;
        }
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::test_util::test_pairing_file;

    /// Serves lockdown on one port and a plain echo service on every other
    #[derive(Debug)]
    struct FakeProvider {
        ports: Arc<Mutex<Vec<u16>>>,
    }

    impl DeviceProvider for FakeProvider {
        fn connect(
            &self,
            port: u16,
        ) -> Pin<Box<dyn Future<Output = Result<DeviceConnection, ImuxError>> + Send>> {
            self.ports.lock().unwrap().push(port);
            Box::pin(async move {
                let (a, b) = tokio::io::duplex(64 * 1024);
                let mut device = DeviceConnection::new(Box::new(b), "device");
                if port == LockdownClient::LOCKDOWND_PORT {
                    tokio::spawn(async move {
                        let pf = test_pairing_file();
                        while let Ok(req) = device.read_plist().await {
                            let name = req.get("Request").and_then(|v| v.as_string()).unwrap().to_string();
                            let mut res = plist::Dictionary::new();
                            res.insert("Request".into(), name.as_str().into());
                            if name == "StartSession" {
                                res.insert("EnableSessionSSL".into(), true.into());
                                device.send_plist(plist::Value::Dictionary(res)).await.unwrap();
                                device.start_server_session(&pf).await.unwrap();
                                continue;
                            }
                            res.insert("Service".into(), req.get("Service").unwrap().clone());
                            res.insert("Port".into(), 50001u64.into());
                            device.send_plist(plist::Value::Dictionary(res)).await.unwrap();
                        }
                    });
                } else {
                    tokio::spawn(async move {
                        let data = device.read_raw(4).await.unwrap();
                        device.send_raw(&data).await.unwrap();
                    });
                }
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

    #[tokio::test]
    async fn test_connect_to_service_goes_through_lockdown() {
        let provider = FakeProvider {
            ports: Arc::new(Mutex::new(Vec::new())),
        };
        let mut conn = connect_to_service(&provider, "com.apple.syslog_relay")
            .await
            .unwrap();
        assert!(!conn.is_tls());
        conn.send_raw(b"ping").await.unwrap();
        assert_eq!(conn.read_raw(4).await.unwrap(), b"ping");
        assert_eq!(*provider.ports.lock().unwrap(), vec![62078, 50001]);
    }

    #[test]
    fn test_handshake_only_family() {
        assert!(crate::services::is_handshake_only_ssl(
            "com.apple.instruments.remoteserver"
        ));
        assert!(!crate::services::is_handshake_only_ssl(
            "com.apple.instruments.remoteserver.DVTSecureSocketProxy"
        ));
    }
}
