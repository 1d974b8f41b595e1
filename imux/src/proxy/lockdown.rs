//! Lockdown bridge
//!
//! Lets host tools talk to a device behind a remote muxer as if it were local. The
//! bridge answers on a local port in place of the device's lockdown, forwards every
//! request to the real one and follows the session through the responses: when TLS is
//! switched on it terminates it on both legs with the host half of the pair record, and
//! every service lockdown opens gets a local stand-in port.
//!
//! Host tools only trust the bridge if the local muxer holds a pair record made for it,
//! see [`publish_pair_record`].

use std::{net::IpAddr, sync::Arc};

use plist::Value;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    DeviceConnection, ImuxError, ReadWrite,
    pairing_file::PairingFile,
    provider::DeviceProvider,
    services::{
        lockdown::LockdownClient,
        lockdown_session::{PhoneServiceInformation, SessionStateMachine, SessionTransition},
    },
    usbmuxd::UsbmuxdAddr,
};

use super::service::ServiceProxy;

#[derive(Debug, Clone)]
pub struct LockdownBridge {
    provider: Arc<dyn DeviceProvider>,
    pairing_file: PairingFile,
}

impl LockdownBridge {
    /// # Arguments
    /// * `provider` - reaches the real device
    /// * `pairing_file` - the device's pair record as stored on the remote host
    pub fn new(provider: Arc<dyn DeviceProvider>, pairing_file: PairingFile) -> Self {
        Self {
            provider,
            pairing_file,
        }
    }

    /// Serves lockdown clients on `listener` until `cancel` fires
    ///
    /// Service ports are opened on the listener's address.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ImuxError> {
        let host = listener.local_addr()?.ip();
        info!("Lockdown bridge listening on {}", listener.local_addr()?);
        let mut clients = JoinSet::new();
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = clients.join_next(), if !clients.is_empty() => continue,
                a = listener.accept() => a?,
            };
            debug!("Lockdown client {peer}");
            let bridge = self.clone();
            let cancel = cancel.child_token();
            clients.spawn(async move {
                match bridge.handle(Box::new(stream), host, cancel).await {
                    Ok(()) => debug!("Lockdown client {peer} done"),
                    Err(e) => warn!("Lockdown client {peer} failed: {e}"),
                }
            });
        }
        clients.shutdown().await;
        Ok(())
    }

    /// Bridges one lockdown client until either side closes
    pub async fn handle(
        &self,
        client: Box<dyn ReadWrite>,
        service_host: IpAddr,
        cancel: CancellationToken,
    ) -> Result<(), ImuxError> {
        let mut device = self.provider.connect(LockdownClient::LOCKDOWND_PORT).await?;
        let mut client = DeviceConnection::new(client, self.provider.label());
        let mut session = SessionStateMachine::new();

        loop {
            let mut request = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = client.read_plist_unchecked() => match r {
                    Ok(r) => r,
                    Err(e) if e.is_closed() => return Ok(()),
                    Err(e) => return Err(e),
                },
            };
            let name = request
                .get("Request")
                .and_then(|v| v.as_string())
                .unwrap_or_default()
                .to_string();
            debug!("--> {name}");

            // The device only accepts a session from the host it paired with
            if name == "StartSession" {
                request.insert("HostID".into(), self.pairing_file.host_id.clone().into());
                request.insert(
                    "SystemBUID".into(),
                    self.pairing_file.system_buid.clone().into(),
                );
            }

            device.send_plist(Value::Dictionary(request)).await?;
            let response = device.read_plist_unchecked().await?;
            if let Some(e) = response.get("Error").and_then(|v| v.as_string()) {
                debug!("<-- {name} failed on the device: {e}");
            }
            client.send_plist(Value::Dictionary(response.clone())).await?;

            match session.observe(&response)? {
                SessionTransition::None => {}
                SessionTransition::BeginSsl { service } => {
                    let pf = &self.pairing_file;
                    tokio::try_join!(device.start_session(pf), client.start_server_session(pf))?;
                    session.handshake_complete()?;
                    debug!("Lockdown session encrypted on both legs");
                    if let Some(service) = service {
                        self.spawn_service(service_host, service, &cancel).await?;
                    }
                }
                SessionTransition::ServiceStarted(service) => {
                    self.spawn_service(service_host, service, &cancel).await?;
                }
                SessionTransition::StopSsl => {
                    device.stop_session()?;
                    client.stop_session()?;
                }
            }
        }
    }

    /// Opens the local stand-in for a service before the client learns the port
    async fn spawn_service(
        &self,
        host: IpAddr,
        info: PhoneServiceInformation,
        cancel: &CancellationToken,
    ) -> Result<(), ImuxError> {
        info!("Proxying {} on port {}", info.name, info.port);
        let proxy = ServiceProxy::bind(
            host,
            self.provider.clone(),
            self.pairing_file.clone(),
            info,
        )
        .await?;
        proxy.spawn(cancel.child_token());
        Ok(())
    }
}

/// Stores the bridge's pair record on the local muxer
///
/// Local lockdown clients look the record up by UDID. It carries the local muxer's
/// BUID and the host certificate in place of the device certificate, so the TLS the
/// bridge terminates is accepted.
///
/// # Arguments
/// * `local` - the muxer host tools on this machine use
/// * `device_id` - the device's ID on that muxer
/// * `udid` - the device serial
/// * `pairing_file` - the record the remote host paired with
pub async fn publish_pair_record(
    local: &UsbmuxdAddr,
    device_id: u32,
    udid: &str,
    pairing_file: &PairingFile,
) -> Result<(), ImuxError> {
    let mut mux = local.connect(0).await?;
    let buid = mux.get_buid().await?;
    debug!("Local muxer BUID is {buid}");
    let record = pairing_file.for_bridge(buid).serialize()?;
    mux.save_pair_record(device_id, udid, record).await?;
    info!("Published bridge pair record for {udid}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        net::Ipv4Addr,
        pin::Pin,
        sync::Mutex,
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;
    use crate::{test_util::test_pairing_file, usbmuxd::fake};

    /// Lockdown on its well known port, a plain echo service everywhere else
    #[derive(Debug)]
    struct FakeDevice {
        requests: Arc<Mutex<Vec<plist::Dictionary>>>,
        service_port: u16,
    }

    impl DeviceProvider for FakeDevice {
        fn connect(
            &self,
            port: u16,
        ) -> Pin<Box<dyn Future<Output = Result<DeviceConnection, ImuxError>> + Send>> {
            let requests = self.requests.clone();
            let service_port = self.service_port;
            Box::pin(async move {
                let (a, b) = tokio::io::duplex(64 * 1024);
                let mut device = DeviceConnection::new(Box::new(b), "device");
                if port == LockdownClient::LOCKDOWND_PORT {
                    tokio::spawn(async move {
                        let pf = test_pairing_file();
                        while let Ok(req) = device.read_plist_unchecked().await {
                            requests.lock().unwrap().push(req.clone());
                            let name = req.get("Request").and_then(|v| v.as_string()).unwrap().to_string();
                            let mut res = plist::Dictionary::new();
                            res.insert("Request".into(), name.as_str().into());
                            match name.as_str() {
                                "StartSession" => {
                                    res.insert("SessionID".into(), "S1".into());
                                    res.insert("EnableSessionSSL".into(), true.into());
                                    device.send_plist(Value::Dictionary(res)).await.unwrap();
                                    device.start_server_session(&pf).await.unwrap();
                                }
                                "StartService" => {
                                    res.insert("Service".into(), "com.apple.syslog_relay".into());
                                    res.insert("Port".into(), u64::from(service_port).into());
                                    device.send_plist(Value::Dictionary(res)).await.unwrap();
                                }
                                "StopSession" => {
                                    device.send_plist(Value::Dictionary(res)).await.unwrap();
                                    device.stop_session().unwrap();
                                }
                                _ => {
                                    res.insert("Value".into(), "iPhone".into());
                                    device.send_plist(Value::Dictionary(res)).await.unwrap();
                                }
                            }
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

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    fn request(name: &str) -> Value {
        let mut d = plist::Dictionary::new();
        d.insert("Label".into(), "tool".into());
        d.insert("Request".into(), name.into());
        Value::Dictionary(d)
    }

    #[tokio::test]
    async fn test_session_and_service_are_bridged() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let service_port = free_port();
        let provider = FakeDevice {
            requests: requests.clone(),
            service_port,
        };
        let mut pf = test_pairing_file();
        pf.host_id = "REAL-HOST".into();
        pf.system_buid = "REAL-BUID".into();
        let bridge = LockdownBridge::new(Arc::new(provider), pf);

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = {
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.serve(listener, cancel).await })
        };

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = DeviceConnection::new(Box::new(stream), "tool");

        let mut start = plist::Dictionary::new();
        start.insert("Request".into(), "StartSession".into());
        start.insert("HostID".into(), "LOCAL-HOST".into());
        client.send_plist(Value::Dictionary(start)).await.unwrap();
        let res = client.read_plist().await.unwrap();
        assert_eq!(res.get("EnableSessionSSL").and_then(|v| v.as_boolean()), Some(true));
        client.start_session(&test_pairing_file()).await.unwrap();

        client.send_plist(request("GetValue")).await.unwrap();
        let res = client.read_plist().await.unwrap();
        assert_eq!(res.get("Value").and_then(|v| v.as_string()), Some("iPhone"));

        let mut svc = plist::Dictionary::new();
        svc.insert("Request".into(), "StartService".into());
        svc.insert("Service".into(), "com.apple.syslog_relay".into());
        client.send_plist(Value::Dictionary(svc)).await.unwrap();
        let res = client.read_plist().await.unwrap();
        assert_eq!(
            res.get("Port").and_then(|v| v.as_unsigned_integer()),
            Some(u64::from(service_port))
        );

        let mut service = TcpStream::connect((Ipv4Addr::LOCALHOST, service_port))
            .await
            .unwrap();
        service.write_all(b"logs").await.unwrap();
        let mut buf = [0u8; 4];
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"logs");

        client.send_plist(request("StopSession")).await.unwrap();
        client.read_plist().await.unwrap();
        client.stop_session().unwrap();
        client.send_plist(request("QueryType")).await.unwrap();
        let res = client.read_plist().await.unwrap();
        assert_eq!(res.get("Request").and_then(|v| v.as_string()), Some("QueryType"));

        let seen = requests.lock().unwrap().clone();
        assert_eq!(
            seen[0].get("HostID").and_then(|v| v.as_string()),
            Some("REAL-HOST")
        );
        assert_eq!(
            seen[0].get("SystemBUID").and_then(|v| v.as_string()),
            Some("REAL-BUID")
        );
        assert_eq!(seen.len(), 5);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_publish_pair_record() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let local = UsbmuxdAddr::TcpSocket(listener.local_addr().unwrap());

        let muxer = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let (msg, req) = fake::read_request(&mut s).await;
            assert_eq!(req.get("MessageType").and_then(|v| v.as_string()), Some("ReadBUID"));
            let mut buid = plist::Dictionary::new();
            buid.insert("BUID".into(), "LOCAL-BUID".into());
            fake::reply(&mut s, msg.header.tag, buid).await;

            let (msg, req) = fake::read_request(&mut s).await;
            fake::reply(&mut s, msg.header.tag, fake::result(0)).await;
            req
        });

        let pf = test_pairing_file();
        publish_pair_record(&local, 3, "00008030-000000000000001E", &pf)
            .await
            .unwrap();

        let saved = muxer.await.unwrap();
        assert_eq!(
            saved.get("PairRecordID").and_then(|v| v.as_string()),
            Some("00008030-000000000000001E")
        );
        assert_eq!(saved.get("DeviceID").and_then(|v| v.as_unsigned_integer()), Some(3));
        let data = saved.get("PairRecordData").and_then(|v| v.as_data()).unwrap();
        let record = PairingFile::from_bytes(data).unwrap();
        assert_eq!(record.system_buid, "LOCAL-BUID");
        assert_eq!(record.device_certificate, pf.host_certificate);
        assert_eq!(record.host_id, pf.host_id);
    }
}
