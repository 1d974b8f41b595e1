//! One proxied muxer client
//!
//! Requests are decoded only far enough to read `MessageType`. `ListDevices` and
//! `Listen` are answered from the registry, `Connect` turns the client socket into a
//! relay to the upstream muxer, pair-record commands are forwarded one at a time.

use plist::{Dictionary, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ImuxError, ReadWrite,
    monitor::upstream_device_id,
    registry::{Registry, listener_fn},
    usbmuxd::{UsbmuxMessage, UsbmuxdAddr, UsbmuxdConnection, check_result},
};

use super::relay::{RelayStats, relay};

/// usbmux `Result` numbers the proxy sends itself
const RESULT_OK: u64 = 0;
const RESULT_BAD_COMMAND: u64 = 1;
const RESULT_BAD_DEVICE: u64 = 2;

pub struct Transport {
    registry: Registry,
    upstream: UsbmuxdAddr,
    client: UsbmuxdConnection,
    peer: String,
}

/// What became of a request
enum Next {
    Continue,
    Close,
    Relay(Box<dyn ReadWrite>, CancellationToken),
    Listen,
}

impl Transport {
    pub fn new(
        registry: Registry,
        upstream: UsbmuxdAddr,
        client: Box<dyn ReadWrite>,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            upstream,
            client: UsbmuxdConnection::new(client, 0),
            peer: peer.into(),
        }
    }

    /// Serves the client until it goes away
    pub async fn run(mut self) -> Result<(), ImuxError> {
        loop {
            let request = match self.client.read_message().await {
                Ok(r) => r,
                Err(ImuxError::ConnectionClosed) => {
                    debug!("{} disconnected", self.peer);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let payload = request.plist()?;
            let message_type = payload
                .get("MessageType")
                .and_then(|v| v.as_string())
                .unwrap_or_default()
                .to_string();
            debug!("{} -> {message_type}", self.peer);

            let next = match message_type.as_str() {
                "ListDevices" => self.list_devices(&request).await?,
                "Listen" => Next::Listen,
                "Connect" => self.connect(&request, payload).await?,
                "ReadBUID" | "ReadPairRecord" | "SavePairRecord" | "DeletePairRecord"
                | "ListListeners" => self.forward_once(&request, payload).await?,
                other => {
                    warn!("{} sent unsupported command {other:?}", self.peer);
                    self.reply(&request, result(RESULT_BAD_COMMAND)).await?;
                    Next::Close
                }
            };

            match next {
                Next::Continue => {}
                Next::Close => return Ok(()),
                Next::Listen => return self.listen(&request).await,
                Next::Relay(device, token) => {
                    let RelayStats {
                        client_to_device,
                        device_to_client,
                    } = relay(self.client.into_inner(), device, &token).await;
                    info!(
                        "{} tunnel closed ({client_to_device} bytes up, {device_to_client} down)",
                        self.peer
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Answers with the given payload under the request's tag
    async fn reply(&mut self, request: &UsbmuxMessage, payload: Dictionary) -> Result<(), ImuxError> {
        let msg = UsbmuxMessage::new(
            payload,
            UsbmuxdConnection::XML_PLIST_VERSION,
            UsbmuxdConnection::PLIST_MESSAGE_TYPE,
            request.header.tag,
        )?;
        self.client.send_message(&msg).await
    }

    async fn list_devices(&mut self, request: &UsbmuxMessage) -> Result<Next, ImuxError> {
        let mut list = Vec::new();
        for device in self.registry.devices() {
            let mut d = device.to_dictionary()?;
            d.insert("MessageType".into(), "Attached".into());
            list.push(Value::Dictionary(d));
        }
        let mut res = Dictionary::new();
        res.insert("DeviceList".into(), Value::Array(list));
        self.reply(request, res).await?;
        Ok(Next::Continue)
    }

    async fn connect(
        &mut self,
        request: &UsbmuxMessage,
        mut payload: Dictionary,
    ) -> Result<Next, ImuxError> {
        let device_id = payload
            .get("DeviceID")
            .and_then(|v| v.as_unsigned_integer())
            .map(|v| v as u32);
        let (device_id, token) = match device_id.and_then(|id| {
            self.registry.device_token(id).map(|t| (id, t))
        }) {
            Some(d) => d,
            None => {
                warn!("{} asked for unknown device {device_id:?}", self.peer);
                self.reply(request, result(RESULT_BAD_DEVICE)).await?;
                return Ok(Next::Continue);
            }
        };

        let real_id = upstream_device_id(&self.registry, device_id);
        if real_id != device_id {
            debug!("Rewriting device {device_id} to upstream {real_id}");
            payload.insert("DeviceID".into(), real_id.into());
        }

        let mut upstream = match self.upstream.connect(0).await {
            Ok(u) => u,
            Err(e) => {
                warn!("Upstream unreachable for {}: {e}", self.peer);
                self.reply(request, result(RESULT_BAD_DEVICE)).await?;
                return Ok(Next::Continue);
            }
        };
        let forwarded = request.with_plist(payload)?;
        let response = match async {
            upstream.send_message(&forwarded).await?;
            Ok::<_, ImuxError>(upstream.read_message().await?)
        }
        .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Upstream failed the connect for {}: {e}", self.peer);
                self.reply(request, result(RESULT_BAD_DEVICE)).await?;
                return Ok(Next::Continue);
            }
        };
        let accepted = check_result(&response.plist()?).is_ok();
        self.client.send_message(&response).await?;

        if !accepted {
            debug!("Upstream refused the connection for {}", self.peer);
            return Ok(Next::Continue);
        }
        Ok(Next::Relay(upstream.into_inner(), token))
    }

    /// Forwards a pair-record style command and its one reply
    async fn forward_once(
        &mut self,
        request: &UsbmuxMessage,
        mut payload: Dictionary,
    ) -> Result<Next, ImuxError> {
        if let Some(id) = payload
            .get("DeviceID")
            .and_then(|v| v.as_unsigned_integer())
        {
            let real_id = upstream_device_id(&self.registry, id as u32);
            payload.insert("DeviceID".into(), real_id.into());
        }
        let mut upstream = self.upstream.connect(0).await?;
        upstream.send_message(&request.with_plist(payload)?).await?;
        let response = upstream.read_message().await?;
        self.client.send_message(&response).await?;
        Ok(Next::Continue)
    }

    /// Streams registry changes to the client until it hangs up
    async fn listen(self, request: &UsbmuxMessage) -> Result<(), ImuxError> {
        let Self {
            registry,
            mut client,
            peer,
            ..
        } = self;

        let ok = UsbmuxMessage::new(
            result(RESULT_OK),
            UsbmuxdConnection::XML_PLIST_VERSION,
            UsbmuxdConnection::PLIST_MESSAGE_TYPE,
            request.header.tag,
        )?;
        client.send_message(&ok).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Dictionary>();
        let removed_tx = tx.clone();
        // Callbacks only queue, the writes happen below outside the registry lock
        let _subscription = registry.listen(listener_fn(
            move |_, device| match device.to_dictionary() {
                Ok(mut d) => {
                    d.insert("MessageType".into(), "Attached".into());
                    let _ = tx.send(d);
                }
                Err(e) => warn!("Cannot describe device {}: {e}", device.device_id),
            },
            move |_, device| {
                let mut d = Dictionary::new();
                d.insert("MessageType".into(), "Detached".into());
                d.insert("DeviceID".into(), device.device_id.into());
                let _ = removed_tx.send(d);
            },
        ));
        info!("{peer} is listening");

        let (mut reader, mut writer) = tokio::io::split(client.into_inner());
        let mut eof_check = [0u8; 1];
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let msg = UsbmuxMessage::new(
                        event,
                        UsbmuxdConnection::XML_PLIST_VERSION,
                        UsbmuxdConnection::PLIST_MESSAGE_TYPE,
                        0,
                    )?;
                    let sent = async {
                        writer.write_all(&msg.encode()).await?;
                        writer.flush().await
                    };
                    if let Err(e) = sent.await {
                        debug!("{peer} stopped taking events: {e}");
                        break;
                    }
                }
                // A listening client never sends anything, a read only ends with it
                res = reader.read(&mut eof_check) => {
                    match res {
                        Ok(0) | Err(_) => debug!("{peer} stopped listening"),
                        Ok(_) => warn!("{peer} sent data on a listen connection, closing"),
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}

fn result(number: u64) -> Dictionary {
    let mut d = Dictionary::new();
    d.insert("MessageType".into(), "Result".into());
    d.insert("Number".into(), number.into());
    d
}
