//! DTX connection and channels
//!
//! One [`DtxConnection`] owns one physical stream to an instruments-class service. A
//! background task reads every message off the stream. Replies are matched to pending
//! calls by identifier, which is unique per connection rather than per channel, so many
//! calls may be outstanding at once. Messages the device initiates are handed to the
//! [`Dispatcher`] registered for their channel and acknowledged when the device asked
//! for a reply.
//!
//! A read error or a malformed fragment takes down every channel at once. Pending calls
//! fail with `ConnectionClosed` and the connection has to be rebuilt from scratch.
//!
//! # Example
//! ```rust,no_run
//! # async fn demo(stream: Box<dyn imux::ReadWrite>) -> Result<(), imux::ImuxError> {
//! use imux::dvt::{remote_server::DtxConnection, message::AuxValue};
//!
//! let conn = DtxConnection::new(stream);
//! conn.perform_handshake().await?;
//! let channel = conn
//!     .request_channel("com.apple.instruments.server.services.deviceinfo", None)
//!     .await?;
//! let res = channel.method_call("runningProcesses", Vec::new()).await?;
//! println!("{:?}", res.data);
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use plist::Value;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{ImuxError, ReadWrite, util::lock};

use super::{
    dispatch::Dispatcher,
    fragment::FragmentAssembler,
    message::{
        Aux, AuxValue, Message, MessageHeader, MessageKind, PayloadHeader, read_fragment,
    },
};

/// How long a call waits for its reply unless told otherwise
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Control channel, always open
pub const ROOT_CHANNEL: u32 = 0;
/// Channel on which the device talks to the IDE side of a test session
pub const IDE_CHANNEL: u32 = 0xFFFF_FFFF;

const REQUEST_CHANNEL: &str = "_requestChannelWithCode:identifier:";
const PUBLISH_CAPABILITIES: &str = "_notifyOfPublishedCapabilities:";

type Reply = oneshot::Sender<Result<Message, ImuxError>>;

#[derive(Debug, Clone)]
enum Capabilities {
    Waiting,
    Published(Value),
    Closed,
}

#[derive(Default)]
struct State {
    /// Identifier of the last message this side started
    last_identifier: u32,
    next_channel: u32,
    channels: HashMap<String, u32>,
    dispatchers: HashMap<u32, Arc<Dispatcher>>,
    pending: HashMap<u32, Reply>,
    closed: bool,
}

struct Shared {
    label: String,
    writer: tokio::sync::Mutex<WriteHalf<Box<dyn ReadWrite>>>,
    state: Mutex<State>,
    /// Serializes channel requests so one name never gets two codes
    channel_requests: tokio::sync::Mutex<()>,
    capabilities: watch::Sender<Capabilities>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

// The read loop only holds a weak reference, so this runs once the last handle is gone
impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.reader).take() {
            handle.abort();
        }
    }
}

/// Handle to a DTX connection, cheap to clone
#[derive(Clone)]
pub struct DtxConnection {
    shared: Arc<Shared>,
}

/// A logical channel on a [`DtxConnection`]
#[derive(Clone)]
pub struct Channel {
    conn: DtxConnection,
    code: u32,
}

impl DtxConnection {
    /// Wraps a stream and starts reading from it
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(stream: Box<dyn ReadWrite>) -> Self {
        Self::with_label(stream, "dtx")
    }

    pub fn with_label(stream: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (capabilities, _) = watch::channel(Capabilities::Waiting);
        let shared = Arc::new(Shared {
            label: label.into(),
            writer: tokio::sync::Mutex::new(writer),
            state: Mutex::new(State {
                next_channel: 1,
                ..Default::default()
            }),
            channel_requests: tokio::sync::Mutex::new(()),
            capabilities,
            reader: Mutex::new(None),
        });
        let handle = tokio::spawn(read_loop(Arc::downgrade(&shared), reader));
        *lock(&shared.reader) = Some(handle);
        Self { shared }
    }

    /// Closes the connection when `token` is cancelled
    pub fn close_on(&self, token: CancellationToken) {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            token.cancelled().await;
            if let Some(shared) = shared.upgrade() {
                DtxConnection { shared }.close().await;
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    pub fn root_channel(&self) -> Channel {
        Channel {
            conn: self.clone(),
            code: ROOT_CHANNEL,
        }
    }

    /// Registers `dispatcher` for device calls on the IDE channel
    pub fn ide_channel(&self, dispatcher: Dispatcher) -> Channel {
        self.set_dispatcher(IDE_CHANNEL, dispatcher);
        Channel {
            conn: self.clone(),
            code: IDE_CHANNEL,
        }
    }

    /// Routes device calls on `channel` to `dispatcher`
    pub fn set_dispatcher(&self, channel: u32, dispatcher: Dispatcher) {
        lock(&self.shared.state)
            .dispatchers
            .insert(channel, Arc::new(dispatcher));
    }

    /// Opens the named service channel, or returns the already open one
    ///
    /// A `dispatcher` given for an already open channel replaces the old one.
    ///
    /// # Errors
    /// Whatever the device answers with, `UnexpectedResponse` if it answers with data
    pub async fn request_channel(
        &self,
        name: impl Into<String>,
        dispatcher: Option<Dispatcher>,
    ) -> Result<Channel, ImuxError> {
        let name = name.into();
        let _guard = self.shared.channel_requests.lock().await;

        let code = {
            let mut state = lock(&self.shared.state);
            if let Some(code) = state.channels.get(&name).copied() {
                if let Some(d) = dispatcher {
                    state.dispatchers.insert(code, Arc::new(d));
                }
                return Ok(Channel {
                    conn: self.clone(),
                    code,
                });
            }
            let code = state.next_channel;
            state.next_channel += 1;
            // The device may talk on the channel before it answers the request
            if let Some(d) = dispatcher {
                state.dispatchers.insert(code, Arc::new(d));
            }
            code
        };

        let args = vec![
            AuxValue::U32(code),
            AuxValue::archived_value(name.as_str())?,
        ];
        let res = match self
            .method_call(ROOT_CHANNEL, REQUEST_CHANNEL, args, DEFAULT_TIMEOUT)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                lock(&self.shared.state).dispatchers.remove(&code);
                return Err(e);
            }
        };
        if res.data.is_some() {
            warn!("Channel request for {name} was answered with {:?}", res.data);
            lock(&self.shared.state).dispatchers.remove(&code);
            return Err(ImuxError::UnexpectedResponse);
        }

        debug!("Opened channel {code} for {name}");
        lock(&self.shared.state).channels.insert(name, code);
        Ok(Channel {
            conn: self.clone(),
            code,
        })
    }

    /// Exchanges capabilities with the device
    ///
    /// Publishes ours and waits for the device to publish its own, which it does on the
    /// root channel without asking for a reply.
    pub async fn perform_handshake(&self) -> Result<plist::Dictionary, ImuxError> {
        let mut caps = plist::Dictionary::new();
        caps.insert(
            "com.apple.private.DTXBlockCompression".into(),
            Value::Integer(0u64.into()),
        );
        caps.insert(
            "com.apple.private.DTXConnection".into(),
            Value::Integer(1u64.into()),
        );
        self.method_call_async(
            ROOT_CHANNEL,
            PUBLISH_CAPABILITIES,
            vec![AuxValue::archived_value(Value::Dictionary(caps))?],
        )
        .await?;

        let mut rx = self.shared.capabilities.subscribe();
        let wait = rx.wait_for(|c| !matches!(c, Capabilities::Waiting));
        let caps = match tokio::time::timeout(DEFAULT_TIMEOUT, wait).await {
            Ok(Ok(c)) => c.clone(),
            Ok(Err(_)) => return Err(ImuxError::ConnectionClosed),
            Err(_) => return Err(ImuxError::Timeout),
        };
        match caps {
            Capabilities::Published(Value::Dictionary(d)) => Ok(d),
            Capabilities::Published(other) => {
                warn!("Device published capabilities as {other:?}");
                Err(ImuxError::UnexpectedResponse)
            }
            Capabilities::Closed | Capabilities::Waiting => Err(ImuxError::ConnectionClosed),
        }
    }

    /// Calls `selector` on `channel` and waits for the reply
    ///
    /// # Errors
    /// * `Timeout` if nothing arrives within `timeout`; the call is forgotten
    /// * `ConnectionClosed` if the connection dies first
    /// * `DtxRemoteError` if the device answers with an error message
    pub async fn method_call(
        &self,
        channel: u32,
        selector: &str,
        args: Vec<AuxValue>,
        timeout: Duration,
    ) -> Result<Message, ImuxError> {
        let (tx, rx) = oneshot::channel();
        let identifier = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return Err(ImuxError::ConnectionClosed);
            }
            state.last_identifier = state.last_identifier.wrapping_add(1);
            let identifier = state.last_identifier;
            // Registered before sending so a fast reply always finds it
            state.pending.insert(identifier, tx);
            identifier
        };

        let msg = invocation(identifier, channel, selector, args, true);
        if let Err(e) = self.write_message(&msg).await {
            lock(&self.shared.state).pending.remove(&identifier);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(ImuxError::ConnectionClosed),
            Err(_) => {
                lock(&self.shared.state).pending.remove(&identifier);
                warn!("{selector} on channel {channel} timed out after {timeout:?}");
                Err(ImuxError::Timeout)
            }
        }
    }

    /// Sends `selector` on `channel` without asking for a reply
    pub async fn method_call_async(
        &self,
        channel: u32,
        selector: &str,
        args: Vec<AuxValue>,
    ) -> Result<(), ImuxError> {
        let identifier = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return Err(ImuxError::ConnectionClosed);
            }
            state.last_identifier = state.last_identifier.wrapping_add(1);
            state.last_identifier
        };
        self.write_message(&invocation(identifier, channel, selector, args, false))
            .await
    }

    /// Answers a device message that expects a reply
    ///
    /// Sends `reply` as the response value, or a bare acknowledgement without one. The
    /// device will not send anything else on the channel until it gets this.
    pub async fn send_ack_if_needed(
        &self,
        msg: &Message,
        reply: Option<Value>,
    ) -> Result<(), ImuxError> {
        if !msg.message_header.expects_reply {
            return Ok(());
        }
        let answer = match reply {
            Some(v) => msg.reply(v),
            None => msg.ack(),
        };
        self.write_message(&answer).await
    }

    async fn write_message(&self, msg: &Message) -> Result<(), ImuxError> {
        let bytes = msg.serialize()?;
        trace!(
            "{} sending {:?} #{} on channel {}",
            self.shared.label,
            msg.kind(),
            msg.message_header.identifier,
            msg.message_header.channel
        );
        let mut writer = self.shared.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Tears the connection down, failing every pending call
    pub async fn close(&self) {
        teardown(&self.shared);
        let handle = lock(&self.shared.reader).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Err(e) = self.shared.writer.lock().await.shutdown().await {
            debug!("{} shutdown failed: {e}", self.shared.label);
        }
    }
}

impl Channel {
    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn connection(&self) -> &DtxConnection {
        &self.conn
    }

    /// Calls a method with the default timeout
    pub async fn method_call(
        &self,
        selector: &str,
        args: Vec<AuxValue>,
    ) -> Result<Message, ImuxError> {
        self.conn
            .method_call(self.code, selector, args, DEFAULT_TIMEOUT)
            .await
    }

    pub async fn method_call_with_timeout(
        &self,
        selector: &str,
        args: Vec<AuxValue>,
        timeout: Duration,
    ) -> Result<Message, ImuxError> {
        self.conn
            .method_call(self.code, selector, args, timeout)
            .await
    }

    pub async fn method_call_async(
        &self,
        selector: &str,
        args: Vec<AuxValue>,
    ) -> Result<(), ImuxError> {
        self.conn.method_call_async(self.code, selector, args).await
    }
}

fn invocation(
    identifier: u32,
    channel: u32,
    selector: &str,
    args: Vec<AuxValue>,
    expects_reply: bool,
) -> Message {
    let mut pheader = PayloadHeader::method_invocation();
    if expects_reply {
        pheader.apply_expects_reply_map();
    }
    let aux = if args.is_empty() {
        None
    } else {
        Some(Aux::from_values(args))
    };
    Message::new(
        MessageHeader::new(0, 1, identifier, 0, channel, expects_reply),
        pheader,
        aux,
        Some(Value::String(selector.to_string())),
    )
}

/// Marks the connection dead and fails everything waiting on it
fn teardown(shared: &Shared) {
    let pending = {
        let mut state = lock(&shared.state);
        state.closed = true;
        std::mem::take(&mut state.pending)
    };
    for (_, tx) in pending {
        let _ = tx.send(Err(ImuxError::ConnectionClosed));
    }
    shared.capabilities.send_if_modified(|c| {
        if matches!(c, Capabilities::Waiting) {
            *c = Capabilities::Closed;
            true
        } else {
            false
        }
    });
}

async fn read_loop(shared: Weak<Shared>, mut reader: ReadHalf<Box<dyn ReadWrite>>) {
    let mut assembler = FragmentAssembler::default();
    let res: Result<(), ImuxError> = async {
        loop {
            let (header, chunk) = read_fragment(&mut reader).await?;
            let Some((header, payload)) = assembler.push(header, chunk)? else {
                continue;
            };
            let msg = Message::from_payload(header, &payload)?;
            let Some(shared) = shared.upgrade() else {
                return Ok(());
            };
            handle_message(&DtxConnection { shared }, msg).await?;
        }
    }
    .await;
    let Some(shared) = shared.upgrade() else {
        return;
    };

    match res {
        Err(ImuxError::ConnectionClosed) => debug!("{} closed by the device", shared.label),
        Err(e) => error!("{} failed, closing every channel: {e}", shared.label),
        Ok(()) => {}
    }
    assembler.clear();
    teardown(&shared);
}

async fn handle_message(conn: &DtxConnection, msg: Message) -> Result<(), ImuxError> {
    let header = &msg.message_header;
    trace!(
        "{} received {:?} #{}.{} on channel {}",
        conn.shared.label,
        msg.kind(),
        header.identifier,
        header.conversation_index,
        header.channel
    );

    // Anything further along a conversation answers one of our calls
    if header.conversation_index > 0 {
        let waiter = lock(&conn.shared.state).pending.remove(&header.identifier);
        match waiter {
            Some(tx) => {
                let res = match msg.kind() {
                    MessageKind::Error => Err(ImuxError::DtxRemoteError(format!("{:?}", msg.data))),
                    _ => Ok(msg),
                };
                let _ = tx.send(res);
            }
            None => debug!(
                "Reply #{} matches no pending call, dropping it",
                header.identifier
            ),
        }
        return Ok(());
    }

    let dispatcher = {
        let mut state = lock(&conn.shared.state);
        // Keep our identifiers ahead of the ones the device has used
        if header.identifier > state.last_identifier {
            state.last_identifier = header.identifier;
        }
        state
            .dispatchers
            .get(&header.channel)
            .or_else(|| state.dispatchers.get(&header.channel.wrapping_neg()))
            .cloned()
    };

    if header.channel == ROOT_CHANNEL && msg.selector() == Some(PUBLISH_CAPABILITIES) {
        let caps = msg.arguments()?.into_iter().next().unwrap_or(Value::Boolean(false));
        debug!("Device capabilities: {caps:?}");
        conn.shared
            .capabilities
            .send_replace(Capabilities::Published(caps));
    }

    let reply = match dispatcher {
        Some(d) => d.dispatch(&msg),
        None => {
            if header.channel != ROOT_CHANNEL {
                debug!(
                    "No dispatcher for {:?} on channel {}",
                    msg.selector(),
                    header.channel
                );
            }
            None
        }
    };
    conn.send_ack_if_needed(&msg, reply).await
}

impl fmt::Debug for DtxConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("DtxConnection")
            .field("label", &self.shared.label)
            .field("channels", &state.channels)
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("code", &self.code).finish()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A scripted device end of a DTX stream

    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;

    pub struct FakeDevice {
        pub stream: DuplexStream,
        pub next_identifier: u32,
    }

    impl FakeDevice {
        pub fn pair() -> (DtxConnection, FakeDevice) {
            let (a, b) = tokio::io::duplex(1024 * 1024);
            (
                DtxConnection::new(Box::new(a)),
                FakeDevice {
                    stream: b,
                    next_identifier: 1000,
                },
            )
        }

        pub async fn read(&mut self) -> Message {
            Message::from_reader(&mut self.stream).await.unwrap()
        }

        pub async fn send(&mut self, msg: &Message) {
            self.stream.write_all(&msg.serialize().unwrap()).await.unwrap();
        }

        /// Starts a call of its own on `channel`
        pub async fn call(&mut self, channel: u32, selector: &str, expects_reply: bool) -> u32 {
            self.next_identifier += 1;
            let msg = invocation(self.next_identifier, channel, selector, Vec::new(), expects_reply);
            self.send(&msg).await;
            self.next_identifier
        }

        /// Reads a call and answers it with `value`, or a bare ack
        pub async fn answer(&mut self, value: Option<Value>) -> Message {
            let msg = self.read().await;
            let reply = match value {
                Some(v) => msg.reply(v),
                None => msg.ack(),
            };
            self.send(&reply).await;
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{fake::FakeDevice, *};

    #[tokio::test]
    async fn test_method_call_times_out() {
        let (conn, mut device) = FakeDevice::pair();
        let call = tokio::spawn(async move {
            conn.method_call(3, "neverAnswered", Vec::new(), Duration::from_millis(50))
                .await
        });
        let msg = device.read().await;
        assert_eq!(msg.selector(), Some("neverAnswered"));
        assert!(matches!(call.await.unwrap(), Err(ImuxError::Timeout)));
    }

    #[tokio::test]
    async fn test_unsolicited_call_is_acknowledged() {
        let (conn, mut device) = FakeDevice::pair();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.set_dispatcher(
            IDE_CHANNEL,
            Dispatcher::new().on("_XCT_testBundleReadyWithProtocolVersion:", move |m| {
                tx.send(m.message_header.identifier).unwrap();
                None
            }),
        );

        let id = device
            .call(IDE_CHANNEL, "_XCT_testBundleReadyWithProtocolVersion:", true)
            .await;
        let ack = device.read().await;
        assert_eq!(rx.recv().await.unwrap(), id);
        assert_eq!(ack.kind(), MessageKind::Ack);
        assert_eq!(ack.message_header.identifier, id);
        assert_eq!(ack.message_header.conversation_index, 1);
        assert_eq!(ack.message_header.channel, IDE_CHANNEL);
        assert!(!ack.message_header.expects_reply);

        // A notification gets no ack, the next thing on the wire is our own call
        device.call(IDE_CHANNEL, "_XCT_logDebugMessage:", false).await;
        let c = conn.clone();
        tokio::spawn(async move { c.method_call_async(1, "next", Vec::new()).await });
        assert_eq!(device.read().await.selector(), Some("next"));
    }

    #[tokio::test]
    async fn test_dispatcher_reply_is_a_response() {
        let (conn, mut device) = FakeDevice::pair();
        conn.set_dispatcher(
            IDE_CHANNEL,
            Dispatcher::new().with_default(|_| Some(Value::String("ok".into()))),
        );
        device.call(IDE_CHANNEL, "_XCT_didBeginExecutingTestPlan", true).await;
        let res = device.read().await;
        assert_eq!(res.kind(), MessageKind::Response);
        assert_eq!(res.data, Some(Value::String("ok".into())));
    }

    #[tokio::test]
    async fn test_out_of_order_replies_are_correlated() {
        let (conn, mut device) = FakeDevice::pair();
        let c1 = conn.clone();
        let first = tokio::spawn(async move { c1.method_call(2, "first", Vec::new(), DEFAULT_TIMEOUT).await });
        let m1 = device.read().await;
        let c2 = conn.clone();
        let second = tokio::spawn(async move { c2.method_call(2, "second", Vec::new(), DEFAULT_TIMEOUT).await });
        let m2 = device.read().await;
        assert_ne!(m1.message_header.identifier, m2.message_header.identifier);

        device.send(&m2.reply(Value::String("two".into()))).await;
        device.send(&m1.reply(Value::String("one".into()))).await;

        assert_eq!(
            first.await.unwrap().unwrap().data,
            Some(Value::String("one".into()))
        );
        assert_eq!(
            second.await.unwrap().unwrap().data,
            Some(Value::String("two".into()))
        );
    }

    #[tokio::test]
    async fn test_channel_request_is_cached() {
        let (conn, mut device) = FakeDevice::pair();
        let c = conn.clone();
        let open = tokio::spawn(async move {
            let a = c.request_channel("com.example.service", None).await.unwrap();
            let b = c.request_channel("com.example.service", None).await.unwrap();
            (a.code(), b.code())
        });
        let req = device.answer(None).await;
        assert_eq!(req.selector(), Some(REQUEST_CHANNEL));
        assert_eq!(req.message_header.channel, ROOT_CHANNEL);
        let args = req.arguments().unwrap();
        assert_eq!(args[0], Value::Integer(1u64.into()));
        assert_eq!(args[1], Value::String("com.example.service".into()));

        assert_eq!(open.await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_read_failure_fails_pending_calls() {
        let (conn, mut device) = FakeDevice::pair();
        let c = conn.clone();
        let call = tokio::spawn(async move { c.method_call(1, "x", Vec::new(), DEFAULT_TIMEOUT).await });
        device.read().await;
        // Garbage where a header should be
        device.stream.write_all(&[0u8; 32]).await.unwrap();
        assert!(matches!(
            call.await.unwrap(),
            Err(ImuxError::ConnectionClosed)
        ));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.method_call_async(1, "y", Vec::new()).await,
            Err(ImuxError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_identifiers_skip_past_device_ones() {
        let (conn, mut device) = FakeDevice::pair();
        let id = device.call(5, "_channelCanceled:", false).await;
        // Give the read loop a moment to see the device call
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.method_call_async(5, "after", Vec::new()).await.unwrap();
        let msg = device.read().await;
        assert_eq!(msg.selector(), Some("after"));
        assert_eq!(msg.message_header.identifier, id + 1);
    }

    #[tokio::test]
    async fn test_dropping_every_handle_closes_the_stream() {
        use tokio::io::AsyncReadExt;

        let (conn, mut device) = FakeDevice::pair();
        let channel = conn.root_channel();
        drop(conn);

        // A channel still keeps the connection up
        channel.method_call_async("ping", Vec::new()).await.unwrap();
        assert_eq!(device.read().await.selector(), Some("ping"));

        drop(channel);
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), device.stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_handshake_exchanges_capabilities() {
        let (conn, mut device) = FakeDevice::pair();
        let handshake = tokio::spawn(async move { conn.perform_handshake().await });
        let ours = device.read().await;
        assert_eq!(ours.selector(), Some(PUBLISH_CAPABILITIES));
        assert!(!ours.message_header.expects_reply);

        let mut caps = plist::Dictionary::new();
        caps.insert("com.apple.private.DTXConnection".into(), Value::Integer(1u64.into()));
        let theirs = invocation(
            1,
            ROOT_CHANNEL,
            PUBLISH_CAPABILITIES,
            vec![AuxValue::archived_value(Value::Dictionary(caps.clone())).unwrap()],
            false,
        );
        device.send(&theirs).await;

        assert_eq!(handshake.await.unwrap().unwrap(), caps);
    }
}
