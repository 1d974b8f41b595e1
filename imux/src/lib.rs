//! usbmux, lockdown and DTX protocol stack for iOS devices
//!
//! The crate is layered the same way the device protocols are:
//! - [`plist_codec`] frames length-prefixed property lists
//! - [`DeviceConnection`] owns a duplex stream and can swap TLS in and out mid-stream
//! - [`usbmuxd`] speaks the muxer protocol (list, listen, connect, pair records)
//! - [`services::lockdown`] starts sessions and services, with the passive SSL state machine
//! - [`registry`] tracks attached devices and their cancellation tokens
//! - [`services::dvt`] implements DTX channels on top of a service stream
//! - [`proxy`] relays muxer clients to a real or remote muxer

pub mod pairing_file;
pub mod plist_codec;
pub mod provider;
mod socket;
mod tls;
#[cfg(feature = "usbmuxd")]
pub mod usbmuxd;
mod util;

#[cfg(feature = "usbmuxd")]
pub mod monitor;
#[cfg(feature = "proxy")]
pub mod proxy;
#[cfg(feature = "usbmuxd")]
pub mod registry;

pub mod services;
pub use services::*;

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};

use socket::{Rewind, Socket};

pub use util::{pretty_print_dictionary, pretty_print_plist};

#[cfg(not(any(feature = "aws-lc", feature = "ring")))]
compile_error!("either the `aws-lc` or the `ring` feature must be enabled");

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream, UnixStream and DuplexStream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Interface for services that can be connected to on an iOS device
pub trait DeviceService: Sized {
    /// Returns the service name as advertised by lockdown
    fn service_name() -> &'static str;

    /// Establishes a connection to this service
    ///
    /// # Arguments
    /// * `provider` - The device provider that can supply connections
    fn connect(
        provider: &dyn provider::DeviceProvider,
    ) -> impl std::future::Future<Output = Result<Self, ImuxError>> + Send;
}

/// Main handle for one duplex stream to a muxer, a device service or a proxy client
///
/// Reads go through an internal buffer. When the stream is upgraded to TLS, whatever
/// is left in that buffer is replayed underneath the TLS layer so nothing read ahead
/// of the handshake is lost.
pub struct DeviceConnection {
    socket: Option<Socket>,
    read_buf: BytesMut,
    /// Label sent with lockdown requests
    label: String,
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("socket", &self.socket)
            .field("buffered", &self.read_buf.len())
            .field("label", &self.label)
            .finish()
    }
}

impl DeviceConnection {
    /// Creates a new connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Identifier sent along with lockdown requests
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(Socket::Plain(socket)),
            read_buf: BytesMut::with_capacity(8 * 1024),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the stream is currently wrapped in TLS
    pub fn is_tls(&self) -> bool {
        matches!(
            self.socket,
            Some(Socket::TlsClient(_)) | Some(Socket::TlsServer(_))
        )
    }

    /// Sends an XML plist with a 4-byte big-endian length prefix
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), ImuxError> {
        debug!("Sending plist: {}", pretty_print_plist(&message));
        let frame = plist_codec::PlistCodec::encode(&message)?;
        self.send_raw(&frame).await
    }

    /// Sends a binary plist with a 4-byte big-endian length prefix
    pub async fn send_bplist(&mut self, message: plist::Value) -> Result<(), ImuxError> {
        debug!("Sending bplist: {}", pretty_print_plist(&message));
        let frame = plist_codec::PlistCodec::encode_binary(&message)?;
        self.send_raw(&frame).await
    }

    /// Writes raw bytes and flushes
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), ImuxError> {
        match &mut self.socket {
            Some(socket) => {
                trace!("Writing {} bytes", message.len());
                socket.write_all(message).await?;
                socket.flush().await?;
                Ok(())
            }
            None => Err(ImuxError::NoEstablishedConnection),
        }
    }

    /// Reads exactly `len` bytes
    ///
    /// # Errors
    /// `ConnectionClosed` if the peer closed before any byte arrived,
    /// `FramingError` if it closed part way through.
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, ImuxError> {
        self.fill(len).await?;
        Ok(self.read_buf.split_to(len).to_vec())
    }

    /// Reads up to `max_size` bytes, returning an empty vector on EOF
    pub async fn read_any(&mut self, max_size: u32) -> Result<Vec<u8>, ImuxError> {
        if self.read_buf.is_empty() {
            let socket = self
                .socket
                .as_mut()
                .ok_or(ImuxError::NoEstablishedConnection)?;
            let n = socket.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(Vec::new());
            }
        }
        let len = self.read_buf.len().min(max_size as usize);
        Ok(self.read_buf.split_to(len).to_vec())
    }

    /// Reads one length-prefixed plist frame and returns the raw plist bytes
    ///
    /// Buffered read-ahead is consumed first, so frames that arrived before a TLS
    /// switch are not lost.
    pub async fn read_plist_raw(&mut self) -> Result<Vec<u8>, ImuxError> {
        if self.socket.is_none() {
            return Err(ImuxError::NoEstablishedConnection);
        }
        plist_codec::PlistCodec::decode(self).await
    }

    /// Reads a plist dictionary, mapping a device `Error` field to a typed error
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, ImuxError> {
        let res = self.read_plist_unchecked().await?;
        if let Some(e) = res.get("Error").and_then(|e| e.as_string()) {
            return Err(ImuxError::from_device_error_type(e, &res)
                .unwrap_or_else(|| ImuxError::UnknownErrorType(e.to_string())));
        }
        Ok(res)
    }

    /// Reads a plist dictionary without interpreting an `Error` field
    pub async fn read_plist_unchecked(&mut self) -> Result<plist::Dictionary, ImuxError> {
        let raw = self.read_plist_raw().await?;
        let res = plist_codec::PlistCodec::decode_dictionary(&raw)?;
        debug!("Received plist: {}", pretty_print_dictionary(&res));
        Ok(res)
    }

    /// Buffers until at least `len` bytes are available
    async fn fill(&mut self, len: usize) -> Result<(), ImuxError> {
        while self.read_buf.len() < len {
            let socket = self
                .socket
                .as_mut()
                .ok_or(ImuxError::NoEstablishedConnection)?;
            self.read_buf.reserve(len - self.read_buf.len());
            let n = socket.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(if self.read_buf.is_empty() {
                    ImuxError::ConnectionClosed
                } else {
                    ImuxError::FramingError(format!(
                        "stream closed with {} of {len} bytes",
                        self.read_buf.len()
                    ))
                });
            }
        }
        Ok(())
    }

    /// Takes the plain socket out for a TLS upgrade, along with any read-ahead bytes
    fn take_plain(&mut self) -> Result<Rewind, ImuxError> {
        match self.socket.take() {
            Some(Socket::Plain(inner)) => {
                let prefix = self.read_buf.split().freeze();
                if !prefix.is_empty() {
                    debug!("Replaying {} buffered bytes into TLS", prefix.len());
                }
                Ok(Rewind::new(prefix, inner))
            }
            Some(other) => {
                self.socket = Some(other);
                Err(ImuxError::ProtocolViolation(
                    "TLS requested on a connection that is already encrypted".into(),
                ))
            }
            None => Err(ImuxError::NoEstablishedConnection),
        }
    }

    /// Upgrades the connection to client-mode TLS using the host half of the pair record
    ///
    /// # Errors
    /// Returns `ImuxError` if the handshake fails or the pair record key is malformed
    pub async fn start_session(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), ImuxError> {
        let stream = self.client_handshake(pairing_file).await?;
        self.socket = Some(Socket::TlsClient(Box::new(stream)));
        Ok(())
    }

    /// Performs a client-mode TLS handshake, then returns to plaintext
    ///
    /// Some services only use TLS to authenticate the host.
    pub async fn start_session_handshake_only(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), ImuxError> {
        let stream = self.client_handshake(pairing_file).await?;
        let (io, _) = stream.into_inner();
        self.socket = Some(Socket::Plain(Box::new(io)));
        Ok(())
    }

    /// Upgrades the connection to server-mode TLS, presenting the host certificate
    ///
    /// Used when standing in for the device toward a connecting client.
    pub async fn start_server_session(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), ImuxError> {
        let stream = self.server_handshake(pairing_file).await?;
        self.socket = Some(Socket::TlsServer(Box::new(stream)));
        Ok(())
    }

    /// Performs a server-mode TLS handshake, then returns to plaintext
    pub async fn start_server_session_handshake_only(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), ImuxError> {
        let stream = self.server_handshake(pairing_file).await?;
        let (io, _) = stream.into_inner();
        self.socket = Some(Socket::Plain(Box::new(io)));
        Ok(())
    }

    /// Drops the TLS layer and continues in plaintext on the same stream
    pub fn stop_session(&mut self) -> Result<(), ImuxError> {
        let plain = match self.socket.take() {
            Some(Socket::TlsClient(s)) => {
                let (io, _) = s.into_inner();
                Socket::Plain(Box::new(io))
            }
            Some(Socket::TlsServer(s)) => {
                let (io, _) = s.into_inner();
                Socket::Plain(Box::new(io))
            }
            Some(plain) => plain,
            None => return Err(ImuxError::NoEstablishedConnection),
        };
        self.socket = Some(plain);
        Ok(())
    }

    async fn client_handshake(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<tokio_rustls::client::TlsStream<Rewind>, ImuxError> {
        tls::ensure_crypto_provider();
        let config = tls::create_client_config(pairing_file)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let io = self.take_plain()?;
        let server_name = ServerName::try_from("Device")
            .map_err(|e| ImuxError::InternalError(format!("invalid server name: {e}")))?;
        Ok(connector.connect(server_name, io).await?)
    }

    async fn server_handshake(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<tokio_rustls::server::TlsStream<Rewind>, ImuxError> {
        tls::ensure_crypto_provider();
        let config = tls::create_server_config(pairing_file)?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
        let io = self.take_plain()?;
        Ok(acceptor.accept(io).await?)
    }

    /// Shuts down the write half and drops the stream
    pub async fn close(&mut self) -> Result<(), ImuxError> {
        if let Some(mut socket) = self.socket.take() {
            socket.shutdown().await?;
        }
        self.read_buf.clear();
        Ok(())
    }
}

impl AsyncRead for DeviceConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.read_buf.is_empty() {
            let n = this.read_buf.len().min(buf.remaining());
            buf.put_slice(&this.read_buf[..n]);
            this.read_buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        match this.socket.as_mut() {
            Some(socket) => Pin::new(socket).poll_read(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }
}

impl AsyncWrite for DeviceConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.socket.as_mut() {
            Some(socket) => Pin::new(socket).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.socket.as_mut() {
            Some(socket) => Pin::new(socket).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.socket.as_mut() {
            Some(socket) => Pin::new(socket).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Comprehensive error type for all protocol failures
#[derive(Error, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum ImuxError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error) = -1,
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error) = -2,
    #[error("TLS error")]
    Rustls(#[from] rustls::Error) = -3,
    #[error("io on plist")]
    Plist(#[from] plist::Error) = -4,
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error) = -5,
    #[error("unexpected response from device")]
    UnexpectedResponse = -6,
    #[error("this request was prohibited")]
    GetProhibited = -7,
    #[error("no SSL session is active")]
    SessionInactive = -8,
    #[error("device does not have pairing file")]
    InvalidHostID = -9,
    #[error("no established connection")]
    NoEstablishedConnection = -10,
    #[error("not found")]
    NotFound = -11,
    #[error("service not found")]
    ServiceNotFound = -12,
    #[error("device not found")]
    DeviceNotFound = -13,
    #[error("device locked")]
    DeviceLocked = -14,

    #[error("device refused connection")]
    UsbConnectionRefused = -15,
    #[error("bad command")]
    UsbBadCommand = -16,
    #[error("bad device")]
    UsbBadDevice = -17,
    #[error("usb bad version")]
    UsbBadVersion = -18,

    #[error("internal error")]
    InternalError(String) = -19,
    #[error("cannot parse string as IpAddr")]
    AddrParseError(#[from] std::net::AddrParseError) = -20,
    #[error("not enough bytes, expected {1}, got {0}")]
    NotEnoughBytes(usize, usize) = -21,
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String) = -22,

    #[error("framing error: {0}")]
    FramingError(String) = -23,
    #[error("connection closed by peer")]
    ConnectionClosed = -24,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String) = -25,
    #[error("unexpected message type `{0}`")]
    UnexpectedMessageType(String) = -26,
    #[error("device unreachable: {0}")]
    DeviceUnreachable(String) = -27,
    #[error("timed out waiting for reply")]
    Timeout = -28,
    #[error("invalid argument passed")]
    InvalidArgument = -35,

    #[cfg(feature = "dvt")]
    #[error("NSKeyedArchive error")]
    NsKeyedArchiveError(#[from] ns_keyed_archive::ConverterError) = -29,
    #[cfg(feature = "dvt")]
    #[error("NSKeyedArchive encode failed: {0}")]
    NsKeyedArchiveEncode(String) = -30,
    #[cfg(feature = "dvt")]
    #[error("Unknown aux value type")]
    UnknownAuxValueType(u32) = -31,
    #[cfg(feature = "dvt")]
    #[error("unknown channel")]
    UnknownChannel(u32) = -32,
    #[cfg(feature = "dvt")]
    #[error("disable memory limit failed")]
    DisableMemoryLimitFailed = -33,
    #[cfg(feature = "dvt")]
    #[error("remote returned an error: {0}")]
    DtxRemoteError(String) = -34,
}

impl ImuxError {
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" | "PasswordProtected" => Some(Self::DeviceLocked),
            "InvalidService" => Some(Self::ServiceNotFound),
            "InternalError" => {
                let detailed_error = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();
                Some(Self::InternalError(detailed_error))
            }
            _ => None,
        }
    }

    /// Maps a usbmux result `Number` to an error, `None` meaning success
    pub fn from_usbmux_result(number: u64) -> Option<Self> {
        match number {
            0 => None,
            1 => Some(Self::UsbBadCommand),
            2 => Some(Self::UsbBadDevice),
            3 => Some(Self::UsbConnectionRefused),
            6 => Some(Self::UsbBadVersion),
            _ => Some(Self::UnexpectedResponse),
        }
    }

    /// Whether the error means the peer went away rather than misbehaved
    pub fn is_closed(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Socket(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ImuxError::Socket(_) => -1,
            ImuxError::PemParseFailed(_) => -2,
            ImuxError::Rustls(_) => -3,
            ImuxError::Plist(_) => -4,
            ImuxError::Utf8(_) => -5,
            ImuxError::UnexpectedResponse => -6,
            ImuxError::GetProhibited => -7,
            ImuxError::SessionInactive => -8,
            ImuxError::InvalidHostID => -9,
            ImuxError::NoEstablishedConnection => -10,
            ImuxError::NotFound => -11,
            ImuxError::ServiceNotFound => -12,
            ImuxError::DeviceNotFound => -13,
            ImuxError::DeviceLocked => -14,
            ImuxError::UsbConnectionRefused => -15,
            ImuxError::UsbBadCommand => -16,
            ImuxError::UsbBadDevice => -17,
            ImuxError::UsbBadVersion => -18,
            ImuxError::InternalError(_) => -19,
            ImuxError::AddrParseError(_) => -20,
            ImuxError::NotEnoughBytes(_, _) => -21,
            ImuxError::UnknownErrorType(_) => -22,
            ImuxError::FramingError(_) => -23,
            ImuxError::ConnectionClosed => -24,
            ImuxError::ProtocolViolation(_) => -25,
            ImuxError::UnexpectedMessageType(_) => -26,
            ImuxError::DeviceUnreachable(_) => -27,
            ImuxError::Timeout => -28,
            ImuxError::InvalidArgument => -35,

            #[cfg(feature = "dvt")]
            ImuxError::NsKeyedArchiveError(_) => -29,
            #[cfg(feature = "dvt")]
            ImuxError::NsKeyedArchiveEncode(_) => -30,
            #[cfg(feature = "dvt")]
            ImuxError::UnknownAuxValueType(_) => -31,
            #[cfg(feature = "dvt")]
            ImuxError::UnknownChannel(_) => -32,
            #[cfg(feature = "dvt")]
            ImuxError::DisableMemoryLimitFailed => -33,
            #[cfg(feature = "dvt")]
            ImuxError::DtxRemoteError(_) => -34,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: &[(&str, &str)]) -> plist::Value {
        let mut d = plist::Dictionary::new();
        for (k, v) in pairs {
            d.insert((*k).into(), (*v).into());
        }
        plist::Value::Dictionary(d)
    }

    #[tokio::test]
    async fn test_read_ahead_frames_are_not_lost() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut conn = DeviceConnection::new(Box::new(a), "test");

        let mut both = plist_codec::PlistCodec::encode(&dict(&[("Request", "One")])).unwrap();
        both.extend(plist_codec::PlistCodec::encode(&dict(&[("Request", "Two")])).unwrap());
        b.write_all(&both).await.unwrap();

        let first = conn.read_plist().await.unwrap();
        assert_eq!(first.get("Request").and_then(|v| v.as_string()), Some("One"));
        let second = conn.read_plist().await.unwrap();
        assert_eq!(second.get("Request").and_then(|v| v.as_string()), Some("Two"));
    }

    #[tokio::test]
    async fn test_device_error_is_typed() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut conn = DeviceConnection::new(Box::new(a), "test");
        let frame = plist_codec::PlistCodec::encode(&dict(&[("Error", "InvalidHostID")])).unwrap();
        b.write_all(&frame).await.unwrap();

        assert!(matches!(
            conn.read_plist().await,
            Err(ImuxError::InvalidHostID)
        ));
    }

    #[tokio::test]
    async fn test_eof_between_frames_is_connection_closed() {
        let (a, b) = tokio::io::duplex(64);
        let mut conn = DeviceConnection::new(Box::new(a), "test");
        drop(b);
        let err = conn.read_plist().await.unwrap_err();
        assert!(matches!(err, ImuxError::ConnectionClosed));
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_frame_limits_follow_the_codec() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = DeviceConnection::new(Box::new(a), "test");
        let too_long = (plist_codec::MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        b.write_all(&too_long).await.unwrap();
        assert!(matches!(
            conn.read_plist().await,
            Err(ImuxError::FramingError(_))
        ));

        // Closing inside the length prefix is a broken frame, not a clean close
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = DeviceConnection::new(Box::new(a), "test");
        b.write_all(&[0, 0]).await.unwrap();
        drop(b);
        assert!(matches!(
            conn.read_plist().await,
            Err(ImuxError::FramingError(_))
        ));
    }

    #[tokio::test]
    async fn test_tls_session_between_client_and_server_modes() {
        let pairing_file = test_util::test_pairing_file();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = DeviceConnection::new(Box::new(a), "client");
        let mut server = DeviceConnection::new(Box::new(b), "server");

        // Plain request/response, then both sides flip to TLS
        client.send_plist(dict(&[("Request", "StartSession")])).await.unwrap();
        let req = server.read_plist().await.unwrap();
        assert_eq!(req.get("Request").and_then(|v| v.as_string()), Some("StartSession"));

        let mut res = plist::Dictionary::new();
        res.insert("EnableSessionSSL".into(), true.into());
        server.send_plist(plist::Value::Dictionary(res)).await.unwrap();
        let res = client.read_plist().await.unwrap();
        assert_eq!(res.get("EnableSessionSSL").and_then(|v| v.as_boolean()), Some(true));

        let server_pf = pairing_file.clone();
        let server_task = tokio::spawn(async move {
            server.start_server_session(&server_pf).await.unwrap();
            let req = server.read_plist().await.unwrap();
            server.send_plist(plist::Value::Dictionary(req)).await.unwrap();
            server
        });

        client.start_session(&pairing_file).await.unwrap();
        assert!(client.is_tls());
        client.send_plist(dict(&[("Request", "GetValue")])).await.unwrap();
        let echoed = client.read_plist().await.unwrap();
        assert_eq!(echoed.get("Request").and_then(|v| v.as_string()), Some("GetValue"));

        let server = server_task.await.unwrap();
        assert!(server.is_tls());
    }

    #[tokio::test]
    async fn test_handshake_only_returns_to_plaintext() {
        let pairing_file = test_util::test_pairing_file();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = DeviceConnection::new(Box::new(a), "client");
        let mut server = DeviceConnection::new(Box::new(b), "server");

        let server_pf = pairing_file.clone();
        let server_task = tokio::spawn(async move {
            server
                .start_server_session_handshake_only(&server_pf)
                .await
                .unwrap();
            server.send_raw(b"ready").await.unwrap();
            server.read_raw(5).await.unwrap()
        });

        client
            .start_session_handshake_only(&pairing_file)
            .await
            .unwrap();
        assert!(!client.is_tls());
        assert_eq!(client.read_raw(5).await.unwrap(), b"ready");
        client.send_raw(b"plain").await.unwrap();

        assert_eq!(server_task.await.unwrap(), b"plain");
    }
}
