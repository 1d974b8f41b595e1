//! USB Multiplexing Daemon (usbmuxd) Client
//!
//! Provides functionality for interacting with the muxer, which shares one physical
//! USB or network transport among many logical per-service connections and stores
//! pair records.

use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    pin::Pin,
    str::FromStr,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use futures::Stream;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{
    DeviceConnection, ImuxError, ReadWrite, pairing_file::PairingFile, provider::UsbmuxdProvider,
    services::lockdown::LockdownClient,
};

mod des;
mod raw_packet;

pub use des::{DeviceEntry, DeviceProperties};
pub use raw_packet::{HEADER_LEN, UsbmuxHeader, UsbmuxMessage};

/// Represents the connection type of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Connected via USB
    Usb,
    /// Connected via network with specific IP address
    Network(IpAddr),
    /// Unknown connection type with description
    Unknown(String),
}

/// Events pushed by the muxer after a successful `Listen`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenEvent {
    Attached(DeviceEntry),
    Detached { device_id: u32 },
    Paired { device_id: u32 },
}

/// Active connection to the muxer
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

impl std::fmt::Debug for UsbmuxdConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbmuxdConnection")
            .field("tag", &self.tag)
            .finish()
    }
}

/// Address of the muxer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsbmuxdAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    /// TCP socket address
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    /// Default TCP port for usbmuxd
    pub const DEFAULT_PORT: u16 = 27015;
    /// Default Unix socket path for usbmuxd
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";
    /// Environment variable overriding the muxer address
    pub const ENV_VAR: &'static str = "USBMUXD_SOCKET_ADDRESS";

    /// Connects to the muxer
    ///
    /// # Errors
    /// `DeviceUnreachable` if the socket cannot be opened
    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, ImuxError> {
        let res: Result<Box<dyn ReadWrite>, std::io::Error> = match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => tokio::net::UnixStream::connect(addr)
                .await
                .map(|s| Box::new(s) as Box<dyn ReadWrite>),
            Self::TcpSocket(addr) => tokio::net::TcpStream::connect(addr)
                .await
                .map(|s| Box::new(s) as Box<dyn ReadWrite>),
        };
        res.map_err(|e| ImuxError::DeviceUnreachable(format!("muxer at {self}: {e}")))
    }

    /// Creates a new muxer connection
    ///
    /// # Arguments
    /// * `tag` - First tag this connection will use
    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, ImuxError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Parses `host:port` as TCP, anything else as a unix socket path
    ///
    /// A leading `unix:` or `tcp:` scheme is accepted and stripped.
    pub fn parse(var: &str) -> Result<Self, AddrParseError> {
        if let Some(tcp) = var.strip_prefix("tcp:") {
            return Ok(Self::TcpSocket(SocketAddr::from_str(tcp)?));
        }
        #[cfg(unix)]
        {
            if let Some(path) = var.strip_prefix("unix:") {
                return Ok(Self::UnixSocket(path.to_string()));
            }
            if var.contains(':') {
                Ok(Self::TcpSocket(SocketAddr::from_str(var)?))
            } else {
                Ok(Self::UnixSocket(var.to_string()))
            }
        }
        #[cfg(not(unix))]
        Ok(Self::TcpSocket(SocketAddr::from_str(var)?))
    }

    /// Creates a UsbmuxdAddr from `USBMUXD_SOCKET_ADDRESS`, falling back to the default
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        match std::env::var(Self::ENV_VAR) {
            Ok(var) => Self::parse(&var),
            Err(_) => Ok(Self::default()),
        }
    }
}

impl std::fmt::Display for UsbmuxdAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            Self::UnixSocket(p) => write!(f, "unix:{p}"),
            Self::TcpSocket(a) => write!(f, "tcp:{a}"),
        }
    }
}

impl Default for UsbmuxdAddr {
    /// Creates default usbmuxd address based on platform:
    /// - Unix: Uses default socket path
    /// - Non-Unix: Uses localhost TCP port
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// Checks the `Number` of a `Result` reply
pub(crate) fn check_result(res: &plist::Dictionary) -> Result<(), ImuxError> {
    match res.get("Number").and_then(|x| x.as_unsigned_integer()) {
        Some(n) => match ImuxError::from_usbmux_result(n) {
            None => Ok(()),
            Some(e) => Err(e),
        },
        None => Err(ImuxError::UnexpectedResponse),
    }
}

impl UsbmuxdConnection {
    /// Binary PLIST protocol version
    pub const BINARY_PLIST_VERSION: u32 = 0;
    /// XML PLIST protocol version
    pub const XML_PLIST_VERSION: u32 = 1;

    /// Result message type
    pub const RESULT_MESSAGE_TYPE: u32 = 1;
    /// PLIST message type
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    const CLIENT_VERSION: &'static str = "imux";

    /// Connects to the muxer at its default or environment-configured address
    pub async fn default() -> Result<Self, ImuxError> {
        let addr = UsbmuxdAddr::from_env_var()?;
        addr.connect(0).await
    }

    /// Creates a new muxer connection
    ///
    /// # Arguments
    /// * `socket` - The transport stream
    /// * `tag` - First tag this connection will use
    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self { socket, tag }
    }

    /// Gives back the raw socket, e.g. to relay it after a proxied `Connect`
    pub fn into_inner(self) -> Box<dyn ReadWrite> {
        self.socket
    }

    /// Lists all connected devices
    pub async fn get_devices(&mut self) -> Result<Vec<DeviceEntry>, ImuxError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        req.insert("ClientVersionString".into(), Self::CLIENT_VERSION.into());
        req.insert("ProgName".into(), Self::CLIENT_VERSION.into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        let res = plist::from_value::<des::ListDevicesResponse>(&plist::Value::Dictionary(res))?;
        Ok(res.device_list)
    }

    /// Gets a specific device by serial number
    ///
    /// # Errors
    /// `DeviceNotFound` if no attached device has that serial
    pub async fn get_device(&mut self, udid: &str) -> Result<DeviceEntry, ImuxError> {
        let devices = self.get_devices().await?;
        match devices.into_iter().find(|x| x.serial() == udid) {
            Some(d) => Ok(d),
            None => Err(ImuxError::DeviceNotFound),
        }
    }

    /// Reads the raw pair record plist for a device
    pub async fn get_pair_record_raw(&mut self, udid: &str) -> Result<Vec<u8>, ImuxError> {
        debug!("Getting pair record for {udid}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let mut res = self.read_plist().await?;

        match res.remove("PairRecordData") {
            Some(plist::Value::Data(d)) => Ok(d),
            _ => {
                check_result(&res)?;
                Err(ImuxError::UnexpectedResponse)
            }
        }
    }

    /// Gets the pair record for a device
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairingFile, ImuxError> {
        let raw = self.get_pair_record_raw(udid).await?;
        PairingFile::from_bytes(&raw)
    }

    /// Gets the muxer's BUID
    pub async fn get_buid(&mut self) -> Result<String, ImuxError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        self.write_plist(req).await?;
        let mut res = self.read_plist().await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(ImuxError::UnexpectedResponse),
        }
    }

    /// Tells the muxer to save a pair record in its storage
    ///
    /// # Arguments
    /// * `device_id` - muxer device ID
    /// * `udid` - the device serial, used as the record ID
    /// * `pair_record` - a serialized plist of the pair record
    pub async fn save_pair_record(
        &mut self,
        device_id: u32,
        udid: &str,
        pair_record: Vec<u8>,
    ) -> Result<(), ImuxError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "SavePairRecord".into());
        req.insert("PairRecordData".into(), plist::Value::Data(pair_record));
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        check_result(&self.read_plist().await?)
    }

    pub async fn delete_pair_record(&mut self, udid: &str) -> Result<(), ImuxError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "DeletePairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        check_result(&self.read_plist().await?)
    }

    /// Lists the clients currently listening on the muxer
    pub async fn list_listeners(&mut self) -> Result<Vec<plist::Dictionary>, ImuxError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListListeners".into());
        self.write_plist(req).await?;
        let mut res = self.read_plist().await?;
        match res.remove("ListenerList") {
            Some(plist::Value::Array(a)) => Ok(a
                .into_iter()
                .filter_map(|v| v.into_dictionary())
                .collect()),
            _ => Err(ImuxError::UnexpectedResponse),
        }
    }

    /// Opens a tunnel to a port on the device
    ///
    /// The muxer connection is spent afterwards, every further byte belongs to the
    /// device service.
    ///
    /// # Arguments
    /// * `device_id` - muxer device ID
    /// * `port` - TCP port on the device (host byte order)
    /// * `label` - Connection label
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<DeviceConnection, ImuxError> {
        debug!("Connecting to device {device_id} on port {port}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), port.to_be().into());
        self.write_plist(req).await?;
        check_result(&self.read_plist().await?)?;
        Ok(DeviceConnection::new(self.socket, label))
    }

    /// Opens a tunnel to the lockdown port
    pub async fn connect_lockdown(
        self,
        device_id: u32,
        label: impl Into<String>,
    ) -> Result<LockdownClient, ImuxError> {
        let conn = self
            .connect_to_device(device_id, LockdownClient::LOCKDOWND_PORT, label)
            .await?;
        Ok(LockdownClient::new(conn))
    }

    /// Starts listening for device events
    ///
    /// The connection is dedicated to the event stream from here on. The stream ends
    /// after the first error; an unrecognised message type is reported as
    /// `UnexpectedMessageType` rather than skipped.
    pub async fn listen(
        mut self,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<ListenEvent, ImuxError>> + Send>>, ImuxError>
    {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Listen".into());
        req.insert("ClientVersionString".into(), Self::CLIENT_VERSION.into());
        req.insert("ProgName".into(), Self::CLIENT_VERSION.into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        self.write_plist(req).await?;
        check_result(&self.read_plist().await?)?;

        let stream = futures::stream::try_unfold(self, |mut conn| async move {
            let msg = conn.read_plist().await?;
            let event = Self::parse_event(msg)?;
            Ok(Some((event, conn)))
        });
        Ok(Box::pin(stream))
    }

    fn parse_event(msg: plist::Dictionary) -> Result<ListenEvent, ImuxError> {
        let message_type = match msg.get("MessageType").and_then(|v| v.as_string()) {
            Some(m) => m.to_string(),
            None => {
                warn!("Received malformed message during listen (no MessageType)");
                return Err(ImuxError::UnexpectedMessageType(String::new()));
            }
        };
        let device_id = msg
            .get("DeviceID")
            .and_then(|v| v.as_unsigned_integer())
            .map(|v| v as u32);

        match (message_type.as_str(), device_id) {
            ("Attached", _) => {
                let entry: DeviceEntry = plist::from_value(&plist::Value::Dictionary(msg))?;
                Ok(ListenEvent::Attached(entry))
            }
            ("Detached", Some(device_id)) => Ok(ListenEvent::Detached { device_id }),
            ("Paired", Some(device_id)) => Ok(ListenEvent::Paired { device_id }),
            ("Detached", None) | ("Paired", None) => {
                warn!("{message_type} event without a DeviceID");
                Err(ImuxError::UnexpectedResponse)
            }
            _ => {
                warn!("Received unexpected message type during listen: {message_type}");
                Err(ImuxError::UnexpectedMessageType(message_type))
            }
        }
    }

    /// Writes an already framed message verbatim, tag included
    pub async fn send_message(&mut self, message: &UsbmuxMessage) -> Result<(), ImuxError> {
        self.socket.write_all(&message.encode()).await?;
        self.socket.flush().await?;
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<UsbmuxMessage, ImuxError> {
        UsbmuxMessage::read_from(&mut self.socket).await
    }

    /// Writes a PLIST message to the muxer with the next tag
    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), ImuxError> {
        self.tag = self.tag.wrapping_add(1);
        debug!(
            "Writing to muxer (tag {}): {}",
            self.tag,
            crate::pretty_print_dictionary(&req)
        );
        let message = UsbmuxMessage::new(
            req,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        )?;
        self.send_message(&message).await
    }

    /// Reads a PLIST message from the muxer
    async fn read_plist(&mut self) -> Result<plist::Dictionary, ImuxError> {
        let message = self.read_message().await?;
        if message.header.tag != 0 && message.header.tag != self.tag {
            warn!(
                "Muxer replied with tag {} while {} was outstanding",
                message.header.tag, self.tag
            );
        }
        let res = message.plist()?;
        debug!("Read from muxer: {}", crate::pretty_print_dictionary(&res));
        Ok(res)
    }
}

impl DeviceEntry {
    /// Creates a provider for this device
    ///
    /// # Arguments
    /// * `addr` - muxer address
    /// * `label` - Connection label
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: self.device_id,
            udid: self.serial().to_string(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_entry(device_id: u32, serial: &str) -> DeviceEntry {
    DeviceEntry {
        device_id,
        properties: DeviceProperties {
            connection_speed: Some(480_000_000),
            connection_type: "USB".into(),
            device_id: Some(device_id),
            location_id: Some(0x14100000),
            product_id: Some(0x12a8),
            serial_number: serial.into(),
            usb_serial_number: None,
            network_address: None,
            escaped_full_service_name: None,
            interface_index: None,
        },
    }
}

/// Helpers for playing the muxer side of a connection in tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    pub async fn read_request<R: tokio::io::AsyncRead + Unpin>(
        server: &mut R,
    ) -> (UsbmuxMessage, plist::Dictionary) {
        let msg = UsbmuxMessage::read_from(server).await.unwrap();
        let dict = msg.plist().unwrap();
        (msg, dict)
    }

    pub async fn reply<W: tokio::io::AsyncWrite + Unpin>(
        server: &mut W,
        tag: u32,
        dict: plist::Dictionary,
    ) {
        let msg = UsbmuxMessage::new(dict, 1, 8, tag).unwrap();
        server.write_all(&msg.encode()).await.unwrap();
    }

    pub fn result(number: u64) -> plist::Dictionary {
        let mut d = plist::Dictionary::new();
        d.insert("MessageType".into(), "Result".into());
        d.insert("Number".into(), number.into());
        d
    }

    pub fn attached(entry: &DeviceEntry) -> plist::Dictionary {
        let mut d = entry.to_dictionary().unwrap();
        d.insert("MessageType".into(), "Attached".into());
        d
    }

    pub fn event(kind: &str, device_id: u32) -> plist::Dictionary {
        let mut d = plist::Dictionary::new();
        d.insert("MessageType".into(), kind.into());
        d.insert("DeviceID".into(), device_id.into());
        d
    }
}
