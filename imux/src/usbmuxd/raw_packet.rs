// usbmux envelope: a 16-byte little-endian header followed by a plist payload

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ImuxError;

pub const HEADER_LEN: usize = 16;
/// Upper bound on a declared usbmux packet, pair records are the largest payloads seen
pub const MAX_PACKET_LEN: u32 = 4 * 1024 * 1024;

/// The fixed header in wire order: length, version, message, tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbmuxHeader {
    /// Total packet length including this header
    pub length: u32,
    /// 1 for XML plist payloads, 0 for binary
    pub version: u32,
    /// 8 for plist messages
    pub message: u32,
    /// Request correlation tag, echoed in the reply
    pub tag: u32,
}

impl UsbmuxHeader {
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Result<Self, ImuxError> {
        let header = Self {
            length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            version: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            message: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            tag: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        };
        if (header.length as usize) < HEADER_LEN || header.length > MAX_PACKET_LEN {
            return Err(ImuxError::FramingError(format!(
                "usbmux header declares length {}",
                header.length
            )));
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut res = [0u8; HEADER_LEN];
        res[0..4].copy_from_slice(&self.length.to_le_bytes());
        res[4..8].copy_from_slice(&self.version.to_le_bytes());
        res[8..12].copy_from_slice(&self.message.to_le_bytes());
        res[12..16].copy_from_slice(&self.tag.to_le_bytes());
        res
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsbmuxMessage {
    pub header: UsbmuxHeader,
    pub payload: Vec<u8>,
}

impl UsbmuxMessage {
    /// Builds an XML plist message
    pub fn new(
        payload: plist::Dictionary,
        version: u32,
        message: u32,
        tag: u32,
    ) -> Result<Self, ImuxError> {
        let mut body = Vec::new();
        plist::Value::Dictionary(payload).to_writer_xml(&mut body)?;
        Ok(Self {
            header: UsbmuxHeader {
                length: (body.len() + HEADER_LEN) as u32,
                version,
                message,
                tag,
            },
            payload: body,
        })
    }

    /// Replaces the payload, keeping version, message type and tag
    pub fn with_plist(&self, payload: plist::Dictionary) -> Result<Self, ImuxError> {
        Self::new(
            payload,
            self.header.version,
            self.header.message,
            self.header.tag,
        )
    }

    pub fn plist(&self) -> Result<plist::Dictionary, ImuxError> {
        Ok(plist::from_bytes(&self.payload)?)
    }

    /// The top-level `MessageType`, if the payload parses and carries one
    pub fn message_type(&self) -> Option<String> {
        self.plist()
            .ok()?
            .get("MessageType")
            .and_then(|v| v.as_string())
            .map(|s| s.to_string())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(HEADER_LEN + self.payload.len());
        res.extend_from_slice(&self.header.to_bytes());
        res.extend_from_slice(&self.payload);
        res
    }

    /// Reads one message
    ///
    /// # Errors
    /// `ConnectionClosed` on EOF before the header, `FramingError` on EOF inside a
    /// packet or on an impossible length
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ImuxError> {
        let mut header_buffer = [0u8; HEADER_LEN];
        let mut got = 0;
        while got < HEADER_LEN {
            let n = reader.read(&mut header_buffer[got..]).await?;
            if n == 0 {
                return Err(if got == 0 {
                    ImuxError::ConnectionClosed
                } else {
                    ImuxError::FramingError(format!("stream closed inside usbmux header ({got}/16)"))
                });
            }
            got += n;
        }
        let header = UsbmuxHeader::from_bytes(&header_buffer)?;

        let mut payload = vec![0u8; header.length as usize - HEADER_LEN];
        if let Err(e) = reader.read_exact(&mut payload).await {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => ImuxError::FramingError(format!(
                    "stream closed inside {} byte usbmux payload",
                    payload.len()
                )),
                _ => e.into(),
            });
        }
        Ok(Self { header, payload })
    }
}
