//! Length-prefixed property list framing
//!
//! Lockdown and every plist-speaking service frame messages as a 4-byte big-endian
//! length followed by that many bytes of XML or binary plist. Decoding only frames;
//! interpreting the payload is up to the caller.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ImuxError;

/// Upper bound on a single declared frame
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub struct PlistCodec;

impl PlistCodec {
    /// Encodes `value` as XML with its length prefix
    pub fn encode(value: &plist::Value) -> Result<Vec<u8>, ImuxError> {
        let mut body = Vec::new();
        value.to_writer_xml(&mut body)?;
        Ok(Self::frame(body))
    }

    /// Encodes `value` as a binary plist with its length prefix
    pub fn encode_binary(value: &plist::Value) -> Result<Vec<u8>, ImuxError> {
        let mut body = Vec::new();
        value.to_writer_binary(&mut body)?;
        Ok(Self::frame(body))
    }

    fn frame(body: Vec<u8>) -> Vec<u8> {
        let mut res = Vec::with_capacity(body.len() + 4);
        res.extend_from_slice(&(body.len() as u32).to_be_bytes());
        res.extend(body);
        res
    }

    /// Reads one frame and returns the raw plist bytes
    ///
    /// # Errors
    /// * `ConnectionClosed` if the stream ends cleanly before a frame starts
    /// * `FramingError` if the stream ends inside a frame or the length is absurd
    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ImuxError> {
        let mut prefix = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            let n = reader.read(&mut prefix[got..]).await?;
            if n == 0 {
                return Err(if got == 0 {
                    ImuxError::ConnectionClosed
                } else {
                    ImuxError::FramingError(format!("stream closed inside length prefix ({got}/4)"))
                });
            }
            got += n;
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ImuxError::FramingError(format!(
                "declared plist length {len} exceeds limit"
            )));
        }

        let mut body = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut body).await {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    ImuxError::FramingError(format!("stream closed before {len} byte plist body"))
                }
                _ => e.into(),
            });
        }
        Ok(body)
    }

    /// Parses raw plist bytes (XML or binary) into a dictionary
    pub fn decode_dictionary(raw: &[u8]) -> Result<plist::Dictionary, ImuxError> {
        Ok(plist::from_bytes(raw)?)
    }
}
