//! Pair record handling
//!
//! A pair record holds the certificates and keys that establish mutual trust between a
//! host and a device. The muxer stores one per device and hands it out through
//! `ReadPairRecord`.

use std::path::Path;

use base64::Engine;
use plist::Data;
use rustls::pki_types::{CertificateDer, pem::PemObject};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ImuxError;

/// Represents a complete pair record
#[derive(Clone, Debug)]
pub struct PairingFile {
    /// Device's certificate
    pub device_certificate: CertificateDer<'static>,
    /// Host's private key in PEM format
    pub host_private_key: Vec<u8>,
    /// Host's certificate
    pub host_certificate: CertificateDer<'static>,
    /// Root CA's private key in PEM format
    pub root_private_key: Vec<u8>,
    /// Root CA's certificate
    pub root_certificate: CertificateDer<'static>,
    /// System Build Unique Identifier of the host that paired
    pub system_buid: String,
    /// Host identifier
    pub host_id: String,
    /// Escrow bag allowing for access while locked
    pub escrow_bag: Vec<u8>,
    /// Device's WiFi MAC address
    pub wifi_mac_address: String,
    pub udid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_private_key: Data,
    root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(default = "empty_data")]
    escrow_bag: Data,
    #[serde(rename = "WiFiMACAddress", default)]
    wifi_mac_address: String,
    #[serde(rename = "UDID", skip_serializing_if = "Option::is_none", default)]
    udid: Option<String>,
}

fn empty_data() -> Data {
    Data::new(Vec::new())
}

impl PairingFile {
    /// Reads a pair record from disk
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, ImuxError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Parses a pair record from raw plist bytes
    ///
    /// # Errors
    /// `UnexpectedResponse` if the plist is missing fields or holds bad PEM data
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImuxError> {
        let r = match plist::from_bytes::<RawPairingFile>(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unable to convert bytes to raw pairing file: {e:?}");
                return Err(ImuxError::UnexpectedResponse);
            }
        };

        match r.try_into() {
            Ok(r) => Ok(r),
            Err(e) => {
                warn!("Unable to convert raw pairing file into pairing file: {e:?}");
                Err(ImuxError::UnexpectedResponse)
            }
        }
    }

    pub fn from_value(v: &plist::Value) -> Result<Self, ImuxError> {
        let raw: RawPairingFile = plist::from_value(v)?;
        let p = raw.try_into()?;
        Ok(p)
    }

    /// Serializes the pair record to XML plist bytes, certificates as PEM
    pub fn serialize(self) -> Result<Vec<u8>, ImuxError> {
        let raw = RawPairingFile::from(self);

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }

    /// Produces the record a bridging host publishes to its local muxer
    ///
    /// The real device key never leaves the device, so the bridge answers TLS as the
    /// device with the host certificate. Clients pin the device certificate from the
    /// record, hence it is replaced by the host one. The BUID must be the local
    /// muxer's or lockdown clients on this host refuse the record.
    pub fn for_bridge(&self, local_buid: impl Into<String>) -> Self {
        let mut res = self.clone();
        res.device_certificate = self.host_certificate.clone();
        res.system_buid = local_buid.into();
        res
    }
}

impl TryFrom<RawPairingFile> for PairingFile {
    type Error = rustls::pki_types::pem::Error;

    fn try_from(value: RawPairingFile) -> Result<Self, Self::Error> {
        Ok(Self {
            device_certificate: CertificateDer::from_pem_slice(&Into::<Vec<u8>>::into(
                value.device_certificate,
            ))?,
            host_private_key: Into::<Vec<u8>>::into(value.host_private_key),
            host_certificate: CertificateDer::from_pem_slice(&Into::<Vec<u8>>::into(
                value.host_certificate,
            ))?,
            root_private_key: Into::<Vec<u8>>::into(value.root_private_key),
            root_certificate: CertificateDer::from_pem_slice(&Into::<Vec<u8>>::into(
                value.root_certificate,
            ))?,
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.into(),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        })
    }
}

/// Wraps DER in PEM armour, which is how pair records store certificates
fn der_to_pem(der: &[u8]) -> Vec<u8> {
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut res = b"-----BEGIN CERTIFICATE-----\n".to_vec();
    for line in b64.as_bytes().chunks(64) {
        res.extend_from_slice(line);
        res.push(b'\n');
    }
    res.extend_from_slice(b"-----END CERTIFICATE-----\n");
    res
}

impl From<PairingFile> for RawPairingFile {
    fn from(value: PairingFile) -> Self {
        Self {
            device_certificate: Data::new(der_to_pem(&value.device_certificate)),
            host_private_key: Data::new(value.host_private_key),
            host_certificate: Data::new(der_to_pem(&value.host_certificate)),
            root_private_key: Data::new(value.root_private_key),
            root_certificate: Data::new(der_to_pem(&value.root_certificate)),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: Data::new(value.escrow_bag),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_pairing_file;

    #[test]
    fn test_serialize_then_parse_keeps_certificates() {
        let original = test_pairing_file();
        let bytes = original.clone().serialize().unwrap();
        let parsed = PairingFile::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.host_certificate, original.host_certificate);
        assert_eq!(parsed.device_certificate, original.device_certificate);
        assert_eq!(parsed.host_id, original.host_id);
        assert_eq!(parsed.udid, original.udid);
    }

    #[test]
    fn test_bridge_record_substitutes_identity() {
        let original = test_pairing_file();
        let bridged = original.for_bridge("LOCAL-BUID");
        assert_eq!(bridged.device_certificate, original.host_certificate);
        assert_eq!(bridged.system_buid, "LOCAL-BUID");
        assert_eq!(bridged.host_id, original.host_id);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            PairingFile::from_bytes(b"not a plist"),
            Err(ImuxError::UnexpectedResponse)
        ));
    }
}
