use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{ImuxError, usbmuxd::Connection};

#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceEntry>,
}

/// One device as the muxer describes it
///
/// `device_id` is scoped to the muxer session and may change across reconnects,
/// the serial number is the durable UDID.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DeviceProperties,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    #[serde(rename = "ConnectionSpeed", skip_serializing_if = "Option::is_none", default)]
    pub connection_speed: Option<u64>,
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "DeviceID", skip_serializing_if = "Option::is_none", default)]
    pub device_id: Option<u32>,
    #[serde(rename = "LocationID", skip_serializing_if = "Option::is_none", default)]
    pub location_id: Option<u64>,
    #[serde(rename = "ProductID", skip_serializing_if = "Option::is_none", default)]
    pub product_id: Option<u32>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
    #[serde(rename = "USBSerialNumber", skip_serializing_if = "Option::is_none", default)]
    pub usb_serial_number: Option<String>,
    #[serde(rename = "NetworkAddress", skip_serializing_if = "Option::is_none", default)]
    pub network_address: Option<plist::Data>,
    #[serde(
        rename = "EscapedFullServiceName",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub escaped_full_service_name: Option<String>,
    #[serde(rename = "InterfaceIndex", skip_serializing_if = "Option::is_none", default)]
    pub interface_index: Option<u64>,
}

impl DeviceEntry {
    pub fn serial(&self) -> &str {
        &self.properties.serial_number
    }

    /// Same entry under a different muxer-assigned ID
    pub fn with_device_id(&self, device_id: u32) -> Self {
        let mut res = self.clone();
        res.device_id = device_id;
        if res.properties.device_id.is_some() {
            res.properties.device_id = Some(device_id);
        }
        res
    }

    /// Serializes to the dictionary shape used in `DeviceList` and `Attached`
    pub fn to_dictionary(&self) -> Result<plist::Dictionary, ImuxError> {
        match plist::to_value(self)? {
            plist::Value::Dictionary(d) => Ok(d),
            _ => Err(ImuxError::InternalError(
                "device entry did not serialize to a dictionary".into(),
            )),
        }
    }

    /// Parses how the device is attached, including the sockaddr of network devices
    pub fn connection(&self) -> Result<Connection, ImuxError> {
        let connection_type = match self.properties.connection_type.as_str() {
            "Network" => {
                let addr = match &self.properties.network_address {
                    Some(a) => a.as_ref(),
                    None => {
                        warn!("Device is network attached, but has no network info");
                        return Err(ImuxError::UnexpectedResponse);
                    }
                };
                if addr.len() < 8 {
                    warn!("Device address bytes len < 8");
                    return Err(ImuxError::UnexpectedResponse);
                }

                match addr[0] {
                    // Linux sockaddr_in starts with the family
                    0x02 => Connection::Network(IpAddr::V4(Ipv4Addr::new(
                        addr[4], addr[5], addr[6], addr[7],
                    ))),
                    // BSD sockaddr: length byte first, family second
                    0x10 if addr[1] == 0x02 => Connection::Network(IpAddr::V4(Ipv4Addr::new(
                        addr[4], addr[5], addr[6], addr[7],
                    ))),
                    0x1E | 0x0A => {
                        if addr.len() < 24 {
                            warn!("IPv6 address is less than 24 bytes");
                            return Err(ImuxError::UnexpectedResponse);
                        }
                        Connection::Network(IpAddr::V6(ipv6_at(addr, 8)))
                    }
                    0x1C => {
                        if addr.len() < 24 {
                            warn!("IPv6 sockaddr_in6 data too short (len {})", addr.len());
                            return Err(ImuxError::UnexpectedResponse);
                        }
                        if addr[1] == 0x1E {
                            Connection::Network(IpAddr::V6(ipv6_at(addr, 8)))
                        } else {
                            warn!(
                                "Expected IPv6 family (0x1E) but got {:02X} for length 0x1C",
                                addr[1]
                            );
                            Connection::Unknown(format!("Network {:02X}", addr[1]))
                        }
                    }
                    _ => {
                        warn!("Unknown IP address protocol: {:02X}", addr[0]);
                        Connection::Unknown(format!("Network {:02X}", addr[0]))
                    }
                }
            }
            "USB" => Connection::Usb,
            other => Connection::Unknown(other.to_string()),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(connection_type)
    }
}

fn ipv6_at(addr: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&addr[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usbmuxd::test_entry as usb_entry;

    #[test]
    fn test_entry_survives_plist_shape() {
        let entry = usb_entry(3, "00008030-000000000000001E");
        let dict = entry.to_dictionary().unwrap();
        assert_eq!(
            dict.get("DeviceID").and_then(|v| v.as_unsigned_integer()),
            Some(3)
        );
        assert!(dict.get("Properties").and_then(|v| v.as_dictionary()).is_some());

        let back: DeviceEntry = plist::from_value(&plist::Value::Dictionary(dict)).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_network_ipv4_address() {
        let mut entry = usb_entry(9, "net");
        entry.properties.connection_type = "Network".into();
        entry.properties.network_address = Some(plist::Data::new(vec![
            0x02, 0x00, 0x00, 0x00, 192, 168, 1, 20, 0, 0, 0, 0,
        ]));
        assert_eq!(
            entry.connection().unwrap(),
            Connection::Network(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
        );
    }

    #[test]
    fn test_renumbering_keeps_serial() {
        let entry = usb_entry(3, "serial");
        let renumbered = entry.with_device_id(40);
        assert_eq!(renumbered.device_id, 40);
        assert_eq!(renumbered.properties.device_id, Some(40));
        assert_eq!(renumbered.serial(), "serial");
    }
}
