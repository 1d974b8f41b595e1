//! Instruments-class services speaking DTX
//!
//! The remote server hands out named channels over one DTX stream. Which lockdown
//! service carries that stream depends on the iOS version: from iOS 14 on it is the
//! `DVTSecureSocketProxy` flavour, which keeps TLS for the whole session, while older
//! devices drop back to plaintext after the handshake.

use tracing::debug;

use crate::{
    DeviceService, ImuxError,
    provider::{DeviceProvider, connect_to_service},
    services::lockdown::LockdownClient,
};

use remote_server::DtxConnection;

pub mod device_info;
pub mod dispatch;
pub mod fragment;
pub mod message;
pub mod process_control;
pub mod remote_server;
pub mod testmanager;

pub const DVT_SERVICE: &str = "com.apple.instruments.remoteserver.DVTSecureSocketProxy";
pub const DVT_SERVICE_LEGACY: &str = "com.apple.instruments.remoteserver";
pub const TESTMANAGERD_SERVICE: &str = "com.apple.testmanagerd.lockdown.secure";
pub const TESTMANAGERD_SERVICE_LEGACY: &str = "com.apple.testmanagerd.lockdown";

pub fn dvt_service_name(ios_major: u8) -> &'static str {
    if ios_major < 14 {
        DVT_SERVICE_LEGACY
    } else {
        DVT_SERVICE
    }
}

pub fn testmanagerd_service_name(ios_major: u8) -> &'static str {
    if ios_major < 14 {
        TESTMANAGERD_SERVICE_LEGACY
    } else {
        TESTMANAGERD_SERVICE
    }
}

/// Asks lockdown for the device's major iOS version
pub async fn product_major(provider: &dyn DeviceProvider) -> Result<u8, ImuxError> {
    let mut lockdown = LockdownClient::connect(provider).await?;
    let (major, _, _) = lockdown.product_version().await?;
    lockdown.conn.close().await?;
    Ok(major)
}

/// Starts `service_name` and speaks DTX over it, capabilities already exchanged
pub async fn connect_dtx(
    provider: &dyn DeviceProvider,
    service_name: &str,
) -> Result<DtxConnection, ImuxError> {
    let stream = connect_to_service(provider, service_name).await?;
    let conn = DtxConnection::with_label(Box::new(stream), service_name);
    let caps = conn.perform_handshake().await?;
    debug!("{service_name} published {} capabilities", caps.len());
    Ok(conn)
}

/// Connects to the instruments remote server
pub async fn connect_instruments(provider: &dyn DeviceProvider) -> Result<DtxConnection, ImuxError> {
    let name = dvt_service_name(product_major(provider).await?);
    connect_dtx(provider, name).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_names_by_version() {
        assert_eq!(dvt_service_name(13), "com.apple.instruments.remoteserver");
        assert_eq!(dvt_service_name(17), DVT_SERVICE);
        assert_eq!(
            testmanagerd_service_name(12),
            "com.apple.testmanagerd.lockdown"
        );
        assert_eq!(testmanagerd_service_name(14), TESTMANAGERD_SERVICE);
    }
}
