//! testmanagerd, the device side of XCTest runs
//!
//! The daemon talks to the host through the IDE channel, calling `_XCT_*` selectors and
//! waiting for every call it marks as expecting a reply to be acknowledged.

use tracing::debug;

use crate::{ImuxError, provider::DeviceProvider};

use super::{
    connect_dtx, dispatch::Dispatcher, product_major,
    remote_server::{Channel, DtxConnection},
    testmanagerd_service_name,
};

/// Channel the IDE side of a test session opens on testmanagerd
pub const XCTEST_MANAGER_CHANNEL: &str =
    "dtxproxy:XCTestManager_IDEInterface:XCTestManager_DaemonConnectionInterface";

#[derive(Debug, Clone)]
pub struct TestManagerClient {
    conn: DtxConnection,
}

impl TestManagerClient {
    /// Connects to the testmanagerd flavour the device's iOS version provides
    pub async fn connect(provider: &dyn DeviceProvider) -> Result<Self, ImuxError> {
        let name = testmanagerd_service_name(product_major(provider).await?);
        debug!("Connecting to {name}");
        Ok(Self::new(connect_dtx(provider, name).await?))
    }

    pub fn new(conn: DtxConnection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &DtxConnection {
        &self.conn
    }

    /// The channel testmanagerd uses to call back into the IDE
    pub fn ide_channel(&self, dispatcher: Dispatcher) -> Channel {
        self.conn.ide_channel(dispatcher)
    }

    /// Opens the XCTest manager channel
    pub async fn manager_channel(&self, dispatcher: Option<Dispatcher>) -> Result<Channel, ImuxError> {
        self.conn
            .request_channel(XCTEST_MANAGER_CHANNEL, dispatcher)
            .await
    }
}

#[cfg(test)]
mod tests {
    use plist::Value;

    use super::*;
    use crate::dvt::{
        message::MessageKind,
        remote_server::{IDE_CHANNEL, fake::FakeDevice},
    };

    #[tokio::test]
    async fn test_manager_channel_and_ide_callbacks() {
        let (conn, mut device) = FakeDevice::pair();
        let tm = TestManagerClient::new(conn);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ide = tm.ide_channel(Dispatcher::new().on(
            "_XCT_testBundleReadyWithProtocolVersion:minimumVersion:",
            move |_| {
                tx.send(()).unwrap();
                None
            },
        ));
        assert_eq!(ide.code(), IDE_CHANNEL);

        let tm2 = tm.clone();
        let open = tokio::spawn(async move { tm2.manager_channel(None).await.unwrap().code() });
        let req = device.answer(None).await;
        assert_eq!(
            req.arguments().unwrap()[1],
            Value::String(XCTEST_MANAGER_CHANNEL.into())
        );
        assert_eq!(open.await.unwrap(), 1);

        device
            .call(
                IDE_CHANNEL,
                "_XCT_testBundleReadyWithProtocolVersion:minimumVersion:",
                true,
            )
            .await;
        rx.recv().await.unwrap();
        assert_eq!(device.read().await.kind(), MessageKind::Ack);
    }
}
