//! Device information over the instruments service

use plist::{Dictionary, Value};
use tracing::warn;

use crate::ImuxError;

use super::remote_server::{Channel, DtxConnection};

pub const DEVICE_INFO_CHANNEL: &str = "com.apple.instruments.server.services.deviceinfo";

/// One entry of the device's process list
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u64,
    pub name: String,
    pub real_app_name: Option<String>,
    pub is_application: bool,
    /// Everything the device reported, including the fields above
    pub raw: Dictionary,
}

impl ProcessInfo {
    fn from_dictionary(raw: Dictionary) -> Option<Self> {
        let pid = raw.get("pid").and_then(|v| v.as_unsigned_integer())?;
        let name = raw.get("name").and_then(|v| v.as_string())?.to_string();
        Some(Self {
            pid,
            name,
            real_app_name: raw
                .get("realAppName")
                .and_then(|v| v.as_string())
                .map(|s| s.to_string()),
            is_application: raw
                .get("isApplication")
                .and_then(|v| v.as_boolean())
                .unwrap_or(false),
            raw,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfoClient {
    channel: Channel,
}

impl DeviceInfoClient {
    pub async fn new(conn: &DtxConnection) -> Result<Self, ImuxError> {
        let channel = conn.request_channel(DEVICE_INFO_CHANNEL, None).await?;
        Ok(Self { channel })
    }

    /// Lists the processes running on the device
    pub async fn running_processes(&self) -> Result<Vec<ProcessInfo>, ImuxError> {
        let res = self.channel.method_call("runningProcesses", Vec::new()).await?;
        let list = match res.data {
            Some(Value::Array(a)) => a,
            other => {
                warn!("runningProcesses returned {other:?}");
                return Err(ImuxError::UnexpectedResponse);
            }
        };
        Ok(list
            .into_iter()
            .filter_map(|v| match v {
                Value::Dictionary(d) => ProcessInfo::from_dictionary(d),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dvt::remote_server::fake::FakeDevice;

    #[tokio::test]
    async fn test_running_processes() {
        let (conn, mut device) = FakeDevice::pair();
        let client = tokio::spawn(async move {
            DeviceInfoClient::new(&conn)
                .await
                .unwrap()
                .running_processes()
                .await
                .unwrap()
        });

        device.answer(None).await;
        let mut springboard = Dictionary::new();
        springboard.insert("pid".into(), Value::Integer(34u64.into()));
        springboard.insert("name".into(), "SpringBoard".into());
        springboard.insert("isApplication".into(), true.into());
        let call = device
            .answer(Some(Value::Array(vec![Value::Dictionary(springboard)])))
            .await;
        assert_eq!(call.selector(), Some("runningProcesses"));

        let procs = client.await.unwrap();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 34);
        assert_eq!(procs[0].name, "SpringBoard");
        assert!(procs[0].is_application);
    }
}
