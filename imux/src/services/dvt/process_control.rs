//! Process control over the instruments service
//!
//! # Example
//! ```rust,no_run
//! # async fn demo(provider: &dyn imux::provider::DeviceProvider) -> Result<(), imux::ImuxError> {
//! use imux::dvt::{connect_instruments, process_control::ProcessControlClient};
//!
//! let conn = connect_instruments(provider).await?;
//! let process_control = ProcessControlClient::new(&conn).await?;
//! let pid = process_control
//!     .launch_app("com.example.app", None, None, false, true)
//!     .await?;
//! process_control.disable_memory_limit(pid).await?;
//! process_control.kill_app(pid).await?;
//! # Ok(())
//! # }
//! ```

use plist::{Dictionary, Value};
use tracing::warn;

use crate::ImuxError;

use super::{
    message::{AuxValue, MessageKind},
    remote_server::{Channel, DtxConnection},
};

pub const PROCESS_CONTROL_CHANNEL: &str = "com.apple.instruments.server.services.processcontrol";

/// Client for launching and killing processes on the device
#[derive(Debug, Clone)]
pub struct ProcessControlClient {
    channel: Channel,
}

impl ProcessControlClient {
    pub async fn new(conn: &DtxConnection) -> Result<Self, ImuxError> {
        let channel = conn.request_channel(PROCESS_CONTROL_CHANNEL, None).await?;
        Ok(Self { channel })
    }

    /// Launches an application and returns its PID
    ///
    /// # Arguments
    /// * `bundle_id` - The bundle identifier of the app to launch
    /// * `env_vars` - Environment of the new process
    /// * `arguments` - Launch arguments
    /// * `start_suspended` - Start the process stopped, waiting for a debugger
    /// * `kill_existing` - Kill a running instance first
    ///
    /// # Errors
    /// `DtxRemoteError` if the device refuses, `UnexpectedResponse` without a PID
    pub async fn launch_app(
        &self,
        bundle_id: impl Into<String>,
        env_vars: Option<Dictionary>,
        arguments: Option<Vec<String>>,
        start_suspended: bool,
        kill_existing: bool,
    ) -> Result<u64, ImuxError> {
        let mut options = Dictionary::new();
        options.insert(
            "StartSuspendedKey".into(),
            Value::Integer(u64::from(start_suspended).into()),
        );
        options.insert(
            "KillExisting".into(),
            Value::Integer(u64::from(kill_existing).into()),
        );
        // Without it older devices bring the app up behind a black window
        options.insert("ActivateSuspended".into(), Value::Integer(1u64.into()));

        let arguments = arguments
            .unwrap_or_default()
            .into_iter()
            .map(Value::String)
            .collect::<Vec<_>>();

        let res = self
            .channel
            .method_call(
                "launchSuspendedProcessWithDevicePath:bundleIdentifier:environment:arguments:options:",
                vec![
                    AuxValue::archived_value("/private/")?,
                    AuxValue::archived_value(bundle_id.into())?,
                    AuxValue::archived_value(Value::Dictionary(env_vars.unwrap_or_default()))?,
                    AuxValue::archived_value(Value::Array(arguments))?,
                    AuxValue::archived_value(Value::Dictionary(options))?,
                ],
            )
            .await?;

        match res.data {
            Some(Value::Integer(p)) => match p.as_unsigned() {
                Some(p) => Ok(p),
                None => {
                    warn!("PID wasn't unsigned");
                    Err(ImuxError::UnexpectedResponse)
                }
            },
            other => {
                warn!("Did not get integer response: {other:?}");
                Err(ImuxError::UnexpectedResponse)
            }
        }
    }

    /// Kills a running process
    ///
    /// Does not wait for the device to confirm.
    pub async fn kill_app(&self, pid: u64) -> Result<(), ImuxError> {
        self.channel
            .method_call_async("killPid:", vec![pid_arg(pid)?])
            .await
    }

    /// Lifts the jetsam memory limit of a process
    ///
    /// # Errors
    /// `DisableMemoryLimitFailed` if the device says no
    pub async fn disable_memory_limit(&self, pid: u64) -> Result<(), ImuxError> {
        let res = self
            .channel
            .method_call(
                "requestDisableMemoryLimitsForPid:",
                vec![pid_arg(pid)?],
            )
            .await?;
        match (res.kind(), res.data) {
            (MessageKind::Response, Some(Value::Boolean(true))) => Ok(()),
            (_, Some(Value::Boolean(false))) => {
                warn!("Failed to disable memory limit");
                Err(ImuxError::DisableMemoryLimitFailed)
            }
            _ => Err(ImuxError::UnexpectedResponse),
        }
    }
}

/// PIDs go over the wire as 32 bits
fn pid_arg(pid: u64) -> Result<AuxValue, ImuxError> {
    match u32::try_from(pid) {
        Ok(p) => Ok(AuxValue::U32(p)),
        Err(_) => {
            warn!("PID {pid} does not fit the wire format");
            Err(ImuxError::InvalidArgument)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dvt::remote_server::fake::FakeDevice;

    #[tokio::test]
    async fn test_launch_kill_and_memory_limit() {
        let (conn, mut device) = FakeDevice::pair();
        let client = tokio::spawn(async move {
            let pc = ProcessControlClient::new(&conn).await.unwrap();
            let pid = pc
                .launch_app("com.example.app", None, Some(vec!["-v".into()]), true, false)
                .await
                .unwrap();
            pc.disable_memory_limit(pid).await.unwrap();
            pc.kill_app(pid).await.unwrap();
            pid
        });

        device.answer(None).await;
        let launch = device.answer(Some(Value::Integer(321u64.into()))).await;
        let args = launch.arguments().unwrap();
        assert_eq!(args[0], Value::String("/private/".into()));
        assert_eq!(args[1], Value::String("com.example.app".into()));
        let options = args[4].as_dictionary().unwrap();
        assert_eq!(
            options.get("StartSuspendedKey"),
            Some(&Value::Integer(1u64.into()))
        );

        let limit = device.answer(Some(Value::Boolean(true))).await;
        assert_eq!(
            limit.selector(),
            Some("requestDisableMemoryLimitsForPid:")
        );
        let kill = device.read().await;
        assert_eq!(kill.selector(), Some("killPid:"));
        assert!(!kill.message_header.expects_reply);
        assert_eq!(kill.arguments().unwrap()[0], Value::Integer(321u64.into()));

        assert_eq!(client.await.unwrap(), 321);
    }

    #[tokio::test]
    async fn test_memory_limit_refused() {
        let (conn, mut device) = FakeDevice::pair();
        let client = tokio::spawn(async move {
            let pc = ProcessControlClient::new(&conn).await.unwrap();
            pc.disable_memory_limit(5).await
        });
        device.answer(None).await;
        device.answer(Some(Value::Boolean(false))).await;
        assert!(matches!(
            client.await.unwrap(),
            Err(ImuxError::DisableMemoryLimitFailed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_pid_is_rejected() {
        let (conn, mut device) = FakeDevice::pair();
        let client = tokio::spawn(async move {
            let pc = ProcessControlClient::new(&conn).await.unwrap();
            (
                pc.kill_app(u64::from(u32::MAX) + 1).await,
                pc.disable_memory_limit(u64::MAX).await,
            )
        });
        device.answer(None).await;
        let (kill, limit) = client.await.unwrap();
        assert!(matches!(kill, Err(ImuxError::InvalidArgument)));
        assert!(matches!(limit, Err(ImuxError::InvalidArgument)));
    }
}
