//! iOS Lockdown Service Client
//!
//! Lockdown is the control-plane service on the device. It hands out values, starts
//! sessions and opens ports for other named services.

use plist::Value;
use tracing::{error, warn};

use crate::{
    DeviceConnection, DeviceService, ImuxError,
    pairing_file::PairingFile,
    services::lockdown_session::{
        PhoneServiceInformation, SessionState, SessionStateMachine, SessionTransition,
    },
};

/// Client for the lockdown control connection
pub struct LockdownClient {
    /// The underlying device connection
    pub conn: DeviceConnection,
    session: SessionStateMachine,
    session_id: Option<String>,
    pairing_file: Option<PairingFile>,
}

impl DeviceService for LockdownClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.lockdown"
    }

    async fn connect(provider: &dyn crate::provider::DeviceProvider) -> Result<Self, ImuxError> {
        let conn = provider.connect(Self::LOCKDOWND_PORT).await?;
        Ok(Self::new(conn))
    }
}

impl LockdownClient {
    /// The default TCP port for the lockdown service
    pub const LOCKDOWND_PORT: u16 = 62078;

    pub fn new(conn: DeviceConnection) -> Self {
        Self {
            conn,
            session: SessionStateMachine::new(),
            session_id: None,
            pairing_file: None,
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    fn request(&self, name: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.conn.label().into());
        req.insert("Request".into(), name.into());
        req
    }

    /// Sends a request and reads its response, reacting to any session flag in it
    async fn round_trip(
        &mut self,
        req: plist::Dictionary,
    ) -> Result<(plist::Dictionary, SessionTransition), ImuxError> {
        self.conn.send_plist(Value::Dictionary(req)).await?;
        let response = self.conn.read_plist().await?;
        let transition = self.session.observe(&response)?;
        match &transition {
            SessionTransition::BeginSsl { .. } => {
                let pairing_file = match &self.pairing_file {
                    Some(p) => p.clone(),
                    None => {
                        return Err(ImuxError::ProtocolViolation(
                            "device enabled session SSL before a session was started".into(),
                        ));
                    }
                };
                self.conn.start_session(&pairing_file).await?;
                self.session.handshake_complete()?;
            }
            SessionTransition::StopSsl => self.conn.stop_session()?,
            _ => {}
        }
        Ok((response, transition))
    }

    /// Retrieves a value from the device
    ///
    /// # Arguments
    /// * `key` - The value name, e.g. "ProductVersion". `None` returns the whole domain
    /// * `domain` - Optional domain
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, ImuxError> {
        let mut req = self.request("GetValue");
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        let (mut response, _) = self.round_trip(req).await?;
        match response.remove("Value") {
            Some(m) => Ok(m),
            None => Err(ImuxError::UnexpectedResponse),
        }
    }

    /// Sets a value on the device
    pub async fn set_value(
        &mut self,
        key: impl Into<String>,
        value: Value,
        domain: Option<&str>,
    ) -> Result<(), ImuxError> {
        let mut req = self.request("SetValue");
        req.insert("Key".into(), key.into().into());
        req.insert("Value".into(), value);
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.round_trip(req).await?;
        Ok(())
    }

    /// Starts an authenticated session, upgrading to TLS when the device asks for it
    ///
    /// # Errors
    /// `InvalidHostID` if the device does not know this pair record
    pub async fn start_session(&mut self, pairing_file: &PairingFile) -> Result<(), ImuxError> {
        self.pairing_file = Some(pairing_file.clone());

        let mut req = self.request("StartSession");
        req.insert("HostID".into(), pairing_file.host_id.clone().into());
        req.insert("SystemBUID".into(), pairing_file.system_buid.clone().into());
        let (response, transition) = self.round_trip(req).await?;

        self.session_id = response
            .get("SessionID")
            .and_then(|v| v.as_string())
            .map(|s| s.to_string());
        if !matches!(transition, SessionTransition::BeginSsl { .. }) {
            warn!("Device started a session without SSL");
        }
        Ok(())
    }

    /// Ends the session and drops back to plaintext
    pub async fn stop_session(&mut self) -> Result<(), ImuxError> {
        let session_id = match self.session_id.take() {
            Some(s) => s,
            None => return Err(ImuxError::SessionInactive),
        };
        let mut req = self.request("StopSession");
        req.insert("SessionID".into(), session_id.into());
        self.round_trip(req).await?;
        Ok(())
    }

    /// Asks lockdown to open a port for `identifier`
    ///
    /// The returned port is in host byte order, ready for
    /// [`crate::usbmuxd::UsbmuxdConnection::connect_to_device`].
    pub async fn start_service(
        &mut self,
        identifier: impl Into<String>,
    ) -> Result<PhoneServiceInformation, ImuxError> {
        let identifier = identifier.into();
        let mut req = self.request("StartService");
        req.insert("Service".into(), identifier.clone().into());
        let (response, transition) = self.round_trip(req).await?;

        match transition {
            SessionTransition::ServiceStarted(info)
            | SessionTransition::BeginSsl {
                service: Some(info),
            } => Ok(info),
            _ => {
                error!("StartService for {identifier} returned no usable port");
                match response.get("Port") {
                    Some(_) => Err(ImuxError::UnexpectedResponse),
                    None => Err(ImuxError::ServiceNotFound),
                }
            }
        }
    }

    /// Reads the device's iOS version as (major, minor, patch)
    pub async fn product_version(&mut self) -> Result<(u8, u8, u8), ImuxError> {
        let v = self.get_value(Some("ProductVersion"), None).await?;
        let v = match v.as_string() {
            Some(v) => v,
            None => return Err(ImuxError::UnexpectedResponse),
        };
        let mut parts = v.split('.').map(|p| p.parse::<u8>().unwrap_or(0));
        Ok((
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        ))
    }
}

impl From<DeviceConnection> for LockdownClient {
    fn from(value: DeviceConnection) -> Self {
        Self::new(value)
    }
}
