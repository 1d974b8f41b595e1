//! Lockdown SSL session tracking
//!
//! Lockdown has no explicit "switch to TLS now" message. The switch is implied by flags
//! in response dictionaries, so both the client and the proxy feed every decoded
//! response through [`SessionStateMachine::observe`] and act on the transition it
//! returns.

use tracing::{debug, warn};

use crate::ImuxError;

/// Where a lockdown control connection stands with respect to TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Plain,
    /// `EnableSessionSSL` was seen, the handshake has not completed yet
    SslPending,
    Encrypted,
}

/// A service lockdown just opened a port for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneServiceInformation {
    /// Device port in host byte order
    pub port: u16,
    pub name: String,
    /// Whether the service socket itself needs TLS (`EnableServiceSSL`)
    pub use_ssl: bool,
}

impl PhoneServiceInformation {
    /// Extracts service information from a successful `StartService` response
    ///
    /// Returns `None` for other requests, responses carrying `Error`, or no `Port`.
    pub fn from_response(response: &plist::Dictionary) -> Option<Self> {
        if response.get("Request").and_then(|v| v.as_string()) != Some("StartService") {
            return None;
        }
        if response.contains_key("Error") {
            return None;
        }
        let port = response.get("Port").and_then(|v| v.as_unsigned_integer())?;
        let port = match u16::try_from(port) {
            Ok(p) => p,
            Err(_) => {
                warn!("StartService returned out of range port {port}");
                return None;
            }
        };
        Some(Self {
            port,
            name: response
                .get("Service")
                .and_then(|v| v.as_string())
                .unwrap_or_default()
                .to_string(),
            use_ssl: response
                .get("EnableServiceSSL")
                .and_then(|v| v.as_boolean())
                .unwrap_or(false),
        })
    }
}

/// What the caller must do after a response was observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    /// Nothing changes on the transport
    None,
    /// Perform the TLS handshake before any further byte is written or read.
    /// A `StartService` response can carry both flags, so the service travels along.
    BeginSsl {
        service: Option<PhoneServiceInformation>,
    },
    /// A service port is live for exactly one inbound connection
    ServiceStarted(PhoneServiceInformation),
    /// Unwrap TLS and continue in plaintext
    StopSsl,
}

#[derive(Debug, Default)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Feeds one decoded lockdown response through the machine
    ///
    /// # Errors
    /// `ProtocolViolation` if `EnableSessionSSL` shows up while a session is already
    /// pending or encrypted, since TLS cannot be layered twice on one connection
    pub fn observe(
        &mut self,
        response: &plist::Dictionary,
    ) -> Result<SessionTransition, ImuxError> {
        let request = response.get("Request").and_then(|v| v.as_string());

        if request == Some("StopSession") {
            return Ok(match self.state {
                SessionState::Plain => SessionTransition::None,
                SessionState::SslPending | SessionState::Encrypted => {
                    debug!("Lockdown session stopped, back to plaintext");
                    self.state = SessionState::Plain;
                    SessionTransition::StopSsl
                }
            });
        }

        let service = PhoneServiceInformation::from_response(response);

        let enable_ssl = response
            .get("EnableSessionSSL")
            .and_then(|v| v.as_boolean())
            .unwrap_or(false);
        if enable_ssl {
            if self.state != SessionState::Plain {
                warn!("EnableSessionSSL observed in state {:?}", self.state);
                return Err(ImuxError::ProtocolViolation(format!(
                    "EnableSessionSSL while session is {:?}",
                    self.state
                )));
            }
            debug!("Lockdown asked for session SSL");
            self.state = SessionState::SslPending;
            return Ok(SessionTransition::BeginSsl { service });
        }

        Ok(match service {
            Some(s) => SessionTransition::ServiceStarted(s),
            None => SessionTransition::None,
        })
    }

    /// Marks the pending handshake as done
    pub fn handshake_complete(&mut self) -> Result<(), ImuxError> {
        match self.state {
            SessionState::SslPending => {
                self.state = SessionState::Encrypted;
                Ok(())
            }
            other => Err(ImuxError::ProtocolViolation(format!(
                "TLS handshake completed while session is {other:?}"
            ))),
        }
    }
}
