//! Services reachable through lockdown

pub mod lockdown;
pub mod lockdown_session;

#[cfg(feature = "dvt")]
pub mod dvt;

/// Services that use TLS only to authenticate the host and then speak plaintext
pub const HANDSHAKE_ONLY_SSL_SERVICES: &[&str] = &[
    "com.apple.instruments.remoteserver",
    "com.apple.accessibility.axAuditDaemon.remoteserver",
    "com.apple.testmanagerd.lockdown",
    "com.apple.debugserver",
];

/// Whether `service` drops back to plaintext right after the TLS handshake
pub fn is_handshake_only_ssl(service: &str) -> bool {
    HANDSHAKE_ONLY_SSL_SERVICES.contains(&service)
}
