//! Helpers shared by the network drivers.

pub mod tls;

pub use tls::{pg_connector, SslMode};

use crate::connection::ConnectFailure;

/// Classify a client library's connect error.
///
/// TLS and protocol negotiation problems are reported as
/// `version_negotiation` so they are not retried; everything else
/// (refused, unreachable, login failed) is a retryable `driver_connect`.
pub fn classify_connect_error(message: impl Into<String>) -> ConnectFailure {
    let message = message.into();
    let lowered = message.to_lowercase();
    let negotiation = ["tls", "ssl", "handshake", "certificate", "protocol version", "prelogin"]
        .iter()
        .any(|needle| lowered.contains(needle));
    if negotiation {
        ConnectFailure::negotiation(message)
    } else {
        ConnectFailure::connect(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionErrorKind;

    #[test]
    fn test_classify_connect_error() {
        assert_eq!(
            classify_connect_error("error performing TLS handshake").kind,
            ConnectionErrorKind::VersionNegotiation
        );
        assert_eq!(
            classify_connect_error("Connection refused (os error 111)").kind,
            ConnectionErrorKind::DriverConnect
        );
        assert_eq!(
            classify_connect_error("Login failed for user 'sa'").kind,
            ConnectionErrorKind::DriverConnect
        );
    }
}
