use thiserror::Error;

/// Unified error type for everything that talks to a device.
///
/// The transport-class variants (`Refused`, `Timeout`, `HttpStatus`,
/// `Network`) are retried by the HTTP client; `Payload` (bad or empty
/// response body) and `Device` (instruction refused by the state machine)
/// are not. `Validation` never reaches users — it flags internal misuse
/// such as an unknown instruction name.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The device actively refused the connection (likely shut down).
    #[error("connection refused by {url}")]
    Refused { url: String },

    /// The request timed out.
    #[error("timeout contacting {url}")]
    Timeout { url: String },

    /// The device answered with an HTTP error status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Any other transport failure.
    #[error("network error from {url}: {message}")]
    Network { url: String, message: String },

    /// The response body was empty or not valid JSON.
    #[error("invalid payload from {url}: {message}")]
    Payload { url: String, message: String },

    /// The device is in a state incompatible with the requested instruction.
    #[error("{0}")]
    Device(String),

    /// Internal validation failure (bad status name, bad arguments).
    #[error("{0}")]
    Validation(String),
}

impl ScanError {
    /// Transport-class errors are transparently retried by the HTTP client.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ScanError::Refused { .. }
                | ScanError::Timeout { .. }
                | ScanError::HttpStatus { .. }
                | ScanError::Network { .. }
        )
    }

    /// Whether the device actively refused the connection. Three of these in
    /// a row are treated as a shutdown by the polling loop.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, ScanError::Refused { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(ScanError::Refused {
            url: "http://10.0.0.1:9000/id".into()
        }
        .is_transport());
        assert!(ScanError::Timeout {
            url: "http://10.0.0.1:9000/id".into()
        }
        .is_transport());
        assert!(ScanError::HttpStatus {
            status: 500,
            url: "x".into()
        }
        .is_transport());
        assert!(!ScanError::Payload {
            url: "x".into(),
            message: "empty".into()
        }
        .is_transport());
        assert!(!ScanError::Device("busy".into()).is_transport());
    }

    #[test]
    fn test_refused_classification() {
        assert!(ScanError::Refused { url: "x".into() }.is_connection_refused());
        assert!(!ScanError::Timeout { url: "x".into() }.is_connection_refused());
    }
}
