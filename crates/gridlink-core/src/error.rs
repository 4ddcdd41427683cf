use thiserror::Error;

/// Shared error type for the discovery, registry, and admission layers.
///
/// None of these are fatal to the hosting driver: callers either recover
/// locally or surface the failure as a plain result.
#[derive(Debug, Error)]
pub enum GridError {
    /// Stale channel or peer reference (already closed or forgotten).
    #[error("not found: {0}")]
    NotFound(String),
    /// Missing statistics/SLA source, unknown policy, or invalid settings.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Connecting to a discovered peer failed; discovery keeps running.
    #[error("discovery connection to {peer} failed: {reason}")]
    DiscoveryConnection { peer: String, reason: String },
    /// Malformed frame received from a remote end.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GridError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn configuration(what: impl Into<String>) -> Self {
        Self::Configuration(what.into())
    }

    pub fn discovery_connection(peer: impl Into<String>, reason: impl ToString) -> Self {
        Self::DiscoveryConnection {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GridError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            GridError::not_found("channel #4").to_string(),
            "not found: channel #4"
        );
        assert_eq!(
            GridError::configuration("no 'nodes' statistic").to_string(),
            "configuration error: no 'nodes' statistic"
        );
        assert_eq!(
            GridError::discovery_connection("driver-b@10.0.0.2:11111", "connection refused")
                .to_string(),
            "discovery connection to driver-b@10.0.0.2:11111 failed: connection refused"
        );
        assert_eq!(
            GridError::Protocol("bad hello".into()).to_string(),
            "protocol error: bad hello"
        );
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let err: GridError = io.into();
        assert!(matches!(err, GridError::Io(_)));
        assert!(err.to_string().contains("port taken"));
    }
}
