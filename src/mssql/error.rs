use tiberius::error::Error;

use crate::classify::CLIENT_TRANSPORT;
use crate::error::{DatabaseError, SprocError};

/// Convert a Tiberius error at the backend boundary, classifying server errors by number.
pub(crate) fn map_error(err: Error) -> SprocError {
    match err {
        Error::Server(token) => DatabaseError::from_code(
            i32::try_from(token.code()).unwrap_or(i32::MAX),
            token.message(),
        )
        .into(),
        Error::Io { kind, message } => {
            SprocError::Connectivity(format!("SQL Server I/O error ({kind:?}): {message}"))
        }
        Error::Tls(message) => SprocError::Connectivity(format!("SQL Server TLS error: {message}")),
        Error::Routing { host, port } => {
            SprocError::Connectivity(format!("unexpected routing request to {host}:{port}"))
        }
        Error::Protocol(message) => SprocError::Database(DatabaseError::from_code(
            CLIENT_TRANSPORT,
            format!("SQL Server protocol error: {message}"),
        )),
        other => SprocError::Validation(format!("SQL Server value conversion failed: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_connectivity() {
        let err = map_error(Error::Io {
            kind: std::io::ErrorKind::ConnectionReset,
            message: "reset by peer".into(),
        });
        assert!(matches!(err, SprocError::Connectivity(_)));
        assert!(err.is_retryable());
    }
}
