use std::fmt;

/// All error types produced by the router core.
///
/// Maps to the original Go codebase's ad-hoc `fmt.Errorf` usage in
/// `backend.go`, `cluster.go`, `router.go` and `api.go`: there is no single
/// error type over there, just wrapped strings. Here we separate the cases
/// that need to be told apart at the call site (configuration errors fail
/// construction; routing errors become a `tonic::Status`).
#[derive(Debug)]
pub enum ArouterError {
    /// A configuration value was missing, duplicated, or otherwise invalid.
    /// Fatal at construction time; the proxy never starts serving.
    Config(String),

    /// A routing decision could not be made (unknown method, no backend
    /// for the cluster, missing binding header, ...).
    Routing(String),

    /// A backend had no connection in the `ready` state to satisfy the call.
    NoOpenConnection(String),

    /// An error surfaced by the upstream gRPC transport mid-stream.
    Transport(tonic::Status),

    /// An error returned from a control-API handler.
    ControlApi(tonic::Status),

    /// An I/O error (file read, socket bind, etc.).
    Io(std::io::Error),
}

impl fmt::Display for ArouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArouterError::Config(msg) => write!(f, "configuration error: {msg}"),
            ArouterError::Routing(msg) => write!(f, "routing error: {msg}"),
            ArouterError::NoOpenConnection(name) => {
                write!(f, "no open connection available on backend {name:?}")
            }
            ArouterError::Transport(status) => {
                write!(f, "upstream transport error: {} - {}", status.code(), status.message())
            }
            ArouterError::ControlApi(status) => {
                write!(f, "control api error: {} - {}", status.code(), status.message())
            }
            ArouterError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for ArouterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArouterError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ArouterError {
    fn from(err: std::io::Error) -> Self {
        ArouterError::Io(err)
    }
}

impl From<tonic::Status> for ArouterError {
    fn from(status: tonic::Status) -> Self {
        ArouterError::Transport(status)
    }
}

impl From<ArouterError> for tonic::Status {
    /// Maps each kind to the status code named in spec §7.
    fn from(err: ArouterError) -> Self {
        match err {
            ArouterError::Config(msg) => tonic::Status::failed_precondition(msg),
            ArouterError::Routing(msg) => tonic::Status::unavailable(msg),
            ArouterError::NoOpenConnection(name) => {
                tonic::Status::unavailable(format!("no open connection for backend {name:?}"))
            }
            ArouterError::Transport(status) => status,
            ArouterError::ControlApi(status) => status,
            ArouterError::Io(err) => tonic::Status::internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArouterError>;

/// Errors from loading and validating a configuration document.
///
/// Kept distinct from `ArouterError` because a config load happens before
/// any router/backend/cluster exists to attribute a routing error to, and
/// because it collects every violation found rather than failing fast on
/// the first one (an operator fixing a config file wants the whole list).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_error_maps_to_unavailable() {
        let err = ArouterError::Routing("no cluster".into());
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[test]
    fn config_error_maps_to_failed_precondition() {
        let err = ArouterError::Config("missing name".into());
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }

    #[test]
    fn display_formatting() {
        let err = ArouterError::NoOpenConnection("ro_vcore0".into());
        assert!(err.to_string().contains("ro_vcore0"));
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ArouterError = io_err.into();
        assert!(matches!(err, ArouterError::Io(_)));
    }
}
