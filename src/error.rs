use std::time::Duration;

/// Errors surfaced by clients, servers and the discovery layer.
#[derive(Debug)]
pub enum Error {
    /// Transport-level IO failure. Terminates the connection.
    Io(std::io::Error),

    /// Encoding or decoding failure from one of the codecs.
    Parse(Box<dyn std::error::Error + Send + Sync>),

    /// Negotiation failure: bad magic number, unknown codec identifier
    /// or a malformed option preamble. Fatal to the connection.
    Handshake(String),

    /// A per-call error reported by the server in the response header.
    /// The connection stays usable.
    Service(String),

    /// The transport connect did not complete within the configured limit.
    ConnectTimeout(Duration),

    /// The connection is closing or has shut down.
    Shutdown,

    /// Service discovery could not produce a server address.
    Discovery(String),

    /// Invariant violation inside the framework itself.
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => err.fmt(f),
            Error::Parse(source) => source.fmt(f),
            Error::Handshake(msg) => write!(f, "rpc: handshake failed: {}", msg),
            Error::Service(msg) => f.write_str(msg),
            Error::ConnectTimeout(limit) => {
                write!(f, "rpc client: connect timeout: expect within {:?}", limit)
            }
            Error::Shutdown => f.write_str("connection is shut down"),
            Error::Discovery(msg) => write!(f, "rpc discovery: {}", msg),
            Error::Internal(msg) => write!(f, "rpc internal: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Parse(source) => Some(&**source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Parse(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(Box::new(err))
    }
}

impl From<erased_serde::Error> for Error {
    fn from(err: erased_serde::Error) -> Self {
        Error::Parse(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_message() {
        assert_eq!(Error::Shutdown.to_string(), "connection is shut down");
    }

    #[test]
    fn service_error_is_verbatim() {
        let e = Error::Service("rpc server: can't find service Foo".into());
        assert_eq!(e.to_string(), "rpc server: can't find service Foo");
    }
}
