//! Error taxonomy for the streaming session core.
//!
//! Connection-establishment failures are returned synchronously to the
//! initiating call; in-flight stream faults are pushed asynchronously through
//! the connection's status observers. Nothing in this crate retries on its
//! own: resynchronization is always an explicit caller action.

use thiserror::Error;

use crate::workspace::ServerContext;

/// Failure to establish an outbound stream connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid endpoint `{url}`: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("websocket handshake with {endpoint} failed: {source}")]
    Handshake {
        endpoint: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("no active workspace to bind the connection to")]
    NoWorkspace,
}

/// Failure to publish a master context.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The context is already bound to another controller. The registry keeps
    /// the existing mapping untouched.
    #[error("context `{0}` is already published")]
    ContextConflict(ServerContext),

    #[error("failed to bind listener on port {port}: {source}")]
    Listener {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("no active workspace to publish")]
    NoWorkspace,
}

/// Mid-session fault on an open connection, delivered via `on_error`.
///
/// Fatal transport faults are always followed by `on_connection_closed`;
/// non-fatal faults only populate the connection's report.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("transport fault: {0}")]
    Transport(String),
}

impl StreamError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality() {
        assert!(StreamError::Transport("reset".into()).is_fatal());
        assert!(!StreamError::MalformedFrame("not json".into()).is_fatal());
    }

    #[test]
    fn conflict_display_names_context() {
        let err = PublishError::ContextConflict(ServerContext::derive("Team Graph"));
        assert!(err.to_string().contains("/teamgraph"));
    }
}
