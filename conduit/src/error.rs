//! Unified error types for conduit.
//!
//! Every context reports failures through its own error enum; all of them
//! fold into [`ConduitError`] for code that drives several contexts at once.

// ============================================================================
// Main Error Type
// ============================================================================

/// The main error type for conduit operations.
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    /// Transport error.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Browser host error.
    #[error("host: {0}")]
    Host(#[from] HostError),

    /// Page-side bridge error.
    #[error("bridge: {0}")]
    Bridge(#[from] BridgeError),

    /// Background hub error.
    #[error("hub: {0}")]
    Hub(#[from] HubError),

    /// Configuration error.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Serialization error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic internal error.
    #[error("{0}")]
    Internal(String),
}

impl ConduitError {
    /// Create a config error from a string.
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(ConfigError::Invalid(msg.into()))
    }
}

/// Result type alias for conduit operations.
pub type Result<T> = std::result::Result<T, ConduitError>;

// ============================================================================
// Transport Errors
// ============================================================================

/// Error type for the in-page and runtime transports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Nobody is listening on the other end of the channel.
    #[error("could not establish connection: receiving end does not exist")]
    NoReceiver,

    /// The receiver dropped the reply handle without answering.
    #[error("message port closed before a response was received")]
    PortClosed,

    /// The page window has been torn down.
    #[error("page window closed")]
    WindowClosed,

    /// The value could not be encoded as an envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

// ============================================================================
// Browser Host Errors
// ============================================================================

/// Error type for tab, window and scripting operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// No tab is active in the focused window.
    #[error("no active tab")]
    NoActiveTab,

    /// The tab does not exist (closed or never opened).
    #[error("tab not found: {0}")]
    TabNotFound(u32),

    /// No browser window has focus.
    #[error("no focused window")]
    NoFocusedWindow,

    /// The host refused to create the window.
    #[error("window creation failed: {0}")]
    WindowCreation(String),

    /// Script injection into the page world failed.
    #[error("script injection failed: {0}")]
    Injection(String),
}

/// Result type for browser host operations.
pub type HostResult<T> = std::result::Result<T, HostError>;

// ============================================================================
// Bridge Errors
// ============================================================================

/// Error type surfaced to page code awaiting a capability call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The wallet answered with an Error envelope.
    #[error("{0}")]
    Rejected(String),

    /// The caller-side timer fired before any reply.
    #[error("request timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// The owning context went away while the call was outstanding.
    #[error("request abandoned")]
    Abandoned,

    /// Internal message types may not be sent from a page.
    #[error("message type {0} is internal")]
    InternalType(String),

    /// The wallet answered with a payload of the wrong shape.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The envelope could not be posted.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for bridge operations.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

// ============================================================================
// Hub Errors
// ============================================================================

/// Error type for background hub operations and handler failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Browser host call failed while serving a message.
    #[error(transparent)]
    Host(#[from] HostError),

    /// Runtime transport failed while republishing a message.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The popup answered the republished message with an error.
    #[error("{0}")]
    Rejected(String),

    /// The message carried an unusable payload.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Handler-specific failure.
    #[error("{0}")]
    Handler(String),

    /// The popup window went away before answering.
    #[error("popup closed before completing the request")]
    PopupClosed,
}

impl HubError {
    /// Create a handler failure from a string.
    #[inline]
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

/// Result type for hub handlers.
pub type HubResult<T> = std::result::Result<T, HubError>;

// ============================================================================
// Configuration Errors
// ============================================================================

/// Error type for configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),

    /// Invalid value.
    #[error("invalid: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Error Context Extension
// ============================================================================

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    ///
    /// # Errors
    ///
    /// Returns the wrapped error with `msg` prefixed.
    fn context(self, msg: impl Into<String>) -> Result<T>;

    /// Add context using a closure (lazy evaluation).
    ///
    /// # Errors
    ///
    /// Returns the wrapped error with the closure output prefixed.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<ConduitError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            ConduitError::Internal(format!("{}: {}", msg.into(), err))
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            ConduitError::Internal(format!("{}: {}", f(), err))
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let err: ConduitError = TransportError::PortClosed.into();
        assert!(matches!(err, ConduitError::Transport(_)));

        let err: ConduitError = HostError::NoActiveTab.into();
        assert!(matches!(err, ConduitError::Host(_)));

        let hub: HubError = HostError::NoFocusedWindow.into();
        assert_eq!(hub.to_string(), "no focused window");
    }

    #[test]
    fn test_bridge_rejection_displays_reason_verbatim() {
        let err = BridgeError::Rejected("user declined".to_string());
        assert_eq!(err.to_string(), "user declined");
    }

    #[test]
    fn test_error_context() {
        let res: std::result::Result<(), HostError> = Err(HostError::NoActiveTab);
        let err = res.context("injecting page script").unwrap_err();
        assert_eq!(err.to_string(), "injecting page script: host: no active tab");
    }
}
