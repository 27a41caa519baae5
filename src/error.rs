//! Failure taxonomy for sessions, capture devices and fan-out destinations

use thiserror::Error;

/// Whether a failure may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network blip, slow auth handshake, dropped stream
    Transient,
    /// Bad URL, permission denied, rejected credentials
    Fatal,
    /// Local rejection of a command; never changes session state
    Rejected,
}

/// Errors a session can surface through the event bridge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Camera not ready")]
    DeviceNotReady,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Auth error: {0}")]
    AuthError(String),

    #[error("Stream lost: {0}")]
    StreamLost(String),

    #[error("Camera switch already in progress")]
    SwitchInProgress,
}

impl SessionError {
    pub fn class(&self) -> FailureClass {
        match self {
            SessionError::ConnectFailed(_) | SessionError::StreamLost(_) => FailureClass::Transient,
            SessionError::DeviceNotReady
            | SessionError::PermissionDenied(_)
            | SessionError::InvalidTarget(_)
            | SessionError::AuthError(_) => FailureClass::Fatal,
            SessionError::SwitchInProgress => FailureClass::Rejected,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// Classify a free-form failure reason reported by a media engine.
    ///
    /// Engines report failures as strings. Matching is done on whole words,
    /// so "4040 ms" is not an HTTP 404 and "author" is not "auth". Reasons
    /// that talk about a timeout, delay or busy server stay retryable even
    /// when they mention authentication. Anything not recognised as a
    /// credential, permission or addressing problem is a retryable connect
    /// failure.
    pub fn classify(reason: &str) -> Self {
        const TRANSIENT: &[&str] = &[
            "timeout",
            "timed out",
            "delay",
            "delayed",
            "busy",
            "retry",
            "try again",
            "temporarily",
        ];
        const AUTH: &[&str] = &[
            "auth",
            "authentication",
            "authorization",
            "unauthorized",
            "forbidden",
            "401",
            "403",
            "credential",
            "credentials",
        ];
        const PERMISSION: &[&str] = &["permission", "permissions", "not allowed", "denied access"];
        const TARGET: &[&str] = &[
            "invalid url",
            "malformed",
            "unsupported scheme",
            "no such stream",
            "404",
            "endpoint is empty",
            "url is empty",
        ];

        let words = Words::new(reason);
        let reason = reason.to_string();

        if words.any(TRANSIENT) {
            SessionError::ConnectFailed(reason)
        } else if words.any(AUTH) {
            SessionError::AuthError(reason)
        } else if words.any(PERMISSION) {
            SessionError::PermissionDenied(reason)
        } else if words.any(TARGET) {
            SessionError::InvalidTarget(reason)
        } else {
            SessionError::ConnectFailed(reason)
        }
    }
}

/// Lowercased reason reduced to space-separated alphanumeric words, padded
/// so that a phrase only matches on word boundaries
struct Words(String);

impl Words {
    fn new(reason: &str) -> Self {
        let words: Vec<String> = reason
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();
        Words(format!(" {} ", words.join(" ")))
    }

    fn contains(&self, phrase: &str) -> bool {
        self.0.contains(&format!(" {} ", phrase))
    }

    fn any(&self, phrases: &[&str]) -> bool {
        phrases.iter().any(|phrase| self.contains(phrase))
    }
}

/// Capture device failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("capture device not attached")]
    NotAttached,

    #[error("camera/microphone permission denied")]
    PermissionDenied,

    #[error("failed to prepare encoder ({0})")]
    PrepareFailed(&'static str),

    #[error("failed to start capture: {0}")]
    CaptureFailed(String),
}

impl From<DeviceError> for SessionError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::PermissionDenied => SessionError::PermissionDenied(err.to_string()),
            _ => SessionError::DeviceNotReady,
        }
    }
}

/// Rejections and failures of a camera facing switch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchError {
    #[error("camera switch already in progress")]
    SwitchInProgress,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Secondary destination failures; never propagated to the primary session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FanoutError {
    #[error("failed to connect to {uri}: {reason}")]
    Connect { uri: String, reason: String },

    #[error("send to {uri} failed: {reason}")]
    Send { uri: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_reasons() {
        assert_eq!(
            SessionError::classify("Auth error"),
            SessionError::AuthError("Auth error".to_string())
        );
        assert_eq!(
            SessionError::classify("Camera permission not allowed"),
            SessionError::PermissionDenied("Camera permission not allowed".to_string())
        );
        assert!(matches!(
            SessionError::classify("Invalid URL: rtmp//nope"),
            SessionError::InvalidTarget(_)
        ));
        assert!(matches!(
            SessionError::classify("Connection timed out"),
            SessionError::ConnectFailed(_)
        ));
    }

    #[test]
    fn test_classify_matches_whole_words() {
        for reason in [
            "Auth delay: server busy",
            "authentication timed out, retry",
            "Read timeout after 4040 ms",
            "Stream 14031 closed by peer",
            "Server error from author.example.com",
        ] {
            assert!(
                matches!(SessionError::classify(reason), SessionError::ConnectFailed(_)),
                "{} should be retryable",
                reason
            );
        }

        assert!(matches!(
            SessionError::classify("HTTP 403 Forbidden"),
            SessionError::AuthError(_)
        ));
        assert!(matches!(
            SessionError::classify("Authentication failed"),
            SessionError::AuthError(_)
        ));
        assert!(matches!(
            SessionError::classify("server returned 404"),
            SessionError::InvalidTarget(_)
        ));
        assert!(matches!(
            SessionError::classify("NetStream.Publish.BadName: no such stream"),
            SessionError::InvalidTarget(_)
        ));
    }

    #[test]
    fn test_failure_classes() {
        assert!(SessionError::ConnectFailed("x".into()).is_transient());
        assert!(SessionError::StreamLost("x".into()).is_transient());
        assert_eq!(SessionError::AuthError("x".into()).class(), FailureClass::Fatal);
        assert_eq!(SessionError::InvalidTarget("x".into()).class(), FailureClass::Fatal);
        assert_eq!(SessionError::SwitchInProgress.class(), FailureClass::Rejected);
    }

    #[test]
    fn test_device_error_maps_to_session_error() {
        assert_eq!(SessionError::from(DeviceError::NotAttached), SessionError::DeviceNotReady);
        assert!(matches!(
            SessionError::from(DeviceError::PermissionDenied),
            SessionError::PermissionDenied(_)
        ));
    }
}
