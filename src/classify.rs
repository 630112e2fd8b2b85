// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Error Classification
//!
//! Decides whether a failure is worth reconnecting over. Terminal errors are
//! the AMQP soft/hard errors that a fresh connection cannot cure; everything
//! else, including plain TCP failures and unclassified errors, is recoverable.

use crate::errors::ClientError;

/// AMQP reply codes that reconnecting cannot fix.
const TERMINAL_CODES: &[u16] = &[
    402, // invalid-path
    403, // access-refused
    404, // not-found
    406, // precondition-failed
    501, // frame-error
    502, // syntax-error
    503, // command-invalid
    504, // channel-error
    505, // unexpected-frame
    530, // not-allowed
    541, // internal-error
];

/// Whether an error should trigger reconnection or surface to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Cured by the reconnect loop.
    Recoverable,
    /// Surfaced to the caller; reconnecting will not help.
    Terminal,
}

impl Severity {
    pub fn is_terminal(self) -> bool {
        self == Severity::Terminal
    }
}

/// Classifies a raw broker failure by reply code and message text.
///
/// Codes like connection-forced (320), resource-locked (405), resource-error
/// (506), and no-consumers (313) fall through to recoverable, as do errors
/// without any code at all.
pub fn classify(code: Option<u16>, message: &str) -> Severity {
    if let Some(code) = code {
        if TERMINAL_CODES.contains(&code) {
            return Severity::Terminal;
        }
    }
    if message.contains("ACCESS_REFUSED") || message.to_ascii_lowercase().contains("authentication")
    {
        return Severity::Terminal;
    }
    Severity::Recoverable
}

/// Classifies a [`ClientError`] produced anywhere in the client.
pub fn severity(err: &ClientError) -> Severity {
    match err {
        ClientError::AuthError(_)
        | ClientError::PreconditionError(_)
        | ClientError::MaxReconnectAttempts(_) => Severity::Terminal,
        ClientError::ConnectionError { message, code }
        | ClientError::ChannelError { message, code } => classify(*code, message),
        ClientError::ConnectionTimeout => Severity::Recoverable,
        _ => Severity::Recoverable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_codes_are_terminal() {
        for code in [402, 403, 404, 406, 501, 502, 503, 504, 505, 530, 541] {
            assert_eq!(classify(Some(code), "boom"), Severity::Terminal, "{code}");
        }
    }

    #[test]
    fn recoverable_codes_fall_through() {
        for code in [320, 405, 506, 313] {
            assert_eq!(classify(Some(code), "boom"), Severity::Recoverable, "{code}");
        }
    }

    #[test]
    fn no_code_is_recoverable() {
        assert_eq!(classify(None, "connection refused"), Severity::Recoverable);
        assert_eq!(classify(None, "dns lookup failed"), Severity::Recoverable);
    }

    #[test]
    fn auth_messages_are_terminal() {
        assert_eq!(
            classify(None, "ACCESS_REFUSED - Login was refused"),
            Severity::Terminal
        );
        assert_eq!(
            classify(None, "PLAIN authentication failed"),
            Severity::Terminal
        );
    }

    #[test]
    fn error_kinds_map_onto_the_table() {
        assert!(severity(&ClientError::AuthError("no".into())).is_terminal());
        assert!(severity(&ClientError::PreconditionError("args differ".into())).is_terminal());
        assert!(severity(&ClientError::MaxReconnectAttempts(5)).is_terminal());
        assert!(!severity(&ClientError::ConnectionTimeout).is_terminal());
        assert!(!severity(&ClientError::ConnectionError {
            message: "connection refused".into(),
            code: None,
        })
        .is_terminal());
        assert!(severity(&ClientError::ConnectionError {
            message: "refused".into(),
            code: Some(403),
        })
        .is_terminal());
        assert!(severity(&ClientError::ChannelError {
            message: "inequivalent arg".into(),
            code: Some(406),
        })
        .is_terminal());
        assert!(!severity(&ClientError::ChannelError {
            message: "resource-locked".into(),
            code: Some(405),
        })
        .is_terminal());
    }
}
