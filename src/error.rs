//! Error types for the email-dispatch crate.
//!
//! All errors implement [`std::error::Error`] and provide context about what went wrong.
//! Errors are categorized by their retryability - see [`Error::is_retryable`] - and by
//! whether they invalidate the mail connection - see [`Error::is_transport`].

use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while watching a mailbox and dispatching extractions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration / validation errors (NOT retryable)
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid email address format.
    #[error("invalid email format: {email}")]
    InvalidEmailFormat {
        /// The invalid email address.
        email: String,
    },

    /// Invalid configuration provided.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// Configuration document could not be decoded.
    #[error("invalid configuration document")]
    ConfigDocument {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Invalid DNS name for TLS.
    #[error("invalid DNS name for host '{host}'")]
    InvalidDnsName {
        /// The invalid hostname.
        host: String,
        /// The underlying DNS name error.
        #[source]
        source: rustls::client::InvalidDnsNameError,
    },

    /// A pattern rule's regular expression does not compile.
    #[error("pattern for rule '{rule}' does not compile")]
    InvalidPattern {
        /// The rule's parameter name.
        rule: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Network / connection errors (RETRYABLE)
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to establish TCP connection.
    #[error("failed to connect to {target}")]
    TcpConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to establish TLS connection.
    #[error("failed to establish TLS connection to {target}")]
    TlsConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The connection dropped while logging in, before the server answered.
    #[error("connection lost while logging in as {email}")]
    LoginConnectionLost {
        /// The email address used for login.
        email: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// The connection was already closed or lost.
    #[error("mail connection is closed")]
    ConnectionClosed,

    // ─────────────────────────────────────────────────────────────────────────
    // Timeout errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Connection timeout.
    #[error("connection timeout to {target} after {timeout:?}")]
    ConnectTimeout {
        /// The target address.
        target: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Authentication timeout.
    #[error("authentication timeout for {email} after {timeout:?}")]
    AuthTimeout {
        /// The email address used for authentication.
        email: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Mailbox selection timeout.
    #[error("mailbox selection timeout for '{mailbox}' after {timeout:?}")]
    SelectTimeout {
        /// The mailbox name.
        mailbox: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Message fetch timeout.
    #[error("message fetch timeout for range {range} after {timeout:?}")]
    FetchTimeout {
        /// The sequence range being fetched.
        range: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Health check (NOOP) timeout.
    #[error("health check timeout after {timeout:?}")]
    HealthTimeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Logout timeout (not critical).
    #[error("logout timeout after {timeout:?}")]
    LogoutTimeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // IMAP protocol errors
    // ─────────────────────────────────────────────────────────────────────────
    /// IMAP login failed (bad credentials or server refusal).
    #[error("IMAP login failed for {email}")]
    ImapLogin {
        /// The email address used for login.
        email: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to select mailbox.
    #[error("failed to select mailbox '{mailbox}'")]
    SelectMailbox {
        /// The mailbox name.
        mailbox: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to query server capabilities.
    #[error("IMAP CAPABILITY command failed")]
    ImapCapabilities {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP NOOP failed.
    #[error("IMAP NOOP command failed")]
    ImapNoop {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP IDLE failed while starting, waiting or finishing.
    #[error("IMAP IDLE failed")]
    ImapIdle {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// The server does not advertise the IDLE capability.
    #[error("IMAP server does not advertise IDLE capability")]
    IdleNotSupported,

    /// IMAP fetch failed.
    #[error("IMAP fetch failed for range {range}")]
    ImapFetch {
        /// The sequence range that failed.
        range: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to fetch message from stream.
    #[error("failed to fetch message from stream")]
    FetchMessage {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP logout failed.
    #[error("IMAP logout failed")]
    ImapLogout {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Email parsing errors (NOT retryable - malformed content won't change)
    // ─────────────────────────────────────────────────────────────────────────
    /// The server returned no body for a message.
    #[error("server returned no body for message {seq}")]
    MissingBody {
        /// Sequence number of the message.
        seq: u32,
    },

    /// Failed to parse email message.
    #[error("failed to parse message {seq}")]
    ParseEmail {
        /// Sequence number of the message.
        seq: u32,
        /// The underlying parse error.
        #[source]
        source: mailparse::MailParseError,
    },

    /// Failed to decode the content of a message part.
    #[error("failed to decode {mimetype} part")]
    DecodePart {
        /// MIME type of the part.
        mimetype: String,
        /// The underlying parse error.
        #[source]
        source: mailparse::MailParseError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery errors (NOT retried - delivery is at-most-once)
    // ─────────────────────────────────────────────────────────────────────────
    /// The callback request could not be sent or its response not read.
    #[error("delivery to {endpoint} failed")]
    DeliveryTransport {
        /// The callback endpoint.
        endpoint: String,
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// Failed to build the HTTP client.
    #[error("failed to build HTTP client")]
    HttpClient {
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// The background watch task panicked or was aborted.
    #[error("watch task failed")]
    WatchTask {
        /// The underlying join error.
        #[source]
        source: tokio::task::JoinError,
    },
}

impl Error {
    /// Returns `true` if this error represents a transient failure that might succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TcpConnect { .. }
            | Error::TlsConnect { .. }
            | Error::LoginConnectionLost { .. }
            | Error::ConnectionClosed
            | Error::ConnectTimeout { .. }
            | Error::AuthTimeout { .. }
            | Error::SelectTimeout { .. }
            | Error::FetchTimeout { .. }
            | Error::HealthTimeout { .. }
            | Error::SelectMailbox { .. }
            | Error::ImapCapabilities { .. }
            | Error::ImapNoop { .. }
            | Error::ImapIdle { .. }
            | Error::ImapFetch { .. }
            | Error::FetchMessage { .. } => true,

            // Bad credentials stay bad; the watch loop surfaces them instead of looping.
            Error::ImapLogin { .. }
            | Error::InvalidEmailFormat { .. }
            | Error::InvalidConfig { .. }
            | Error::ConfigDocument { .. }
            | Error::InvalidDnsName { .. }
            | Error::InvalidPattern { .. }
            | Error::LogoutTimeout { .. }
            | Error::ImapLogout { .. }
            | Error::IdleNotSupported
            | Error::MissingBody { .. }
            | Error::ParseEmail { .. }
            | Error::DecodePart { .. }
            | Error::DeliveryTransport { .. }
            | Error::HttpClient { .. }
            | Error::WatchTask { .. } => false,
        }
    }

    /// Returns `true` if this error invalidates the mail connection.
    ///
    /// The watch loop answers these with a health check and, if needed, a reconnect.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::TcpConnect { .. }
                | Error::TlsConnect { .. }
                | Error::LoginConnectionLost { .. }
                | Error::ConnectionClosed
                | Error::ConnectTimeout { .. }
                | Error::SelectTimeout { .. }
                | Error::FetchTimeout { .. }
                | Error::HealthTimeout { .. }
                | Error::SelectMailbox { .. }
                | Error::ImapNoop { .. }
                | Error::ImapIdle { .. }
                | Error::ImapFetch { .. }
                | Error::FetchMessage { .. }
        )
    }

    /// Returns the error category for metrics/logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidEmailFormat { .. }
            | Error::InvalidConfig { .. }
            | Error::ConfigDocument { .. }
            | Error::InvalidDnsName { .. }
            | Error::InvalidPattern { .. }
            | Error::HttpClient { .. } => ErrorCategory::Configuration,

            Error::ImapLogin { .. } => ErrorCategory::Authentication,

            Error::TcpConnect { .. }
            | Error::TlsConnect { .. }
            | Error::LoginConnectionLost { .. }
            | Error::ConnectionClosed => ErrorCategory::Network,

            Error::ConnectTimeout { .. }
            | Error::AuthTimeout { .. }
            | Error::SelectTimeout { .. }
            | Error::FetchTimeout { .. }
            | Error::HealthTimeout { .. }
            | Error::LogoutTimeout { .. } => ErrorCategory::Timeout,

            Error::SelectMailbox { .. }
            | Error::ImapCapabilities { .. }
            | Error::ImapNoop { .. }
            | Error::ImapIdle { .. }
            | Error::IdleNotSupported
            | Error::ImapFetch { .. }
            | Error::FetchMessage { .. }
            | Error::ImapLogout { .. } => ErrorCategory::Protocol,

            Error::MissingBody { .. } | Error::ParseEmail { .. } | Error::DecodePart { .. } => {
                ErrorCategory::Parse
            }

            Error::DeliveryTransport { .. } => ErrorCategory::Delivery,

            Error::WatchTask { .. } => ErrorCategory::Internal,
        }
    }
}

/// Error categories for metrics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration or validation errors.
    Configuration,
    /// Credentials rejected by the server.
    Authentication,
    /// Network connectivity errors.
    Network,
    /// Timeout errors.
    Timeout,
    /// IMAP protocol errors.
    Protocol,
    /// Email parsing errors.
    Parse,
    /// Callback delivery errors.
    Delivery,
    /// Failures of the engine itself.
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Authentication => write!(f, "authentication"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Parse => write!(f, "parse"),
            ErrorCategory::Delivery => write!(f, "delivery"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = Error::InvalidEmailFormat {
            email: "bad".into(),
        };
        assert!(!err.is_retryable());

        let err = Error::TcpConnect {
            target: "imap.example.com:993".into(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.is_retryable());

        let err = Error::ImapLogin {
            email: "user@example.com".into(),
            source: async_imap::error::Error::No("invalid credentials".into()),
        };
        assert!(!err.is_retryable());

        let err = Error::LoginConnectionLost {
            email: "user@example.com".into(),
            source: async_imap::error::Error::ConnectionLost,
        };
        assert!(err.is_retryable());
        assert!(err.is_transport());
    }

    #[test]
    fn test_transport_classification() {
        assert!(Error::ConnectionClosed.is_transport());
        assert!(Error::FetchTimeout {
            range: "1:5".into(),
            timeout: Duration::from_secs(30),
        }
        .is_transport());

        assert!(!Error::IdleNotSupported.is_transport());
        assert!(!Error::MissingBody { seq: 3 }.is_transport());
    }

    #[test]
    fn test_error_categories() {
        let err = Error::InvalidEmailFormat {
            email: "bad".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let err = Error::ConnectTimeout {
            target: "imap.example.com:993".into(),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(err.category(), ErrorCategory::Timeout);

        let err = Error::ImapLogin {
            email: "user@example.com".into(),
            source: async_imap::error::Error::Bad("LOGIN disabled".into()),
        };
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert_eq!(err.category().to_string(), "authentication");

        let err = Error::LoginConnectionLost {
            email: "user@example.com".into(),
            source: async_imap::error::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "eof",
            )),
        };
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[test]
    fn test_invalid_pattern_names_rule() {
        let source = regex::Regex::new("(unclosed").unwrap_err();
        let err = Error::InvalidPattern {
            rule: "code".into(),
            source,
        };
        assert_eq!(err.to_string(), "pattern for rule 'code' does not compile");
    }
}
