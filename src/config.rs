//! Configuration for a mailbox watch.
//!
//! Use [`WatchConfigBuilder`] to create a configuration with sensible defaults:
//!
//! ```
//! use email_dispatch::{PatternRule, WatchConfig};
//!
//! let config = WatchConfig::builder()
//!     .imap_host("imap.example.com")
//!     .email("user@example.com")
//!     .password("app-password")
//!     .rule(PatternRule::required("code", r"[0-9]{6}"))
//!     .callback_url("https://hooks.example.com/otp")
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.folder, "INBOX");
//! ```
//!
//! A configuration can also be decoded from the JSON document used by the
//! control surface, see [`ServiceConfig`].

use crate::error::{Error, Result};
use email_address::EmailAddress;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A named regular expression used to extract values from message bodies.
///
/// When `required` is set and the pattern matches nothing, the whole message is
/// skipped and nothing is delivered for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    /// Name of the extracted parameter.
    #[serde(rename = "param")]
    pub param_name: String,
    /// Regular expression, applied to the full body text.
    pub regex: String,
    /// Whether a message without a match is skipped entirely.
    #[serde(rename = "require", default)]
    pub required: bool,
}

impl PatternRule {
    /// Creates a rule that contributes an empty value list when nothing matches.
    #[must_use]
    pub fn optional(param_name: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            param_name: param_name.into(),
            regex: regex.into(),
            required: false,
        }
    }

    /// Creates a rule that vetoes the message when nothing matches.
    #[must_use]
    pub fn required(param_name: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            param_name: param_name.into(),
            regex: regex.into(),
            required: true,
        }
    }
}

/// Configuration for one watch cycle.
///
/// Create using [`WatchConfig::builder()`]. The configuration is immutable while a
/// watch runs; changing it means stopping and restarting the watch.
///
/// The `password` field is stored as a [`SecretString`] to prevent accidental
/// logging of credentials.
#[derive(Clone)]
pub struct WatchConfig {
    email: EmailAddress,
    password: SecretString,
    /// IMAP server hostname.
    pub imap_host: String,
    /// IMAP server port (default: 993 for IMAPS).
    pub imap_port: u16,
    /// Mailbox to watch (default: `INBOX`).
    pub folder: String,
    /// Extraction rules, applied in declaration order.
    pub rules: Vec<PatternRule>,
    /// Endpoint receiving extracted params.
    pub callback_url: Url,
    /// Timeout configuration.
    pub timeouts: TimeoutConfig,
    /// Idle, fetch and polling behaviour.
    pub watch: WatchSettings,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
}

impl std::fmt::Debug for WatchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchConfig")
            .field("email", &self.email.as_str())
            .field("password", &"[REDACTED]")
            .field("imap_host", &self.imap_host)
            .field("imap_port", &self.imap_port)
            .field("folder", &self.folder)
            .field("rules", &self.rules)
            .field("callback_url", &self.callback_url.as_str())
            .field("timeouts", &self.timeouts)
            .field("watch", &self.watch)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

impl WatchConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> WatchConfigBuilder {
        WatchConfigBuilder::default()
    }

    /// Returns the email address (login name) as a string slice.
    #[must_use]
    pub fn email(&self) -> &str {
        self.email.as_str()
    }

    /// Returns the password as a string slice.
    ///
    /// Only the session layer should need this.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Returns the full IMAP server address as "host:port".
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.imap_host, self.imap_port)
    }

    /// Decodes a [`ServiceConfig`] JSON document into a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigDocument`] for malformed JSON and the builder's
    /// validation errors for invalid values.
    pub fn from_json(document: &str) -> Result<Self> {
        let service: ServiceConfig =
            serde_json::from_str(document).map_err(|source| Error::ConfigDocument { source })?;
        Self::try_from(service)
    }
}

/// Timeout configuration for mail server operations and delivery.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout for establishing TCP/TLS connection.
    pub connect: Duration,
    /// Timeout for IMAP authentication.
    pub auth: Duration,
    /// Timeout for selecting (or refreshing) a mailbox.
    pub select: Duration,
    /// Timeout for starting a message fetch.
    pub fetch: Duration,
    /// Timeout for the NOOP health check.
    pub health: Duration,
    /// Timeout for logout operation.
    pub logout: Duration,
    /// Timeout for one callback request.
    pub delivery: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            auth: Duration::from_secs(30),
            select: Duration::from_secs(10),
            fetch: Duration::from_secs(30),
            health: Duration::from_secs(10),
            logout: Duration::from_secs(5),
            delivery: Duration::from_secs(30),
        }
    }
}

/// Idle, fetch and polling behaviour of the watch loop.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    /// How long one IDLE wait lasts before it is renewed.
    pub idle_timeout: Duration,
    /// How many of the most recent messages are fetched per change.
    pub fetch_count: u32,
    /// Polling interval used when the server lacks IDLE.
    pub poll_interval: Duration,
    /// Capacity of the queue holding change events not yet processed.
    pub event_queue: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300), // 5 minutes
            fetch_count: 5,
            poll_interval: Duration::from_secs(60),
            event_queue: 16,
        }
    }
}

/// Exponential backoff applied when (re)connecting fails with a retryable error.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts per reconnect, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Returns the delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Validates an email address format.
fn validate_email(email: &str) -> Result<EmailAddress> {
    EmailAddress::parse_with_options(email, email_address::Options::default()).map_err(|_| {
        Error::InvalidEmailFormat {
            email: email.to_string(),
        }
    })
}

/// Parses the callback endpoint, accepting only absolute http(s) URLs.
fn validate_callback(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::InvalidConfig {
        message: format!("callback url '{raw}' is invalid: {e}"),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::InvalidConfig {
            message: format!("callback url scheme '{other}' is not http(s)"),
        }),
    }
}

/// Builder for [`WatchConfig`].
#[derive(Debug, Default)]
pub struct WatchConfigBuilder {
    email: Option<String>,
    password: Option<String>,
    imap_host: Option<String>,
    imap_port: Option<u16>,
    folder: Option<String>,
    rules: Vec<PatternRule>,
    callback_url: Option<String>,
    timeouts: Option<TimeoutConfig>,
    watch: Option<WatchSettings>,
    reconnect: Option<ReconnectPolicy>,
}

impl WatchConfigBuilder {
    /// Sets the email address used as login name (required).
    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the password (required).
    ///
    /// For Gmail/Outlook, use an app-specific password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the IMAP server hostname (required).
    #[must_use]
    pub fn imap_host(mut self, host: impl Into<String>) -> Self {
        self.imap_host = Some(host.into());
        self
    }

    /// Sets the IMAP server port.
    ///
    /// Default is 993 (IMAPS with TLS).
    #[must_use]
    pub fn imap_port(mut self, port: u16) -> Self {
        self.imap_port = Some(port);
        self
    }

    /// Sets the mailbox to watch. Default is `INBOX`.
    #[must_use]
    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Appends one extraction rule.
    #[must_use]
    pub fn rule(mut self, rule: PatternRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Appends several extraction rules, keeping their order.
    #[must_use]
    pub fn rules(mut self, rules: impl IntoIterator<Item = PatternRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Sets the callback endpoint (required).
    #[must_use]
    pub fn callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Sets timeout configuration.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .connect = timeout;
        self
    }

    /// Sets the callback request timeout.
    #[must_use]
    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .delivery = timeout;
        self
    }

    /// Sets watch loop behaviour.
    #[must_use]
    pub fn watch(mut self, watch: WatchSettings) -> Self {
        self.watch = Some(watch);
        self
    }

    /// Sets how long one IDLE wait lasts before being renewed.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.watch
            .get_or_insert_with(WatchSettings::default)
            .idle_timeout = timeout;
        self
    }

    /// Sets how many recent messages are fetched per change.
    #[must_use]
    pub fn fetch_count(mut self, count: u32) -> Self {
        self.watch
            .get_or_insert_with(WatchSettings::default)
            .fetch_count = count;
        self
    }

    /// Sets the polling interval used without IDLE support.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.watch
            .get_or_insert_with(WatchSettings::default)
            .poll_interval = interval;
        self
    }

    /// Sets the reconnect backoff policy.
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or invalid.
    pub fn build(self) -> Result<WatchConfig> {
        let email_raw = self.email.ok_or_else(|| Error::InvalidConfig {
            message: "email is required".into(),
        })?;
        let email = validate_email(&email_raw)?;

        let password_raw = self.password.ok_or_else(|| Error::InvalidConfig {
            message: "password is required".into(),
        })?;

        let imap_host = self
            .imap_host
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::InvalidConfig {
                message: "imap host is required".into(),
            })?;

        let imap_port = self.imap_port.unwrap_or(993);
        if imap_port == 0 {
            return Err(Error::InvalidConfig {
                message: "imap port must be non-zero".into(),
            });
        }

        let folder = self
            .folder
            .filter(|folder| !folder.is_empty())
            .unwrap_or_else(|| "INBOX".to_string());

        if let Some(rule) = self.rules.iter().find(|rule| rule.param_name.is_empty()) {
            return Err(Error::InvalidConfig {
                message: format!("rule with pattern '{}' has no param name", rule.regex),
            });
        }

        let callback_raw = self.callback_url.ok_or_else(|| Error::InvalidConfig {
            message: "callback url is required".into(),
        })?;
        let callback_url = validate_callback(&callback_raw)?;

        let watch = self.watch.unwrap_or_default();
        if watch.fetch_count == 0 {
            return Err(Error::InvalidConfig {
                message: "fetch count must be at least 1".into(),
            });
        }
        if watch.event_queue == 0 {
            return Err(Error::InvalidConfig {
                message: "event queue capacity must be at least 1".into(),
            });
        }

        Ok(WatchConfig {
            email,
            password: SecretString::from(password_raw),
            imap_host,
            imap_port,
            folder,
            rules: self.rules,
            callback_url,
            timeouts: self.timeouts.unwrap_or_default(),
            watch,
            reconnect: self.reconnect.unwrap_or_default(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control surface document
// ─────────────────────────────────────────────────────────────────────────────

/// Mail server settings as sent by the control surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSettings {
    /// IMAP server hostname.
    pub imap_address: String,
    /// IMAP server port.
    pub imap_port: u16,
    /// Login email address.
    pub email: String,
    /// Login password.
    pub password: String,
    /// Mailbox to watch.
    #[serde(default)]
    pub folder: String,
}

/// The JSON document the control surface posts to start a watch.
///
/// ```
/// use email_dispatch::WatchConfig;
///
/// let config = WatchConfig::from_json(r#"{
///     "emailSettings": {
///         "imapAddress": "imap.example.com",
///         "imapPort": 993,
///         "email": "user@example.com",
///         "password": "secret",
///         "folder": "INBOX"
///     },
///     "contentPatterns": [{"param": "code", "regex": "[0-9]{6}", "require": true}],
///     "callbackUrl": "https://hooks.example.com/otp"
/// }"#).expect("valid document");
///
/// assert_eq!(config.rules[0].param_name, "code");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Mail server settings.
    pub email_settings: EmailSettings,
    /// Extraction rules in declaration order.
    #[serde(default)]
    pub content_patterns: Vec<PatternRule>,
    /// Endpoint receiving extracted params.
    pub callback_url: String,
}

impl TryFrom<ServiceConfig> for WatchConfig {
    type Error = Error;

    fn try_from(service: ServiceConfig) -> Result<Self> {
        let settings = service.email_settings;

        WatchConfig::builder()
            .imap_host(settings.imap_address)
            .imap_port(settings.imap_port)
            .email(settings.email)
            .password(settings.password)
            .folder(settings.folder)
            .rules(service.content_patterns)
            .callback_url(service.callback_url)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> WatchConfigBuilder {
        WatchConfig::builder()
            .email("user@example.com")
            .password("secret")
            .imap_host("imap.example.com")
            .callback_url("http://localhost:8080/hook")
    }

    #[test]
    fn test_builder_minimal() {
        let config = minimal().build().unwrap();

        assert_eq!(config.email(), "user@example.com");
        assert_eq!(config.password(), "secret");
        assert_eq!(config.imap_port, 993);
        assert_eq!(config.folder, "INBOX");
        assert!(config.rules.is_empty());
        assert_eq!(config.watch.fetch_count, 5);
        assert_eq!(config.watch.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_builder_full() {
        let config = minimal()
            .imap_port(994)
            .folder("Receipts")
            .rule(PatternRule::required("code", r"\d{6}"))
            .rule(PatternRule::optional("link", r"https://\S+"))
            .connect_timeout(Duration::from_secs(60))
            .idle_timeout(Duration::from_secs(120))
            .fetch_count(10)
            .build()
            .unwrap();

        assert_eq!(config.imap_port, 994);
        assert_eq!(config.folder, "Receipts");
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].param_name, "code");
        assert_eq!(config.rules[1].param_name, "link");
        assert_eq!(config.timeouts.connect, Duration::from_secs(60));
        assert_eq!(config.watch.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.watch.fetch_count, 10);
        assert_eq!(config.server_address(), "imap.example.com:994");
    }

    #[test]
    fn test_builder_missing_fields() {
        assert!(WatchConfig::builder()
            .password("secret")
            .imap_host("imap.example.com")
            .callback_url("http://localhost/hook")
            .build()
            .is_err());
        assert!(WatchConfig::builder()
            .email("user@example.com")
            .password("secret")
            .callback_url("http://localhost/hook")
            .build()
            .is_err());
        assert!(WatchConfig::builder()
            .email("user@example.com")
            .password("secret")
            .imap_host("imap.example.com")
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_invalid_email() {
        let result = minimal().email("invalid-email").build();
        assert!(matches!(result, Err(Error::InvalidEmailFormat { .. })));
    }

    #[test]
    fn test_builder_rejects_non_http_callback() {
        let result = minimal().callback_url("ftp://example.com/drop").build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));

        let result = minimal().callback_url("not a url").build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_builder_rejects_zero_fetch_count() {
        let result = minimal().fetch_count(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_unnamed_rule() {
        let result = minimal().rule(PatternRule::optional("", "x")).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_password_not_in_debug() {
        let config = minimal().password("super-secret-password").build().unwrap();

        let debug_str = format!("{config:?}");
        assert!(!debug_str.contains("super-secret-password"));
        assert!(debug_str.contains("[REDACTED]"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
        };

        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
    }

    #[test]
    fn test_from_json_document() {
        let config = WatchConfig::from_json(
            r#"{
                "emailSettings": {
                    "imapAddress": "imap.example.com",
                    "imapPort": 143,
                    "email": "user@example.com",
                    "password": "secret",
                    "folder": ""
                },
                "contentPatterns": [
                    {"param": "code", "regex": "[0-9]{6}", "require": true},
                    {"param": "sender", "regex": "from \\w+"}
                ],
                "callbackUrl": "https://hooks.example.com/otp"
            }"#,
        )
        .unwrap();

        assert_eq!(config.imap_port, 143);
        assert_eq!(config.folder, "INBOX");
        assert_eq!(
            config.rules,
            vec![
                PatternRule::required("code", "[0-9]{6}"),
                PatternRule::optional("sender", "from \\w+"),
            ]
        );
        assert_eq!(config.callback_url.as_str(), "https://hooks.example.com/otp");
    }

    #[test]
    fn test_from_json_malformed() {
        let result = WatchConfig::from_json("{\"emailSettings\": 3}");
        assert!(matches!(result, Err(Error::ConfigDocument { .. })));
    }
}
