use thiserror::Error;

/// Core error types for portsync
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A discovery source could not be consulted (non-fatal, source is skipped)
    #[error("Discovery source '{source_name}' unavailable: {reason}")]
    DiscoverySourceUnavailable { source_name: String, reason: String },

    /// A rule store could not be reached; that store is skipped for this cycle
    #[error("{store} unreachable: {reason}")]
    StoreUnreachable { store: String, reason: String },

    /// Rule data from a store could not be parsed; nothing built on it is applied
    #[error("Invalid rule data from {store}: {reason}")]
    InvalidRuleData { store: String, reason: String },

    /// The store rejected the update; the raw cause is preserved
    #[error("{store} rejected the update: {cause}")]
    ApplyRejected { store: String, cause: String },

    /// The operator declined the proposed changes
    #[error("Confirmation declined")]
    ConfirmationDeclined,

    /// External command execution failed
    #[error("{program} failed: {message}")]
    Command {
        program: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// External call exceeded its time budget
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error in {field}: {message}")]
    Config { field: String, message: String },

    /// Another reconciliation cycle holds the run lock
    #[error("Another reconciliation cycle is already running")]
    Busy,

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether a single retry may succeed where the first attempt failed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::Io(_) => true,
            Error::Command { stderr, .. } => stderr.as_deref().is_some_and(|s| {
                let lower = s.to_lowercase();
                lower.contains("resource temporarily unavailable")
                    || lower.contains("another app is currently holding the xtables lock")
                    || lower.contains("device or resource busy")
            }),
            _ => false,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run as root, or configure sudo/run0 for iptables")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)");
        }

        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("The chain is created automatically on the next sync")
                .with_suggestion("List chains with: sudo iptables -S");
        }

        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Firewall is locked by another process")
                .with_suggestion("Another process may be modifying iptables")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("bad argument") || lower.contains("unknown option") {
            return ErrorTranslation::new("iptables rejected the rule arguments")
                .with_suggestion("Verify port numbers are between 1 and 65535")
                .with_suggestion("Check that the chain name is valid");
        }

        if lower.contains("timed out") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("Check system load: uptime")
                .with_suggestion("Increase command_timeout_secs in the configuration");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Verify iptables is working: sudo iptables -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
