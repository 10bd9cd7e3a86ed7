use thiserror::Error;

/// Core error types for iptsync
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A boolean flag in the dump carried a value.
    ///
    /// Means the dump format changed under us or a normalization pass is
    /// wrong; the line cannot be trusted.
    #[error("Parser error: {attribute} was meant to be a boolean but received value: {value}.")]
    Parse { attribute: String, value: String },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// A list value was only partly inverted
    #[error(
        "All values of the '{attribute}' property must be prefixed with a '!' when inverting, but '{}' {} not prefixed; aborting",
        quoted_list(.offending),
        plural_verb(.offending)
    )]
    MixedNegation {
        attribute: String,
        offending: Vec<String>,
    },

    /// iptables command execution failed
    #[error("iptables error: {message}")]
    Iptables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn quoted_list(values: &[String]) -> String {
    values.join("', '")
}

fn plural_verb(values: &[String]) -> &'static str {
    if values.len() > 1 { "are" } else { "is" }
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run as root or configure sudo/run0 for iptables")
                .with_suggestion("Set IPTSYNC_ELEVATION_METHOD to force an elevation method")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // Missing binary
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or point the `iptables` config key at the binary")
                .with_help("https://www.netfilter.org/projects/iptables/index.html");
        }

        // Delete of a rule that is not there
        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("The rule to delete no longer matches anything on the host")
                .with_suggestion("Another tool may have changed the chain in the meantime")
                .with_suggestion("Run `iptsync parse` to inspect the current rules");
        }

        // Missing chain, target or match module
        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Chain, jump target or match module not found")
                .with_suggestion("Create custom chains before adding rules that jump to them")
                .with_suggestion("Check that the kernel module for the match is loaded")
                .with_suggestion("Verify the table is correct (filter, nat, mangle, raw)");
        }

        // Position beyond end of chain
        if lower.contains("index of insertion too big") || lower.contains("index of replacement too big") {
            return ErrorTranslation::new("Rule position is beyond the end of the chain")
                .with_suggestion("The chain changed between listing and inserting")
                .with_suggestion("Run the reconciliation again to recompute positions");
        }

        // Table errors
        if lower.contains("can't initialize iptables table") || lower.contains("table does not exist") {
            return ErrorTranslation::new("Firewall table does not exist")
                .with_suggestion("Load the table module, e.g.: sudo modprobe iptable_nat")
                .with_suggestion("Check the table name for typos");
        }

        // Lock contention
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("Another firewall manager may be modifying rules")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion(
                    "Check for conflicting firewall managers: sudo systemctl status firewalld ufw",
                );
        }

        // Syntax errors
        if lower.contains("unknown option") || lower.contains("bad argument") || lower.contains("invalid") {
            return ErrorTranslation::new("Invalid rule arguments")
                .with_suggestion("Check attribute values for typos")
                .with_suggestion("Port ranges use a hyphen: 8000-9000")
                .with_suggestion("Verify the match module is available in your iptables build")
                .with_help("https://ipset.netfilter.org/iptables-extensions.man.html");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables-save")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
