//! Input validation for desired rules
//!
//! Every check runs before any command is sent to `iptables`, so a rejected
//! rule never leaves a chain half-changed.

use crate::core::rule::{has_ordering_prefix, is_unmanaged_name, strip_negation};

/// Kernel limit for `-m comment` text.
const MAX_COMMENT_LEN: usize = 256;

/// Kernel limit for `--log-prefix`.
const MAX_LOG_PREFIX_LEN: usize = 29;

/// Validates a rule name.
///
/// # Errors
///
/// Returns `Err` if:
/// - The name lacks a decimal ordering prefix followed by printable text
/// - The name has the shape reserved for unmanaged rules
/// - The name does not fit in a comment
///
/// # Examples
///
/// ```
/// use iptsync::validators::validate_rule_name;
///
/// assert!(validate_rule_name("100 allow ssh").is_ok());
/// assert!(validate_rule_name("allow ssh").is_err());
/// ```
pub fn validate_rule_name(name: &str) -> Result<(), String> {
    if name.len() > MAX_COMMENT_LEN {
        return Err(format!("Rule name too long (max {MAX_COMMENT_LEN} characters)"));
    }

    if !has_ordering_prefix(name) {
        return Err(format!(
            "Rule name '{name}' must start with a number followed by printable text, e.g. '100 allow ssh'"
        ));
    }

    if is_unmanaged_name(name) {
        return Err(format!(
            "Rule name '{name}' has the form reserved for unmanaged rules (9nnn <md5>)"
        ));
    }

    Ok(())
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates one element of a port list: a number, a `a-b` range or a
/// service name, optionally negated.
///
/// # Errors
///
/// Returns `Err` if a numeric port or range is out of bounds or malformed.
pub fn validate_port_entry(entry: &str) -> Result<(), String> {
    let entry = strip_negation(entry).unwrap_or(entry);

    if let Some((start, end)) = entry.split_once('-')
        && !start.is_empty()
        && start.chars().all(|c| c.is_ascii_digit())
    {
        let parse = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| format!("Invalid port range '{entry}'"))
        };
        validate_port_range(parse(start)?, parse(end)?)?;
        return Ok(());
    }

    if entry.chars().all(|c| c.is_ascii_digit()) {
        let port = entry
            .parse::<u16>()
            .map_err(|_| format!("Invalid port '{entry}'"))?;
        validate_port(port)?;
        return Ok(());
    }

    // Service name from /etc/services
    if !entry.is_empty()
        && entry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Ok(());
    }

    Err(format!("Invalid port '{entry}'"))
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// A trailing `+` is the iptables wildcard and is accepted.
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Ok(String::new());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    let stem = name.strip_suffix('+').unwrap_or(name);
    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a `--log-prefix` value.
///
/// # Errors
///
/// Returns `Err` if:
/// - Prefix is empty
/// - Prefix exceeds 29 characters
/// - Prefix contains control characters
pub fn validate_log_prefix(prefix: &str) -> Result<String, String> {
    if prefix.is_empty() {
        return Err("Log prefix cannot be empty".to_string());
    }

    if prefix.len() > MAX_LOG_PREFIX_LEN {
        return Err(format!(
            "Log prefix too long (max {MAX_LOG_PREFIX_LEN} chars)"
        ));
    }

    if prefix.chars().any(char::is_control) {
        return Err("Log prefix contains control characters".to_string());
    }

    Ok(prefix.to_string())
}
