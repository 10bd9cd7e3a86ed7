//! Rule data structures
//!
//! A [`Rule`] is either discovered by the parser from `iptables-save` output or
//! declared by the user as desired state. Both share one shape so that they can
//! be compared attribute by attribute.
//!
//! # Identity
//!
//! A rule's [`Rule::name`] is its identity. It travels through the live chain
//! as a comment (`-m comment --comment "<name>"`). Rules found on the host
//! without a usable comment get a synthetic name of the form
//! `<9000 + n> <md5 of the line>`, which sorts them after every managed rule
//! and is stable across runs because the hash is recomputed from the same
//! line.
//!
//! # Example
//!
//! ```
//! use iptsync::core::rule::{Rule, Value};
//! use iptsync::core::schema::Attribute;
//!
//! let rule: Rule = serde_json::from_str(
//!     r#"{ "name": "100 allow ssh", "dport": "22", "action": "accept" }"#,
//! )
//! .unwrap();
//! let rule = rule.normalized().unwrap();
//!
//! assert_eq!(rule.chain, "INPUT");
//! assert_eq!(
//!     rule.attributes.get(&Attribute::Dport),
//!     Some(&Value::List(vec!["22".to_string()]))
//! );
//! ```

use crate::core::dscp;
use crate::core::error::{Error, Result};
use crate::core::schema::Attribute;
use ipnetwork::IpNetwork;
use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// Offset added to the parse counter for synthetic names.
pub const UNMANAGED_BASE: usize = 9000;

/// Names given to rules without a usable comment: `9nnn <32 hex chars>`.
static UNMANAGED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^9[0-9]{3}\s[a-f0-9]{32}$").expect("valid unmanaged-name regex"));

/// Managed names start with a decimal ordering prefix.
static MANAGED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+[[:graph:][:space:]]+$").expect("valid managed-name regex")
});

static PRINTABLE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[[:graph:][:space:]]+").expect("valid printable regex"));

/// Returns `true` if `name` has the synthetic shape given to unmanaged rules.
pub fn is_unmanaged_name(name: &str) -> bool {
    UNMANAGED_NAME.is_match(name)
}

/// Returns `true` if `name` carries a decimal ordering prefix.
pub fn has_ordering_prefix(name: &str) -> bool {
    MANAGED_NAME.is_match(name)
}

/// Name for a rule discovered without a comment.
pub fn synthetic_name(counter: usize, line: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(line.as_bytes());
    format!("{} {:x}", UNMANAGED_BASE + counter, hasher.finalize())
}

/// Name for a rule whose comment lacks an ordering prefix.
///
/// Keeps the first printable run of the comment so the rule stays
/// recognisable; falls back to the content hash when nothing printable is left.
pub fn prefixed_name(counter: usize, comment: &str, line: &str) -> String {
    match PRINTABLE_RUN.find(comment) {
        Some(run) => format!("{} {}", UNMANAGED_BASE + counter, run.as_str()),
        None => synthetic_name(counter, line),
    }
}

/// Leading `!` marker, with any whitespace after it.
pub fn strip_negation(value: &str) -> Option<&str> {
    value.strip_prefix('!').map(str::trim_start)
}

/// Negation as written in rule values: `"! "` followed by the operand.
pub fn negate(value: &str) -> String {
    format!("! {value}")
}

/// Attribute value.
///
/// Negation is carried inside the strings as a leading `"! "`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    Bool(bool),
    Scalar(String),
    List(Vec<String>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Value::Bool(true))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Scalar(s) => write!(f, "{s}"),
            Value::List(items) => write!(f, "{}", items.join(",")),
        }
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = String;

    fn try_from(value: serde_json::Value) -> std::result::Result<Self, Self::Error> {
        fn scalar(v: serde_json::Value) -> std::result::Result<String, String> {
            match v {
                serde_json::Value::String(s) => Ok(s),
                serde_json::Value::Number(n) => Ok(n.to_string()),
                other => Err(format!("expected a string or number, found {other}")),
            }
        }

        match value {
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(scalar)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::List),
            other => scalar(other).map(Value::Scalar),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Scalar(s) => serde_json::Value::String(s),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::String).collect())
            }
        }
    }
}

/// Terminating verdicts that are expressed as `action` rather than `jump`.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[strum(serialize = "accept")]
    Accept,
    #[strum(serialize = "reject")]
    Reject,
    #[strum(serialize = "drop")]
    Drop,
}

impl Action {
    /// The `-j` target spelling.
    pub const fn as_jump(self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Reject => "REJECT",
            Action::Drop => "DROP",
        }
    }

    pub fn from_jump(jump: &str) -> Option<Self> {
        match jump {
            "ACCEPT" => Some(Action::Accept),
            "REJECT" => Some(Action::Reject),
            "DROP" => Some(Action::Drop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    #[default]
    Present,
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub ensure: Ensure,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_chain")]
    pub chain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Everything else, keyed in emission order.
    #[serde(flatten)]
    pub attributes: BTreeMap<Attribute, Value>,
    /// Raw dump line, only for rules discovered on the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    /// Set by the reconciler when any desired attribute differs.
    #[serde(skip)]
    pub needs_change: bool,
}

fn default_table() -> String {
    "filter".to_string()
}

fn default_chain() -> String {
    "INPUT".to_string()
}

impl Rule {
    pub fn new(name: impl Into<String>, table: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ensure: Ensure::Present,
            table: table.into(),
            chain: chain.into(),
            action: None,
            attributes: BTreeMap::new(),
            line: None,
            needs_change: false,
        }
    }

    pub fn with(mut self, attr: Attribute, value: Value) -> Self {
        self.attributes.insert(attr, value);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn get(&self, attr: Attribute) -> Option<&Value> {
        self.attributes.get(&attr)
    }

    /// Brings a desired rule into the form the parser produces.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - The name has no ordering prefix or uses the unmanaged shape
    /// - Both `action` and `jump` are set
    /// - A boolean attribute carries a non-boolean value
    /// - A list attribute is only partly negated
    /// - `set_dscp_class` is not a known class
    /// - An interface name, port or log prefix is invalid
    pub fn normalized(mut self) -> Result<Self> {
        crate::validators::validate_rule_name(&self.name)
            .map_err(|message| Error::validation("name", message))?;

        // ACCEPT/REJECT/DROP belong in `action`
        if let Some(Value::Scalar(jump)) = self.get(Attribute::Jump)
            && let Some(action) = Action::from_jump(jump)
        {
            if self.action.is_some_and(|a| a != action) {
                return Err(Error::validation(
                    "jump",
                    "Only one of the parameters 'action' and 'jump' can be set",
                ));
            }
            self.action = Some(action);
            self.attributes.remove(&Attribute::Jump);
        }
        if self.action.is_some()
            && (self.attributes.contains_key(&Attribute::Jump)
                || self.attributes.contains_key(&Attribute::Goto))
        {
            return Err(Error::validation(
                "action",
                "Only one of the parameters 'action' and 'jump' can be set",
            ));
        }

        self.attributes.entry(Attribute::Proto).or_insert_with(|| Value::Scalar("tcp".to_string()));

        let attributes = std::mem::take(&mut self.attributes);
        for (attr, value) in attributes {
            let value = normalize_value(attr, value)?;
            self.attributes.insert(attr, value);
        }

        if let Some(Value::Scalar(class)) = self.get(Attribute::SetDscpClass)
            && dscp::hex_for_class(class).is_none()
        {
            return Err(Error::validation(
                "set_dscp_class",
                format!("Unknown DSCP class '{class}'"),
            ));
        }

        for attr in [Attribute::Dport, Attribute::Sport, Attribute::Port] {
            if let Some(Value::List(items)) = self.get(attr) {
                for item in items {
                    crate::validators::validate_port_entry(item)
                        .map_err(|message| Error::validation(attr.as_ref(), message))?;
                }
            }
        }

        if let Some(Value::Scalar(prefix)) = self.get(Attribute::LogPrefix) {
            crate::validators::validate_log_prefix(prefix)
                .map_err(|message| Error::validation("log_prefix", message))?;
        }

        for attr in [Attribute::Iniface, Attribute::Outiface] {
            if let Some(Value::Scalar(iface)) = self.get(attr) {
                let bare = strip_negation(iface).unwrap_or(iface);
                crate::validators::validate_interface(bare)
                    .map_err(|message| Error::validation(attr.as_ref(), message))?;
            }
        }

        Ok(self)
    }

    /// Attributes of `self` (desired) that differ from `current`.
    ///
    /// Only attributes present in the desired rule are compared.
    pub fn differences(&self, current: &Rule) -> Vec<Attribute> {
        let mut changed: Vec<Attribute> = self
            .attributes
            .iter()
            .filter(|(attr, desired)| {
                let attr = **attr;
                match current.get(attr) {
                    Some(actual) => actual != *desired,
                    None if attr.is_boolean() => desired.is_true(),
                    None => true,
                }
            })
            .map(|(attr, _)| *attr)
            .collect();

        if self.action.is_some() && self.action != current.action {
            changed.push(Attribute::Jump);
        }

        changed
    }
}

/// Canonical form shared by parsed and desired values.
fn normalize_value(attr: Attribute, value: Value) -> Result<Value> {
    if attr.is_boolean() {
        return match value {
            Value::Bool(b) => Ok(Value::Bool(b)),
            Value::Scalar(s) if s == "true" => Ok(Value::Bool(true)),
            Value::Scalar(s) if s == "false" => Ok(Value::Bool(false)),
            other => Err(Error::validation(
                attr.as_ref(),
                format!("expected a boolean, found '{other}'"),
            )),
        };
    }

    let value = match (attr.is_list(), value) {
        (true, Value::Scalar(s)) => Value::List(split_joined(attr, &s)),
        (_, Value::Bool(b)) => Value::Scalar(b.to_string()),
        (_, other) => other,
    };

    let value = match value {
        Value::List(items) => {
            let items = if attr.is_range() {
                items.iter().map(|i| i.replace(':', "-")).collect()
            } else {
                items
            };
            let items = if attr.is_negatable() {
                negate_all_or_nothing(attr, items)?
            } else {
                items
            };
            let mut items = items;
            if attr.is_sorted_list() {
                items.sort();
            }
            Value::List(items)
        }
        Value::Scalar(s) => {
            let s = if attr.is_range() { s.replace(':', "-") } else { s };
            let s = if matches!(attr, Attribute::Source | Attribute::Destination) {
                normalize_address(&s)
            } else if attr == Attribute::Recent && !s.starts_with("--") {
                format!("--{s}")
            } else if attr.is_negatable()
                && let Some(rest) = strip_negation(&s)
            {
                negate(rest)
            } else {
                s
            };
            Value::Scalar(s)
        }
        other => other,
    };

    Ok(value)
}

/// Splits a joined list value such as `"! 80,443"`.
///
/// A leading `!` on the joined form negates every element.
pub fn split_joined(attr: Attribute, value: &str) -> Vec<String> {
    let separator = if attr == Attribute::Ipset { ';' } else { ',' };
    let split = |v: &str| -> Vec<String> {
        v.split(separator)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    };

    match strip_negation(value) {
        Some(rest) if attr.is_negatable() => split(rest).iter().map(|v| negate(v)).collect(),
        _ => split(value),
    }
}

/// A negated list must negate every element.
pub fn negate_all_or_nothing(attr: Attribute, items: Vec<String>) -> Result<Vec<String>> {
    if !items.iter().any(|i| is_spaced_negation(i)) {
        return Ok(items);
    }

    let offending: Vec<String> = items
        .iter()
        .filter(|i| !is_spaced_negation(i))
        .cloned()
        .collect();
    if !offending.is_empty() {
        return Err(Error::MixedNegation {
            attribute: attr.to_string(),
            offending,
        });
    }

    Ok(items
        .iter()
        .map(|i| negate(strip_negation(i).unwrap_or(i)))
        .collect())
}

/// `!` followed by whitespace, the only form that counts as list negation.
pub fn is_spaced_negation(value: &str) -> bool {
    value
        .strip_prefix('!')
        .and_then(|rest| rest.chars().next())
        .is_some_and(char::is_whitespace)
}

/// Normalises an address to CIDR notation, keeping any negation.
///
/// Values that are not addresses (host names) are returned unchanged.
pub fn normalize_address(value: &str) -> String {
    let (negated, bare) = match strip_negation(value) {
        Some(rest) => (true, rest),
        None => (false, value),
    };

    let normalized = match bare.parse::<IpNetwork>() {
        Ok(net) => match IpNetwork::new(net.network(), net.prefix()) {
            Ok(masked) => masked.to_string(),
            Err(_) => net.to_string(),
        },
        Err(_) => bare.to_string(),
    };

    if negated {
        negate(&normalized)
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_name_shape() {
        let name = synthetic_name(1, "-A INPUT -j ACCEPT");
        assert!(name.starts_with("9001 "));
        assert!(is_unmanaged_name(&name));
        assert_eq!(synthetic_name(1, "-A INPUT -j ACCEPT"), name);
        assert_ne!(synthetic_name(1, "-A INPUT -j DROP"), name);
    }

    #[test]
    fn test_prefixed_name_keeps_comment() {
        let name = prefixed_name(3, "docker rule", "-A FORWARD -j DOCKER");
        assert_eq!(name, "9003 docker rule");
        assert!(!is_unmanaged_name(&name));
    }

    #[test]
    fn test_ordering_prefix() {
        assert!(has_ordering_prefix("100 allow ssh"));
        assert!(has_ordering_prefix("12"));
        assert!(!has_ordering_prefix("allow ssh"));
        assert!(!has_ordering_prefix("1"));
        assert!(!has_ordering_prefix("100 tab\u{7}bell"));
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("1.2.3.4"), "1.2.3.4/32");
        assert_eq!(normalize_address("10.1.2.3/8"), "10.0.0.0/8");
        assert_eq!(normalize_address("! 192.168.0.0/16"), "! 192.168.0.0/16");
        assert_eq!(normalize_address("!192.168.1.1"), "! 192.168.1.1/32");
        assert_eq!(normalize_address("example.com"), "example.com");
    }

    #[test]
    fn test_negate_all_or_nothing() {
        let ok = negate_all_or_nothing(
            Attribute::Dport,
            vec!["! 80".to_string(), "! 443".to_string()],
        )
        .unwrap();
        assert_eq!(ok, vec!["! 80", "! 443"]);

        assert_eq!(split_joined(Attribute::Dport, "! 80,443"), vec!["! 80", "! 443"]);
        assert_eq!(
            split_joined(Attribute::Ipset, "! blacklist src;whitelist dst"),
            vec!["! blacklist src", "whitelist dst"]
        );

        let err = negate_all_or_nothing(
            Attribute::Dport,
            vec!["22".to_string(), "! 80".to_string(), "443".to_string()],
        )
        .unwrap_err();
        match err {
            Error::MixedNegation { attribute, offending } => {
                assert_eq!(attribute, "dport");
                assert_eq!(offending, vec!["22", "443"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_value_from_json() {
        let v: Value = serde_json::from_str("80").unwrap();
        assert_eq!(v, Value::Scalar("80".to_string()));
        let v: Value = serde_json::from_str(r#"["80", 443]"#).unwrap();
        assert_eq!(v, Value::List(vec!["80".to_string(), "443".to_string()]));
        let v: Value = serde_json::from_str("true").unwrap();
        assert_eq!(v, Value::Bool(true));
        assert!(serde_json::from_str::<Value>("null").is_err());
    }

    #[test]
    fn test_normalized_moves_verdict_jump_into_action() {
        let rule = Rule::new("100 test", "filter", "INPUT")
            .with(Attribute::Jump, Value::Scalar("DROP".to_string()))
            .normalized()
            .unwrap();
        assert_eq!(rule.action, Some(Action::Drop));
        assert!(rule.get(Attribute::Jump).is_none());
        assert_eq!(rule.get(Attribute::Proto), Some(&Value::Scalar("tcp".to_string())));
    }

    #[test]
    fn test_normalized_rejects_action_with_jump() {
        let err = Rule::new("100 test", "filter", "INPUT")
            .with(Attribute::Jump, Value::Scalar("LOG".to_string()))
            .with_action(Action::Accept)
            .normalized()
            .unwrap_err();
        assert!(err.to_string().contains("Only one of"));
    }

    #[test]
    fn test_normalized_rejects_bad_names() {
        assert!(Rule::new("allow ssh", "filter", "INPUT").normalized().is_err());
        let reserved = synthetic_name(1, "-A INPUT -j ACCEPT");
        assert!(Rule::new(reserved, "filter", "INPUT").normalized().is_err());
    }

    #[test]
    fn test_normalized_rule_values() {
        let rule = Rule::new("100 test", "filter", "INPUT")
            .with(Attribute::Dport, Value::Scalar("8000:8080,22".to_string()))
            .with(Attribute::State, Value::List(vec!["NEW".into(), "ESTABLISHED".into()]))
            .with(Attribute::Source, Value::Scalar("10.0.0.1".to_string()))
            .with(Attribute::Socket, Value::Scalar("true".to_string()))
            .with(Attribute::Recent, Value::Scalar("set".to_string()))
            .normalized()
            .unwrap();

        assert_eq!(
            rule.get(Attribute::Dport),
            Some(&Value::List(vec!["8000-8080".into(), "22".into()]))
        );
        assert_eq!(
            rule.get(Attribute::State),
            Some(&Value::List(vec!["ESTABLISHED".into(), "NEW".into()]))
        );
        assert_eq!(
            rule.get(Attribute::Source),
            Some(&Value::Scalar("10.0.0.1/32".into()))
        );
        assert_eq!(rule.get(Attribute::Socket), Some(&Value::Bool(true)));
        assert_eq!(rule.get(Attribute::Recent), Some(&Value::Scalar("--set".into())));
    }

    #[test]
    fn test_normalized_negated_scalars() {
        let rule = Rule::new("100 test", "filter", "INPUT")
            .with(Attribute::Proto, Value::Scalar("!udp".to_string()))
            .with(Attribute::SrcType, Value::Scalar("!  LOCAL".to_string()))
            .with(Attribute::SrcRange, Value::Scalar("!10.0.0.1-10.0.0.9".to_string()))
            .with(Attribute::Iniface, Value::Scalar("eth0".to_string()))
            .normalized()
            .unwrap();

        assert_eq!(rule.get(Attribute::Proto), Some(&Value::Scalar("! udp".into())));
        assert_eq!(rule.get(Attribute::SrcType), Some(&Value::Scalar("! LOCAL".into())));
        assert_eq!(
            rule.get(Attribute::SrcRange),
            Some(&Value::Scalar("! 10.0.0.1-10.0.0.9".into()))
        );
        assert_eq!(rule.get(Attribute::Iniface), Some(&Value::Scalar("eth0".into())));
    }

    #[test]
    fn test_normalized_rejects_unknown_dscp_class() {
        let err = Rule::new("100 test", "mangle", "OUTPUT")
            .with(Attribute::SetDscpClass, Value::Scalar("gold".to_string()))
            .normalized()
            .unwrap_err();
        assert!(err.to_string().contains("gold"));
    }

    #[test]
    fn test_differences() {
        let desired = Rule::new("100 test", "filter", "INPUT")
            .with(Attribute::Dport, Value::List(vec!["22".into()]))
            .with(Attribute::Socket, Value::Bool(false))
            .with_action(Action::Accept);
        let mut current = desired.clone();
        current
            .attributes
            .insert(Attribute::Proto, Value::Scalar("all".into()));
        current.attributes.remove(&Attribute::Socket);
        assert!(desired.differences(&current).is_empty());

        current.action = Some(Action::Drop);
        current
            .attributes
            .insert(Attribute::Dport, Value::List(vec!["23".into()]));
        assert_eq!(
            desired.differences(&current),
            vec![Attribute::Dport, Attribute::Jump]
        );
    }
}
