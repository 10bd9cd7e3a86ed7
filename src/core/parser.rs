//! `iptables-save` parser
//!
//! Parsing a rule line happens in two phases:
//!
//! 1. [`normalize_line`] rewrites the dump constructs that do not follow the
//!    "flag then one value" shape.
//! 2. Flag discovery and extraction: every attribute flag present on the line
//!    is located, the flags are removed from last to first, and what remains
//!    is the chain followed by one value token per removed flag, in order.
//!
//! Extraction runs from the last flag to the first so that removing a flag
//! never shifts the position of a flag that is still to be removed.

use crate::core::dscp;
use crate::core::error::{Error, Result};
use crate::core::normalize::normalize_line;
use crate::core::rule::{
    Action, Rule, Value, has_ordering_prefix, negate, normalize_address, prefixed_name,
    split_joined, strip_negation, synthetic_name,
};
use crate::core::schema::{Attribute, BOOLEANS, FlagMap};
use regex::Regex;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::LazyLock;
use tracing::{debug, trace};

/// A double-quoted token (with backslash escapes) or a bare word.
static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(?:[^"\\]|\\.)*"|\S+"#).expect("valid token regex"));

static ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\\(\\|'|")"#).expect("valid escape regex"));

/// Synthetic value appended to presence-only flags.
const BOOLEAN_MARKER: &str = "true";

/// Default `--log-level` omitted by the tool.
const DEFAULT_LOG_LEVEL: &str = "4";

/// Default `--limit-burst` omitted by the tool.
const DEFAULT_BURST: &str = "5";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Attr(Attribute),
    Chain,
}

/// Parses a full `iptables-save` dump into rules, in on-host order.
///
/// Header, comment, chain-policy and `COMMIT` lines are skipped. The counter
/// used for synthetic names starts at 1 and counts rule lines across every
/// table.
///
/// # Errors
///
/// Returns `Err` if any rule line carries a non-boolean value on a
/// presence-only flag.
pub fn parse_dump(dump: &str, flags: &FlagMap) -> Result<Vec<Rule>> {
    let mut table = "filter".to_string();
    let mut counter = 1;
    let mut rules = Vec::new();

    for line in dump.lines() {
        let line = line.trim_end();
        if line.is_empty()
            || line.starts_with('#')
            || line.starts_with(':')
            || line.starts_with("COMMIT")
            || line.starts_with("FATAL")
        {
            continue;
        }

        if let Some(name) = line.strip_prefix('*') {
            table = name.to_string();
            continue;
        }

        if !line.starts_with("-A ") {
            trace!("Skipping non-rule line: {line}");
            continue;
        }

        rules.push(parse_rule(line, &table, counter, flags)?);
        counter += 1;
    }

    debug!("Parsed {} rule(s) from dump", rules.len());
    Ok(rules)
}

/// Parses a single `-A <chain> ...` line.
///
/// # Errors
///
/// Returns [`Error::Parse`] if a presence-only flag carries a value other
/// than the synthetic boolean marker.
pub fn parse_rule(line: &str, table: &str, counter: usize, flags: &FlagMap) -> Result<Rule> {
    let values = normalize_line(line);
    let flags = flags.expand_for_line(&values);
    let mut values = mark_booleans(values, &flags);

    let order = discover(&values, &flags);

    let mut keys = Vec::with_capacity(order.len() + 1);
    for &attr in order.iter().rev() {
        for opt in flags.spellings(attr) {
            if remove_flag(&mut values, opt) {
                keys.push(Key::Attr(attr));
                break;
            }
        }
    }

    let values = values.replacen("-A", "", 1);
    keys.push(Key::Chain);

    let tokens: Vec<String> = TOKEN
        .find_iter(&values)
        .map(|m| unquote(m.as_str()))
        .collect();

    let mut chain = String::new();
    let mut raw: BTreeMap<Attribute, String> = BTreeMap::new();
    for (key, value) in keys.into_iter().zip(tokens.into_iter().rev()) {
        match key {
            Key::Chain => chain = value,
            Key::Attr(attr) => {
                raw.insert(attr, value);
            }
        }
    }

    let mut rule = build_rule(raw, line, table, counter)?;
    rule.chain = chain;
    Ok(rule)
}

/// Appends the boolean marker to every presence-only flag on the line.
fn mark_booleans(mut values: String, flags: &FlagMap) -> String {
    for &attr in BOOLEANS {
        let flag = flags.preferred(attr);
        if let Some(start) = find_flag(&values, flag, true) {
            let end = start + flag.len();
            values.insert_str(end, &format!(" {BOOLEAN_MARKER}"));
        }
    }
    values
}

/// Attributes present on the line, ordered by where their flag occurs.
fn discover(values: &str, flags: &FlagMap) -> Vec<Attribute> {
    let mut found: BTreeMap<Attribute, usize> = BTreeMap::new();

    for (attr, spellings) in flags.iter() {
        if attr.discovery_context().is_some_and(|ctx| !values.contains(ctx)) {
            continue;
        }
        for flag in spellings {
            if let Some(index) = find_flag(values, flag, false) {
                found.insert(attr, index);
            }
        }
    }

    let mut order: Vec<(usize, Attribute)> = found.into_iter().map(|(a, i)| (i, a)).collect();
    order.sort();
    order.into_iter().map(|(_, attr)| attr).collect()
}

/// Removes the first occurrence of `flag` together with the whitespace
/// before it.
fn remove_flag(values: &mut String, flag: &str) -> bool {
    let Some(start) = find_flag(values, flag, true) else {
        return false;
    };
    let ws = values[..start]
        .chars()
        .next_back()
        .map_or(0, char::len_utf8);
    values.replace_range(start - ws..start + flag.len(), "");
    true
}

/// Byte offset of the first occurrence of `flag` that stands as whole words
/// outside any quoted token.
///
/// The flag must be preceded by whitespace and followed by whitespace (or,
/// with `allow_end`, the end of the line).
fn find_flag(values: &str, flag: &str, allow_end: bool) -> Option<usize> {
    if flag.is_empty() {
        return None;
    }
    let quoted = quoted_spans(values);

    values.match_indices(flag).map(|(i, _)| i).find(|&i| {
        let before = values[..i].chars().next_back();
        let after = values[i + flag.len()..].chars().next();
        before.is_some_and(char::is_whitespace)
            && after.map_or(allow_end, char::is_whitespace)
            && !quoted.iter().any(|span| span.contains(&i))
    })
}

fn quoted_spans(values: &str) -> Vec<Range<usize>> {
    TOKEN
        .find_iter(values)
        .filter(|m| m.as_str().starts_with('"'))
        .map(|m| m.range())
        .collect()
}

fn unquote(token: &str) -> String {
    match token
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) => ESCAPE.replace_all(inner, "$1").into_owned(),
        None => token.to_string(),
    }
}

/// Post-processing from raw extracted strings to a [`Rule`].
fn build_rule(
    mut raw: BTreeMap<Attribute, String>,
    line: &str,
    table: &str,
    counter: usize,
) -> Result<Rule> {
    let comment = raw.remove(&Attribute::Name);
    raw.remove(&Attribute::Table);

    if let Some(class) = raw
        .get(&Attribute::SetDscp)
        .and_then(|hex| dscp::class_for_hex(hex))
    {
        raw.insert(Attribute::SetDscpClass, class.to_string());
    }

    let mut attributes = BTreeMap::new();
    for (attr, value) in raw {
        attributes.insert(attr, convert_value(attr, value)?);
    }

    let name = match comment {
        None => synthetic_name(counter, line),
        Some(comment) if !has_ordering_prefix(&comment) => prefixed_name(counter, &comment, line),
        Some(comment) => comment,
    };

    let jump = attributes
        .get(&Attribute::Jump)
        .and_then(Value::as_scalar)
        .map(String::from);

    if jump.as_deref() == Some("LOG") {
        attributes
            .entry(Attribute::LogLevel)
            .or_insert_with(|| Value::Scalar(DEFAULT_LOG_LEVEL.to_string()));
    }
    if attributes.contains_key(&Attribute::Limit) {
        attributes
            .entry(Attribute::Burst)
            .or_insert_with(|| Value::Scalar(DEFAULT_BURST.to_string()));
    }

    attributes
        .entry(Attribute::Proto)
        .or_insert_with(|| Value::Scalar("all".to_string()));

    let mut rule = Rule::new(name, table, "");
    rule.line = Some(line.to_string());

    if let Some(action) = jump.as_deref().and_then(Action::from_jump) {
        attributes.remove(&Attribute::Jump);
        rule.action = Some(action);
    }
    rule.attributes = attributes;

    Ok(rule)
}

fn convert_value(attr: Attribute, value: String) -> Result<Value> {
    if attr.is_boolean() {
        if value != BOOLEAN_MARKER {
            return Err(Error::Parse {
                attribute: attr.to_string(),
                value,
            });
        }
        return Ok(Value::Bool(true));
    }

    if attr.is_list() {
        let mut items = split_joined(attr, &value);
        if attr.is_range() {
            items = items.iter().map(|i| i.replace(':', "-")).collect();
        }
        // One negated element negates the whole list
        if attr.is_negatable() && items.iter().any(|i| strip_negation(i).is_some()) {
            items = items
                .iter()
                .map(|i| negate(strip_negation(i).unwrap_or(i)))
                .collect();
        }
        if attr.is_sorted_list() {
            items.sort();
        }
        return Ok(Value::List(items));
    }

    let value = if attr.is_range() {
        value.replace(':', "-")
    } else {
        value
    };

    let value = match attr {
        Attribute::Source | Attribute::Destination => normalize_address(&value),
        _ if attr.is_negatable() => match strip_negation(&value) {
            Some(rest) => negate(rest),
            None => value,
        },
        _ => value,
    };

    Ok(Value::Scalar(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::is_unmanaged_name;

    fn parse(line: &str) -> Rule {
        parse_rule(line, "filter", 1, &FlagMap::default()).unwrap()
    }

    fn scalar(s: &str) -> Value {
        Value::Scalar(s.to_string())
    }

    fn list(items: &[&str]) -> Value {
        Value::List(items.iter().map(|s| (*s).to_string()).collect())
    }

    #[test]
    fn test_simple_accept_rule() {
        let rule = parse(
            r#"-A INPUT -s 10.0.0.0/8 -p tcp -m multiport --dports 22,80 -m comment --comment "100 allow ssh" -j ACCEPT"#,
        );
        assert_eq!(rule.name, "100 allow ssh");
        assert_eq!(rule.chain, "INPUT");
        assert_eq!(rule.table, "filter");
        assert_eq!(rule.action, Some(Action::Accept));
        assert_eq!(rule.get(Attribute::Source), Some(&scalar("10.0.0.0/8")));
        assert_eq!(rule.get(Attribute::Proto), Some(&scalar("tcp")));
        assert_eq!(rule.get(Attribute::Dport), Some(&list(&["22", "80"])));
        assert!(rule.get(Attribute::Jump).is_none());
    }

    #[test]
    fn test_single_port_spelling() {
        let rule = parse(
            r#"-A INPUT -p tcp -m tcp --dport 8000:8080 -m comment --comment "200 range" -j DROP"#,
        );
        assert_eq!(rule.get(Attribute::Dport), Some(&list(&["8000-8080"])));
        assert_eq!(rule.action, Some(Action::Drop));
    }

    #[test]
    fn test_unmanaged_rule_gets_synthetic_name() {
        let line = "-A INPUT -i lo -j ACCEPT";
        let rule = parse(line);
        assert!(is_unmanaged_name(&rule.name));
        assert_eq!(rule.name, synthetic_name(1, line));
        assert_eq!(rule.get(Attribute::Iniface), Some(&scalar("lo")));
        assert_eq!(rule.get(Attribute::Proto), Some(&scalar("all")));
        assert_eq!(rule.line.as_deref(), Some(line));
    }

    #[test]
    fn test_comment_without_prefix_is_renamed() {
        let rule = parse(r#"-A INPUT -m comment --comment "docker rule" -j ACCEPT"#);
        assert_eq!(rule.name, "9001 docker rule");
    }

    #[test]
    fn test_negated_source_and_ports() {
        let rule = parse(
            r#"-A INPUT ! -s 192.168.1.1 -p tcp -m multiport ! --dports 80,443 -m comment --comment "300 neg" -j DROP"#,
        );
        assert_eq!(rule.get(Attribute::Source), Some(&scalar("! 192.168.1.1/32")));
        assert_eq!(rule.get(Attribute::Dport), Some(&list(&["! 80", "! 443"])));
    }

    #[test]
    fn test_negated_protocol() {
        let rule = parse(r#"-A INPUT ! -p udp -m comment --comment "301 not udp" -j ACCEPT"#);
        assert_eq!(rule.get(Attribute::Proto), Some(&scalar("! udp")));
    }

    #[test]
    fn test_state_is_sorted() {
        let rule = parse(
            r#"-A INPUT -m comment --comment "400 state" -m state --state RELATED,ESTABLISHED,NEW -j ACCEPT"#,
        );
        assert_eq!(
            rule.get(Attribute::State),
            Some(&list(&["ESTABLISHED", "NEW", "RELATED"]))
        );
    }

    #[test]
    fn test_booleans() {
        let rule = parse(
            r#"-A PREROUTING -p tcp -m socket -m comment --comment "500 socket" -j ACCEPT"#,
        );
        assert_eq!(rule.get(Attribute::Socket), Some(&Value::Bool(true)));

        let rule = parse(r#"-A INPUT -f -m comment --comment "501 frag" -j DROP"#);
        assert_eq!(rule.get(Attribute::Isfragment), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_fragment_flag_not_confused_with_tcp_flags() {
        let rule = parse(
            r#"-A INPUT -p tcp -m tcp --tcp-flags FIN,SYN,RST,ACK SYN -m comment --comment "502 syn" -j ACCEPT"#,
        );
        assert_eq!(
            rule.get(Attribute::TcpFlags),
            Some(&scalar("FIN,SYN,RST,ACK SYN"))
        );
        assert!(rule.get(Attribute::Isfragment).is_none());
    }

    #[test]
    fn test_boolean_with_value_is_parse_error() {
        let err = convert_value(Attribute::Socket, "yes".to_string()).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_repeated_boolean_flag_is_parse_error() {
        // The second -f is read back as the value of the first
        let err = parse_rule("-A INPUT -f -f -j DROP", "filter", 1, &FlagMap::default()).unwrap_err();
        match err {
            Error::Parse { value, .. } => assert_eq!(value, "-f"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_log_defaults() {
        let rule = parse(
            r#"-A INPUT -m comment --comment "600 log" -m limit --limit 3/min -j LOG --log-prefix "dropped: ""#,
        );
        assert_eq!(rule.get(Attribute::Jump), Some(&scalar("LOG")));
        assert_eq!(rule.get(Attribute::LogLevel), Some(&scalar("4")));
        assert_eq!(rule.get(Attribute::Limit), Some(&scalar("3/min")));
        assert_eq!(rule.get(Attribute::Burst), Some(&scalar("5")));
        assert_eq!(rule.get(Attribute::LogPrefix), Some(&scalar("dropped: ")));
    }

    #[test]
    fn test_escaped_quotes_in_comment() {
        let rule = parse(r#"-A INPUT -m comment --comment "700 say \"hi\"" -j ACCEPT"#);
        assert_eq!(rule.name, r#"700 say "hi""#);
    }

    #[test]
    fn test_flag_text_inside_comment_is_ignored() {
        let rule = parse(r#"-A INPUT -m comment --comment "710 block -s spoof" -j DROP"#);
        assert_eq!(rule.name, "710 block -s spoof");
        assert!(rule.get(Attribute::Source).is_none());
    }

    #[test]
    fn test_owner_module_group() {
        let rule = parse(
            r#"-A OUTPUT -m owner --uid-owner 0 --gid-owner 10 -m comment --comment "800 owner" -j ACCEPT"#,
        );
        assert_eq!(rule.get(Attribute::Uid), Some(&scalar("0")));
        assert_eq!(rule.get(Attribute::Gid), Some(&scalar("10")));
    }

    #[test]
    fn test_dscp_class_recovered() {
        let rule = parse_rule(
            r#"-A OUTPUT -p tcp -m comment --comment "900 dscp" -j DSCP --set-dscp 0x2e"#,
            "mangle",
            1,
            &FlagMap::default(),
        )
        .unwrap();
        assert_eq!(rule.get(Attribute::SetDscpClass), Some(&scalar("ef")));
        assert_eq!(rule.table, "mangle");
    }

    #[test]
    fn test_shared_to_flag() {
        let rule = parse_rule(
            r#"-A PREROUTING -d 10.0.0.0/24 -m comment --comment "910 netmap" -j NETMAP --to 192.168.0.0/24"#,
            "nat",
            1,
            &FlagMap::default(),
        )
        .unwrap();
        assert_eq!(rule.get(Attribute::To), Some(&scalar("192.168.0.0/24")));
        assert!(rule.get(Attribute::StringTo).is_none());

        let rule = parse(
            r#"-A INPUT -m comment --comment "920 string" -m string --string "GET /" --algo bm --to 65535 -j DROP"#,
        );
        assert_eq!(rule.get(Attribute::StringMatch), Some(&scalar("GET /")));
        assert_eq!(rule.get(Attribute::StringAlgo), Some(&scalar("bm")));
        assert_eq!(rule.get(Attribute::StringTo), Some(&scalar("65535")));
        assert!(rule.get(Attribute::To).is_none());
    }

    #[test]
    fn test_match_sets() {
        let rule = parse(
            r#"-A INPUT -m set --match-set blacklist src -m set ! --match-set whitelist dst -m comment --comment "930 sets" -j DROP"#,
        );
        assert_eq!(
            rule.get(Attribute::Ipset),
            Some(&list(&["blacklist src", "! whitelist dst"]))
        );
    }

    #[test]
    fn test_parse_dump_tables_and_counter() {
        let dump = "\
# Generated by iptables-save v1.8.7
*filter
:INPUT ACCEPT [0:0]
:FORWARD ACCEPT [0:0]
-A INPUT -i lo -j ACCEPT
-A INPUT -p tcp -m tcp --dport 22 -m comment --comment \"100 ssh\" -j ACCEPT
COMMIT
*nat
:POSTROUTING ACCEPT [0:0]
-A POSTROUTING -o eth0 -j MASQUERADE
COMMIT
";
        let rules = parse_dump(dump, &FlagMap::default()).unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules[0].name.starts_with("9001 "));
        assert_eq!(rules[1].name, "100 ssh");
        assert_eq!(rules[2].table, "nat");
        assert_eq!(rules[2].chain, "POSTROUTING");
        assert!(rules[2].name.starts_with("9003 "));
        assert_eq!(rules[2].get(Attribute::Jump), Some(&scalar("MASQUERADE")));
    }

    #[test]
    fn test_parse_dump_defaults_to_filter() {
        let rules = parse_dump("-A INPUT -j DROP\n", &FlagMap::default()).unwrap();
        assert_eq!(rules[0].table, "filter");
    }
}
