//! Rule serialization into `iptables` argument lists
//!
//! Attributes are emitted in canonical order so that a rule written by
//! [`insert_args`] reads back from `iptables-save` in the same order the
//! parser expects.

use crate::core::error::{Error, Result};
use crate::core::rule::{Rule, Value, is_spaced_negation, strip_negation};
use crate::core::schema::{Attribute, FlagMap};
use strum::IntoEnumIterator;

/// Arguments for `iptables -I <chain> <position> ...`.
///
/// # Errors
///
/// Returns [`Error::MixedNegation`] if a list value is only partly negated.
pub fn insert_args(rule: &Rule, position: usize, flags: &FlagMap) -> Result<Vec<String>> {
    positioned_args("-I", rule, position, flags)
}

/// Arguments for `iptables -R <chain> <position> ...`.
///
/// # Errors
///
/// Returns [`Error::MixedNegation`] if a list value is only partly negated.
pub fn update_args(rule: &Rule, position: usize, flags: &FlagMap) -> Result<Vec<String>> {
    positioned_args("-R", rule, position, flags)
}

fn positioned_args(
    verb: &str,
    rule: &Rule,
    position: usize,
    flags: &FlagMap,
) -> Result<Vec<String>> {
    let mut args = vec![verb.to_string(), rule.chain.clone(), position.to_string()];
    args.extend(general_args(rule, flags)?);
    Ok(args)
}

/// Arguments for `iptables -D ...`, rebuilt from the rule's dump line.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the rule was not discovered on the host.
pub fn delete_args(rule: &Rule) -> Result<Vec<String>> {
    let line = rule.line.as_deref().ok_or_else(|| {
        Error::Internal(format!("rule '{}' has no dump line to delete by", rule.name))
    })?;

    let line = match line.strip_prefix("-A ") {
        Some(rest) => format!("-D {rest}"),
        None => line.to_string(),
    };

    let mut args = vec!["-t".to_string(), rule.table.clone()];
    args.extend(split_outside_quotes(&line));
    Ok(args)
}

/// Splits on whitespace that is not inside double quotes, dropping the quotes.
pub(crate) fn split_outside_quotes(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
}

/// The attribute part of an insert/replace command, without verb and chain.
///
/// # Errors
///
/// Returns [`Error::MixedNegation`] if a list value is only partly negated.
pub fn general_args(rule: &Rule, flags: &FlagMap) -> Result<Vec<String>> {
    let flags = flags.expand_for_values(|attr| {
        rule.get(attr)
            .is_some_and(|v| !matches!(v, Value::Bool(false)))
    });

    let mut args: Vec<String> = Vec::new();

    for attr in Attribute::iter() {
        let value = match attr {
            Attribute::Table => Value::Scalar(rule.table.clone()),
            Attribute::Name => Value::Scalar(rule.name.clone()),
            Attribute::Jump => match (rule.get(attr), rule.action) {
                (Some(jump), _) => jump.clone(),
                (None, Some(action)) => Value::Scalar(action.as_jump().to_string()),
                (None, None) => continue,
            },
            _ => match rule.get(attr) {
                Some(value) => value.clone(),
                None => continue,
            },
        };

        if attr.is_boolean() {
            if value.is_true() {
                push_flag(&mut args, flags.preferred(attr));
            }
            continue;
        }

        push_flag(&mut args, flags.preferred(attr));

        match value {
            Value::Scalar(s) => {
                let s = match strip_negation(&s) {
                    Some(rest) => {
                        negate_last(&mut args);
                        rest.to_string()
                    }
                    None => s,
                };
                push_scalar(&mut args, attr, s);
            }
            Value::List(items) if attr == Attribute::Ipset => {
                let joined = items.join(&format!(" {} ", flags.preferred(attr)));
                for word in joined.split(' ') {
                    let word = match strip_negation(word) {
                        Some(rest) => {
                            negate_last(&mut args);
                            rest
                        }
                        None => word,
                    };
                    if !word.is_empty() {
                        args.push(word.to_string());
                    }
                }
            }
            Value::List(items) => {
                let items = strip_list_negation(attr, items, &mut args)?;
                let items: Vec<String> = if attr.is_range() {
                    items.iter().map(|i| i.replace('-', ":")).collect()
                } else {
                    items
                };
                args.push(items.join(","));
            }
            Value::Bool(b) => args.push(b.to_string()),
        }
    }

    Ok(args)
}

fn push_flag(args: &mut Vec<String>, flag: &str) {
    args.extend(flag.split_whitespace().map(String::from));
}

fn push_scalar(args: &mut Vec<String>, attr: Attribute, value: String) {
    match attr {
        // Two arguments: mask and comparison
        Attribute::TcpFlags => {
            args.extend(value.split_whitespace().take(2).map(String::from));
        }
        _ if attr.is_range() => args.push(value.replace('-', ":")),
        _ => args.push(value),
    }
}

/// The tool wants `!` right before the option, after any `-m <module>`.
fn negate_last(args: &mut Vec<String>) {
    let at = args.len().saturating_sub(1);
    args.insert(at, "!".to_string());
}

fn strip_list_negation(
    attr: Attribute,
    items: Vec<String>,
    args: &mut Vec<String>,
) -> Result<Vec<String>> {
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

    negate_last(args);
    Ok(items
        .iter()
        .map(|i| strip_negation(i).unwrap_or(i).to_string())
        .collect())
}
