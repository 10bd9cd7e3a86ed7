//! Textual normalization of `iptables-save` rule lines
//!
//! The tokenizer in [`crate::core::parser`] assumes every flag is followed by
//! exactly one value token. A handful of dump constructs break that
//! assumption (two-argument flags, repeated match-set flags, negation markers
//! printed before the flag, optional module announcements). The passes here
//! rewrite those constructs into single quoted tokens, in a fixed order; later
//! passes depend on the output of earlier ones.

use regex::{Captures, Regex};
use std::sync::LazyLock;

static TTL_MATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(!\s+)?-m ttl (!\s+)?--ttl-(eq|lt|gt) [0-9]+").expect("valid ttl regex")
});

static TCP_FLAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(!\s+)?--tcp-flags (\S*) (\S*)").expect("valid tcp-flags regex")
});

static MATCH_SET_NEGATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(!\s+)?--match-set (\S*) (\S*)").expect("valid match-set regex")
});

static MATCH_SET_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-m set --match-set ((?:!\s+)?\S* \S*)").expect("valid match-set value regex")
});

static MATCH_SET_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-m set --match-set (!\s+)?\S* \S* ").expect("valid match-set clause regex")
});

static NEGATION_AFTER_FLAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(-\S+) (!)\s?(\S*)").expect("valid negation regex"));

static NEGATION_BEFORE_FLAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(!)\s*(-\S+)\s*(\S*)").expect("valid negation regex"));

static PROTO_MODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-m (tcp|udp) (--tcp-flags)?").expect("valid module regex"));

static PHYSDEV_SPACING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2}--physdev").expect("valid physdev regex"));

static IPSEC_POLICY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"--pol\sipsec",
        r"(\s--strict)?",
        r"(\s--reqid\s\S+)?",
        r"(\s--spi\s\S+)?",
        r"(\s--proto\s\S+)?",
        r"(\s--mode\s\S+)?",
        r"(\s--tunnel-dst\s\S+)?",
        r"(\s--tunnel-src\s\S+)?",
        r"(\s--next)?",
    ))
    .expect("valid ipsec policy regex")
});

const MATCH_SET_ANNOUNCEMENT: &str = "-m set --match-set";

/// Runs every normalization pass over a raw dump line.
pub fn normalize_line(line: &str) -> String {
    let values = TTL_MATCH.replace_all(line, "").into_owned();

    // Two values in one quoted token, negation folded in
    let values = TCP_FLAGS
        .replace_all(&values, r#"--tcp-flags "${1}${2} ${3}""#)
        .into_owned();

    let values = collapse_match_sets(values);

    let values = NEGATION_AFTER_FLAG
        .replace_all(&values, r#"${1} "${2} ${3}""#)
        .into_owned();
    let values = NEGATION_BEFORE_FLAG
        .replace_all(&values, r#"${2} "${1} ${3}""#)
        .into_owned();

    let values = strip_protocol_modules(&values);

    // EL5 prints two spaces before physdev options
    let values = PHYSDEV_SPACING
        .replace_all(&values, " --physdev")
        .into_owned();

    let values = IPSEC_POLICY
        .replace(&values, r#"--pol "ipsec${1}${2}${3}${4}${5}${6}${7}${8}" "#)
        .into_owned();

    // Added by some versions after the rule is applied
    values.replace("--connlimit-saddr", "")
}

/// Gathers every `-m set --match-set` clause into one `;`-joined quoted token
/// placed where the first clause was.
fn collapse_match_sets(values: String) -> String {
    if !values.contains(MATCH_SET_ANNOUNCEMENT) {
        return values;
    }

    let values = MATCH_SET_NEGATION
        .replace_all(&values, "--match-set ${1}${2} ${3}")
        .into_owned();

    let Some(index) = values.find(MATCH_SET_ANNOUNCEMENT) else {
        return values;
    };

    let sets: Vec<&str> = MATCH_SET_VALUE
        .captures_iter(&values)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    let joined = sets.join(";");

    let mut collapsed = MATCH_SET_CLAUSE.replace_all(&values, "").into_owned();
    let index = index.min(collapsed.len());
    collapsed.insert_str(index, &format!("{MATCH_SET_ANNOUNCEMENT} \"{joined}\" "));
    collapsed
}

/// Drops the optional `-m tcp`/`-m udp` announcements, except the one that
/// introduces `--tcp-flags` (its announcement is part of that flag's spelling).
fn strip_protocol_modules(values: &str) -> String {
    PROTO_MODULE
        .replace_all(values, |caps: &Captures<'_>| {
            match (&caps[1], caps.get(2)) {
                ("tcp", Some(_)) => caps[0].to_string(),
                (_, Some(flags)) => flags.as_str().to_string(),
                (_, None) => String::new(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_ttl_match() {
        let out = normalize_line("-A INPUT -m ttl --ttl-eq 64 -j DROP");
        assert_eq!(out, "-A INPUT  -j DROP");
        let out = normalize_line("-A INPUT -m ttl ! --ttl-gt 5 -j DROP");
        assert!(!out.contains("ttl"));
    }

    #[test]
    fn test_quotes_tcp_flags() {
        let out = normalize_line("-A INPUT -p tcp -m tcp --tcp-flags FIN,SYN,RST,ACK SYN -j ACCEPT");
        assert_eq!(
            out,
            r#"-A INPUT -p tcp -m tcp --tcp-flags "FIN,SYN,RST,ACK SYN" -j ACCEPT"#
        );
    }

    #[test]
    fn test_negated_tcp_flags_keep_marker_inside_token() {
        let out = normalize_line("-A INPUT -p tcp -m tcp ! --tcp-flags FIN,SYN SYN -j DROP");
        assert!(out.contains(r#"--tcp-flags "! FIN,SYN SYN""#), "{out}");
    }

    #[test]
    fn test_collapses_match_sets() {
        let out = normalize_line(
            "-A INPUT -m set --match-set blacklist src -m set ! --match-set whitelist dst -j DROP",
        );
        assert_eq!(
            out,
            r#"-A INPUT -m set --match-set "blacklist src;! whitelist dst" -j DROP"#
        );
    }

    #[test]
    fn test_moves_negation_into_value_token() {
        let out = normalize_line("-A INPUT ! -s 10.0.0.0/8 -j DROP");
        assert_eq!(out, r#"-A INPUT -s "! 10.0.0.0/8" -j DROP"#);

        let out = normalize_line("-A INPUT -p tcp -m multiport ! --dports 80,443 -j DROP");
        assert!(out.contains(r#"--dports "! 80,443""#), "{out}");
    }

    #[test]
    fn test_drops_optional_protocol_modules() {
        let out = normalize_line("-A INPUT -p tcp -m tcp --dport 22 -j ACCEPT");
        assert_eq!(out, "-A INPUT -p tcp --dport 22 -j ACCEPT");
        let out = normalize_line("-A INPUT -p udp -m udp --sport 53 -j ACCEPT");
        assert_eq!(out, "-A INPUT -p udp --sport 53 -j ACCEPT");
        let out = normalize_line("-A INPUT -p tcp -m tcpmss --mss 1400 -j DROP");
        assert!(out.contains("-m tcpmss --mss"));
    }

    #[test]
    fn test_fixes_physdev_spacing() {
        let out = normalize_line("-A FORWARD -m physdev  --physdev-in eth0 -j ACCEPT");
        assert_eq!(out, "-A FORWARD -m physdev --physdev-in eth0 -j ACCEPT");
    }

    #[test]
    fn test_quotes_ipsec_policy() {
        let out = normalize_line(
            "-A INPUT -m policy --dir in --pol ipsec --reqid 1 --proto esp -j ACCEPT",
        );
        assert!(
            out.contains(r#"--pol "ipsec --reqid 1 --proto esp" "#),
            "{out}"
        );
    }

    #[test]
    fn test_removes_connlimit_saddr() {
        let out = normalize_line(
            "-A INPUT -p tcp -m connlimit --connlimit-above 10 --connlimit-mask 32 --connlimit-saddr -j REJECT",
        );
        assert!(!out.contains("saddr"));
    }
}
