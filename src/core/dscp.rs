//! DSCP class names and their numeric codepoints
//!
//! `iptables-save` always prints `--set-dscp 0x2e` even when the rule was
//! created with `--set-dscp-class ef`, so the parser translates the codepoint
//! back into the class name.

/// (codepoint as printed by `iptables-save`, class name)
pub const DSCP_CLASSES: [(&str, &str); 20] = [
    ("0x0a", "af11"),
    ("0x0c", "af12"),
    ("0x0e", "af13"),
    ("0x12", "af21"),
    ("0x14", "af22"),
    ("0x16", "af23"),
    ("0x1a", "af31"),
    ("0x1c", "af32"),
    ("0x1e", "af33"),
    ("0x22", "af41"),
    ("0x24", "af42"),
    ("0x26", "af43"),
    ("0x08", "cs1"),
    ("0x10", "cs2"),
    ("0x18", "cs3"),
    ("0x20", "cs4"),
    ("0x28", "cs5"),
    ("0x30", "cs6"),
    ("0x38", "cs7"),
    ("0x2e", "ef"),
];

/// Returns the class name for a codepoint such as `0x2e`.
pub fn class_for_hex(hex: &str) -> Option<&'static str> {
    DSCP_CLASSES
        .iter()
        .find(|(h, _)| h.eq_ignore_ascii_case(hex))
        .map(|(_, class)| *class)
}

/// Returns the codepoint for a class name such as `ef`.
pub fn hex_for_class(class: &str) -> Option<&'static str> {
    DSCP_CLASSES
        .iter()
        .find(|(_, c)| c.eq_ignore_ascii_case(class))
        .map(|(hex, _)| *hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_pairs() {
        assert_eq!(class_for_hex("0x2e"), Some("ef"));
        assert_eq!(class_for_hex("0x0a"), Some("af11"));
        assert_eq!(class_for_hex("0x38"), Some("cs7"));
        assert_eq!(class_for_hex("0x99"), None);
    }

    #[test]
    fn test_every_pair_maps_both_ways() {
        for (hex, class) in DSCP_CLASSES {
            assert_eq!(class_for_hex(hex), Some(class));
            assert_eq!(hex_for_class(class), Some(hex));
        }
    }

    #[test]
    fn test_codepoints_and_classes_are_unique() {
        let mut hexes: Vec<_> = DSCP_CLASSES.iter().map(|(h, _)| *h).collect();
        let mut classes: Vec<_> = DSCP_CLASSES.iter().map(|(_, c)| *c).collect();
        hexes.sort_unstable();
        hexes.dedup();
        classes.sort_unstable();
        classes.dedup();
        assert_eq!(hexes.len(), 20);
        assert_eq!(classes.len(), 20);
    }

    #[test]
    fn test_lookup_ignores_case() {
        assert_eq!(class_for_hex("0x2E"), Some("ef"));
        assert_eq!(hex_for_class("EF"), Some("0x2e"));
        assert_eq!(hex_for_class("af99"), None);
    }
}
