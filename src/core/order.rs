//! Insertion-order resolution
//!
//! Managed rules are kept in the chain sorted by name; their names start with
//! a decimal ordering prefix (`"100 allow ssh"`). Unmanaged rules, named
//! `9nnn <hash>` by the parser, keep their positions, and managed rules are
//! slotted around them.
//!
//! The resolver answers "at which 1-based position should `-I`/`-R` place this
//! rule" given the names currently in the chain, in on-host order.

use crate::core::rule::is_unmanaged_name;

/// Returns the 1-based position for `target` among `current`.
///
/// `current` lists the names of the rules in the target's chain and table,
/// in the order they appear on the host. If `target` is among them the rule
/// is being replaced in place; otherwise it is new.
///
/// # Example
///
/// ```
/// use iptsync::core::order::insert_position;
///
/// let current = ["100 a".to_string(), "300 c".to_string()];
/// assert_eq!(insert_position(&current, "200 b"), 2);
/// assert_eq!(insert_position(&current, "050 first"), 1);
/// assert_eq!(insert_position(&[], "100 a"), 1);
/// ```
pub fn insert_position(current: &[String], target: &str) -> usize {
    if current.is_empty() {
        return 1;
    }

    let is_new = !current.iter().any(|name| name == target);

    let anchor: &str = if is_new {
        let mut sorted: Vec<&str> = current
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(target))
            .collect();
        sorted.sort_unstable();
        sorted.dedup();

        match sorted.iter().position(|name| *name == target) {
            Some(0) | None => current[0].as_str(),
            Some(rank) => sorted[rank - 1],
        }
    } else {
        target
    };

    // Unmanaged rules at or before the anchor, counting the target as the
    // last entry of the chain.
    let anchor_index = current
        .iter()
        .position(|name| name == anchor)
        .unwrap_or(current.len());
    let mut offset = current
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(target))
        .take(anchor_index + 1)
        .filter(|name| is_unmanaged_name(name))
        .count();

    // Go in front of an unmanaged anchor rather than after it
    if is_unmanaged_name(anchor) && !is_unmanaged_name(target) {
        offset = offset.saturating_sub(1);
    }

    let rank = current
        .iter()
        .filter(|name| !is_unmanaged_name(name))
        .filter(|name| name.as_str() < target)
        .count();

    rank + 1 + offset
}
