//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::rule::{Action, Rule, Value};
use crate::core::schema::Attribute;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Use this when your test needs to:
/// 1. Temporarily change env vars to different values
/// 2. Restore env vars after the test
/// 3. Test behavior when env vars are absent
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::remove_var("IPTSYNC_TEST_NO_ELEVATION");
///     std::env::set_var("IPTSYNC_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("IPTSYNC_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// A small `iptables-save` dump with one unnamed and one managed rule in
/// `filter/INPUT`, plus a `nat` table.
pub const SAMPLE_DUMP: &str = r#"# Generated by iptables-save v1.8.10 on Sat Oct 17 12:00:00 2026
*nat
:PREROUTING ACCEPT [0:0]
:INPUT ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
:POSTROUTING ACCEPT [0:0]
-A POSTROUTING -o eth0 -j MASQUERADE
COMMIT
# Completed on Sat Oct 17 12:00:00 2026
# Generated by iptables-save v1.8.10 on Sat Oct 17 12:00:00 2026
*filter
:INPUT DROP [0:0]
:FORWARD DROP [0:0]
:OUTPUT ACCEPT [0:0]
-A INPUT -i lo -j ACCEPT
-A INPUT -p tcp -m tcp --dport 22 -m comment --comment "100 allow ssh" -j ACCEPT
COMMIT
# Completed on Sat Oct 17 12:00:00 2026
"#;

/// Owned argument list from string literals.
pub fn args(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_string()).collect()
}

/// Desired TCP rule accepting one destination port on `filter/INPUT`.
pub fn tcp_rule(name: &str, dport: &str) -> Rule {
    Rule::new(name, "filter", "INPUT")
        .with(Attribute::Proto, Value::Scalar("tcp".to_string()))
        .with(Attribute::Dport, Value::List(vec![dport.to_string()]))
        .with_action(Action::Accept)
}

/// The managed rule from [`SAMPLE_DUMP`] as it would be declared.
pub fn ssh_rule() -> Rule {
    tcp_rule("100 allow ssh", "22")
}
