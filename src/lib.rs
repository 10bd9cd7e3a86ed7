//! iptsync - declarative iptables rule management
//!
//! Keeps named rules in iptables chains converged with a declared set while
//! leaving rules added by other tools where they are.
//!
//! # Architecture
//!
//! - [`core`] - Parsing, serialization, ordering and reconciliation
//! - [`audit`] - Audit logging for every command sent to the host
//! - [`validators`] - Input validation for desired rules
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Privilege escalation for `iptables`
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Every desired rule is validated before the first command runs
//! - Dry-run planning against an in-memory copy of the dump
//! - Rules not managed by iptsync are never reordered
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::rule::Rule;
