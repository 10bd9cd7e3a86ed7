//! Core rule management functionality
//!
//! This module contains the types and logic for reconciling iptables rules.
//! It provides:
//!
//! - [`schema`]: The attribute table and flag spellings
//! - [`rule`]: Rule and value types shared by parsed and desired rules
//! - [`normalize`] and [`parser`]: `iptables-save` line parsing
//! - [`serializer`]: Argument lists for `iptables -I/-R/-D`
//! - [`order`]: Insertion position among managed and unmanaged rules
//! - [`exec`]: Command execution against the host or an in-memory dump
//! - [`reconcile`]: The reconciliation driver
//! - [`error`]: Error types for rule operations
//! - [`dscp`]: DSCP class names

pub mod dscp;
pub mod error;
pub mod exec;
pub mod normalize;
pub mod order;
pub mod parser;
pub mod reconcile;
pub mod rule;
pub mod schema;
pub mod serializer;

#[cfg(test)]
pub mod test_helpers;
