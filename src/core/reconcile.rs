//! Reconciliation of desired rules against the live chains
//!
//! For each desired rule the [`Reconciler`] reads the current dump, looks the
//! rule up by name and then inserts, replaces or deletes it. Every desired
//! rule is normalized and validated before the first command is sent, so a
//! bad rule never leaves a chain half-changed.
//!
//! One rule is reconciled at a time. Reading the dump and changing a rule are
//! not atomic with respect to each other, so concurrent edits by other tools
//! converge over repeated runs rather than within one.

use crate::core::error::{Error, Result};
use crate::core::exec::Executor;
use crate::core::order::insert_position;
use crate::core::parser::parse_dump;
use crate::core::rule::{Ensure, Rule};
use crate::core::schema::{Attribute, FlagMap, SchemaConfig};
use crate::core::serializer::{delete_args, insert_args, update_args};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

/// What reconciling one rule did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Unchanged,
    Created,
    /// Replaced in place; holds the attributes that differed.
    Updated(Vec<Attribute>),
    Removed,
    /// The delete command failed but the rule is confirmed gone.
    AlreadyAbsent,
}

impl Change {
    pub fn is_change(&self) -> bool {
        !matches!(self, Change::Unchanged)
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Unchanged => write!(f, "unchanged"),
            Change::Created => write!(f, "created"),
            Change::Updated(attrs) => {
                let names: Vec<&str> = attrs.iter().map(AsRef::as_ref).collect();
                write!(f, "changed {}", names.join(", "))
            }
            Change::Removed => write!(f, "removed"),
            Change::AlreadyAbsent => write!(f, "ensured absent"),
        }
    }
}

/// Drives an [`Executor`] towards a set of desired rules.
pub struct Reconciler<E: Executor> {
    executor: E,
    flags: FlagMap,
}

impl<E: Executor> Reconciler<E> {
    pub fn new(executor: E, schema: &SchemaConfig) -> Self {
        Self {
            executor,
            flags: FlagMap::new(schema),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Every rule currently on the host, in on-host order.
    pub async fn instances(&self) -> Result<Vec<Rule>> {
        debug!("[instances]");
        let dump = self.executor.save().await?;
        parse_dump(&dump, &self.flags)
    }

    /// 1-based position for `rule` within its chain and table.
    pub async fn insert_order(&self, rule: &Rule) -> Result<usize> {
        debug!("[insert_order]");
        let names: Vec<String> = self
            .instances()
            .await?
            .into_iter()
            .filter(|r| r.table == rule.table && r.chain == rule.chain)
            .map(|r| r.name)
            .collect();
        Ok(insert_position(&names, &rule.name))
    }

    /// Inserts `rule` at its ordered position.
    pub async fn insert(&self, rule: &Rule) -> Result<()> {
        info!("Inserting rule {}", rule.name);
        let position = self.insert_order(rule).await?;
        let args = insert_args(rule, position, &self.flags)?;
        self.executor.run(&args).await?;
        Ok(())
    }

    /// Replaces the existing rule with the same name by `rule`.
    pub async fn update(&self, rule: &Rule) -> Result<()> {
        info!("Updating rule {}", rule.name);
        let position = self.insert_order(rule).await?;
        let args = update_args(rule, position, &self.flags)?;
        self.executor.run(&args).await?;
        Ok(())
    }

    /// Deletes a rule discovered on the host.
    ///
    /// A failing delete is only tolerated when a fresh dump confirms the rule
    /// is gone.
    ///
    /// # Errors
    ///
    /// Returns the command's error if the rule is still present afterwards,
    /// or `Err` if `current` carries no dump line.
    pub async fn delete(&self, current: &Rule) -> Result<Change> {
        info!("Deleting rule {}", current.name);
        let args = delete_args(current)?;

        match self.executor.run(&args).await {
            Ok(_) => Ok(Change::Removed),
            Err(e) => {
                let still_present = self
                    .instances()
                    .await?
                    .iter()
                    .any(|r| r.name == current.name && r.table == current.table);
                if still_present {
                    return Err(e);
                }
                warn!("Delete of {} failed but the rule is already absent: {}", current.name, e);
                Ok(Change::AlreadyAbsent)
            }
        }
    }

    /// Completes a rule: issues the pending replace, if any, then persists.
    pub async fn flush(&self, rule: &mut Rule) -> Result<()> {
        debug!("[flush]");
        if rule.needs_change {
            info!("Properties changed - updating rule");
            self.update(rule).await?;
        }
        self.executor.persist().await?;
        rule.needs_change = false;
        Ok(())
    }

    /// Reconciles one desired rule.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the rule fails validation (before any command is
    /// run), if it would move an existing rule to another chain or table, or
    /// if a command fails.
    pub async fn reconcile(&self, desired: Rule) -> Result<Change> {
        let desired = desired.normalized()?;
        self.apply(desired).await
    }

    /// Reconciles desired rules in order.
    ///
    /// All rules are validated first; nothing is changed if any is invalid or
    /// if two share a name.
    pub async fn reconcile_all(&self, desired: Vec<Rule>) -> Result<Vec<(String, Change)>> {
        let mut seen = HashSet::new();
        let desired = desired
            .into_iter()
            .map(|rule| {
                let rule = rule.normalized()?;
                if !seen.insert(rule.name.clone()) {
                    return Err(Error::validation(
                        "name",
                        format!("Duplicate rule name '{}'", rule.name),
                    ));
                }
                Ok(rule)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut results = Vec::with_capacity(desired.len());
        for rule in desired {
            let name = rule.name.clone();
            let change = self.apply(rule).await?;
            info!("{}: {}", name, change);
            results.push((name, change));
        }
        Ok(results)
    }

    async fn apply(&self, mut desired: Rule) -> Result<Change> {
        let current = self
            .instances()
            .await?
            .into_iter()
            .find(|r| r.name == desired.name);

        match (desired.ensure, current) {
            (Ensure::Present, None) => {
                self.insert(&desired).await?;
                self.flush(&mut desired).await?;
                Ok(Change::Created)
            }
            (Ensure::Present, Some(current)) => {
                if current.table != desired.table {
                    return Err(Error::validation(
                        "table",
                        "Modifying the table for existing rules is not supported.",
                    ));
                }
                if current.chain != desired.chain {
                    return Err(Error::validation(
                        "chain",
                        "Modifying the chain for existing rules is not supported.",
                    ));
                }

                let changed = desired.differences(&current);
                if changed.is_empty() {
                    return Ok(Change::Unchanged);
                }
                debug!("{} differs in {:?}", desired.name, changed);
                desired.needs_change = true;
                self.flush(&mut desired).await?;
                Ok(Change::Updated(changed))
            }
            (Ensure::Absent, Some(current)) => {
                let change = self.delete(&current).await?;
                self.flush(&mut desired).await?;
                Ok(change)
            }
            (Ensure::Absent, None) => Ok(Change::Unchanged),
        }
    }
}
