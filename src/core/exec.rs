//! Command execution against `iptables`
//!
//! The [`Executor`] trait is the only way the reconciler touches the host.
//! [`IptablesExecutor`] spawns the real binaries (through
//! [`crate::elevation`]); [`DryRunExecutor`] applies the same commands to an
//! in-memory dump so that a plan can be previewed, and so that the reconciler
//! can be tested without root.

use crate::config::AppConfig;
use crate::core::error::{Error, Result};
use crate::core::serializer::split_outside_quotes;
use crate::elevation::create_elevated_command;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Runs `iptables` commands and reads the current rule set.
pub trait Executor: Send + Sync {
    /// Runs `iptables` with `args`, returning its standard output.
    fn run(&self, args: &[String]) -> impl Future<Output = Result<String>> + Send;

    /// Returns the current `iptables-save` dump.
    fn save(&self) -> impl Future<Output = Result<String>> + Send;

    /// Makes the current rule set survive a reboot.
    fn persist(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Executor for the live host
#[derive(Debug, Clone)]
pub struct IptablesExecutor {
    iptables: String,
    iptables_save: String,
    persist_path: Option<PathBuf>,
}

impl IptablesExecutor {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            iptables: config.iptables.clone(),
            iptables_save: config.iptables_save.clone(),
            persist_path: config.persist_path.clone(),
        }
    }

    async fn output(program: &str, args: &[String]) -> Result<String> {
        debug!("Executing: {} {}", program, args.join(" "));

        let output = create_elevated_command(program, args)?.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::Iptables {
                message: format!("`{program} {}` failed: {stderr}", args.join(" ")),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Executor for IptablesExecutor {
    async fn run(&self, args: &[String]) -> Result<String> {
        Self::output(&self.iptables, args).await
    }

    async fn save(&self) -> Result<String> {
        Self::output(&self.iptables_save, &[]).await
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = self.persist_path.clone() else {
            debug!("No persist_path configured, rules are not persisted");
            return Ok(());
        };

        let dump = self.save().await?;
        tokio::task::spawn_blocking(move || write_atomically(&path, &dump))
            .await
            .map_err(|e| Error::Internal(format!("persist task failed: {e}")))??;

        info!("Persisted rule set");
        Ok(())
    }
}

/// Writes `contents` to a temporary file next to `path`, then renames it
/// into place.
fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Executor that applies commands to an in-memory `iptables-save` dump
///
/// Supports the `-I`, `-R` and `-D` forms produced by the serializer and
/// fails the way `iptables` does when a position or rule does not exist.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    state: Mutex<DryRunState>,
}

#[derive(Debug, Default)]
struct DryRunState {
    lines: Vec<String>,
    commands: Vec<Vec<String>>,
    persisted: usize,
}

impl DryRunExecutor {
    pub fn new(dump: &str) -> Self {
        Self {
            state: Mutex::new(DryRunState {
                lines: dump.lines().map(String::from).collect(),
                ..DryRunState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DryRunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The simulated dump after every command so far.
    pub fn dump(&self) -> String {
        let mut dump = self.state().lines.join("\n");
        dump.push('\n');
        dump
    }

    /// Every command received, including failed ones.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state().commands.clone()
    }

    pub fn persist_count(&self) -> usize {
        self.state().persisted
    }
}

impl Executor for DryRunExecutor {
    async fn run(&self, args: &[String]) -> Result<String> {
        let mut state = self.state();
        state.commands.push(args.to_vec());
        state.apply(args)?;
        Ok(String::new())
    }

    async fn save(&self) -> Result<String> {
        Ok(self.dump())
    }

    async fn persist(&self) -> Result<()> {
        self.state().persisted += 1;
        Ok(())
    }
}

fn tool_error(message: &str) -> Error {
    Error::Iptables {
        message: format!("iptables: {message}"),
        stderr: Some(format!("iptables: {message}")),
        exit_code: Some(1),
    }
}

/// Quotes a word the way `iptables-save` prints it.
fn quote(word: &str) -> String {
    if !word.is_empty() && !word.chars().any(char::is_whitespace) && !word.contains('"') {
        return word.to_string();
    }
    let escaped = word.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn render_line(chain: &str, words: &[String]) -> String {
    let mut line = format!("-A {chain}");
    for word in words {
        line.push(' ');
        line.push_str(&quote(word));
    }
    line
}

impl DryRunState {
    fn apply(&mut self, args: &[String]) -> Result<()> {
        let mut table = "filter".to_string();
        let mut rest: Vec<String> = Vec::with_capacity(args.len());
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "-t" {
                table = iter
                    .next()
                    .cloned()
                    .ok_or_else(|| tool_error("option \"-t\" requires an argument"))?;
            } else {
                rest.push(arg.clone());
            }
        }

        let (verb, chain) = match rest.as_slice() {
            [verb, chain, ..] => (verb.clone(), chain.clone()),
            _ => return Err(tool_error("no command specified")),
        };

        match verb.as_str() {
            "-I" | "-R" => {
                let position: usize = rest
                    .get(2)
                    .and_then(|p| p.parse().ok())
                    .filter(|p| *p >= 1)
                    .ok_or_else(|| tool_error("Invalid rule number"))?;
                let line = render_line(&chain, &rest[3..]);
                if verb == "-I" {
                    self.insert(&table, &chain, position, line)
                } else {
                    self.replace(&table, &chain, position, line)
                }
            }
            "-D" => self.delete(&table, &chain, &rest[2..]),
            other => Err(tool_error(&format!("unknown option \"{other}\""))),
        }
    }

    /// Line range of a table section, excluding its `*table` header.
    fn section(&mut self, table: &str) -> (usize, usize) {
        let header = format!("*{table}");
        let start = match self.lines.iter().position(|l| l.trim_end() == header) {
            Some(i) => i + 1,
            None => {
                self.lines.push(header);
                self.lines.push("COMMIT".to_string());
                self.lines.len() - 1
            }
        };
        let end = self.lines[start..]
            .iter()
            .position(|l| l.starts_with("COMMIT") || l.starts_with('*'))
            .map_or(self.lines.len(), |i| start + i);
        (start, end)
    }

    /// Indices of the chain's rule lines, in order.
    fn chain_rules(&mut self, table: &str, chain: &str) -> (Vec<usize>, usize) {
        let (start, end) = self.section(table);
        let prefix = format!("-A {chain} ");
        let rules = (start..end)
            .filter(|&i| self.lines[i].starts_with(&prefix))
            .collect();
        (rules, end)
    }

    fn insert(&mut self, table: &str, chain: &str, position: usize, line: String) -> Result<()> {
        let (rules, end) = self.chain_rules(table, chain);
        if position > rules.len() + 1 {
            return Err(tool_error("Index of insertion too big."));
        }
        let at = match rules.get(position - 1) {
            Some(&index) => index,
            None => rules.last().map_or(end, |&last| last + 1),
        };
        self.lines.insert(at, line);
        Ok(())
    }

    fn replace(&mut self, table: &str, chain: &str, position: usize, line: String) -> Result<()> {
        let (rules, _) = self.chain_rules(table, chain);
        let index = *rules
            .get(position - 1)
            .ok_or_else(|| tool_error("Index of replacement too big."))?;
        self.lines[index] = line;
        Ok(())
    }

    fn delete(&mut self, table: &str, chain: &str, words: &[String]) -> Result<()> {
        let (rules, _) = self.chain_rules(table, chain);
        let target = render_line(chain, words);
        let target = split_outside_quotes(&target);
        let index = rules
            .into_iter()
            .find(|&i| split_outside_quotes(&self.lines[i]) == target)
            .ok_or_else(|| tool_error("Bad rule (does a matching rule exist in that chain?)."))?;
        self.lines.remove(index);
        Ok(())
    }
}
