//! Read-only sequence description.
//!
//! The broker never parses sequence data itself; it delegates to an
//! external describe program running as the authenticated user and
//! relays the three facts the peer wants: residue count, total
//! molecular weight, and whether the polymer is nucleotide or protein.

use std::path::PathBuf;
use std::time::Duration;

use log::debug;

use seqlab_protocol::Deadline;

use crate::config::DescribeConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::exec;

/// Whether the identifier names one sequence or a sequence set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeScope {
    Sequence,
    SequenceSet,
}

/// What the describe collaborator reports for an identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceInfo {
    pub length: u64,
    pub total_weight: f64,
    pub is_nucleotide: bool,
}

impl SequenceInfo {
    /// Reply payload: `<length> <weight> <nuc|prot>`.
    pub fn reply(&self) -> String {
        let kind = if self.is_nucleotide { "nuc" } else { "prot" };
        format!("{} {} {}", self.length, self.total_weight, kind)
    }
}

/// Source of sequence descriptions.
pub trait SequenceCatalog {
    fn describe(
        &self,
        id: &str,
        scope: DescribeScope,
    ) -> impl std::future::Future<Output = BrokerResult<SequenceInfo>> + Send;
}

/// Default catalog: shells out to the configured describe programs.
pub struct CommandCatalog {
    sequence_bin: PathBuf,
    set_bin: PathBuf,
    timeout: Duration,
}

impl CommandCatalog {
    pub fn new(cfg: &DescribeConfig, timeout: Duration) -> Self {
        Self {
            sequence_bin: cfg.sequence_bin.clone(),
            set_bin: cfg.set_bin.clone(),
            timeout,
        }
    }
}

impl SequenceCatalog for CommandCatalog {
    async fn describe(&self, id: &str, scope: DescribeScope) -> BrokerResult<SequenceInfo> {
        validate_identifier(id)?;
        let bin = match scope {
            DescribeScope::Sequence => &self.sequence_bin,
            DescribeScope::SequenceSet => &self.set_bin,
        };
        let argv = vec![bin.display().to_string(), id.to_string()];
        let env = Vec::new();
        let deadline = Deadline::after(self.timeout);

        let result = exec::spawn_and_capture(&argv, &env, &deadline)
            .await
            .map_err(|e| BrokerError::Describe(format!("running {}: {e}", bin.display())))?;
        if !result.status.success() {
            let diag = String::from_utf8_lossy(&result.stderr);
            return Err(BrokerError::Describe(format!(
                "{} exited {} for '{id}': {}",
                bin.display(),
                result.status,
                diag.trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&result.stdout);
        let info = parse_describe_output(&stdout)?;
        debug!("described '{id}': {}", info.reply());
        Ok(info)
    }
}

/// Identifiers travel onto a command line, so anything that is not a
/// single printable token is refused.
fn validate_identifier(id: &str) -> BrokerResult<()> {
    if id.is_empty() {
        return Err(BrokerError::Describe("empty identifier".to_string()));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(BrokerError::Describe(format!(
            "identifier '{id}' contains whitespace or control characters"
        )));
    }
    Ok(())
}

/// Parse the collaborator's first stdout line: `length weight kind`
/// with kind `nuc` or `prot`.
fn parse_describe_output(stdout: &str) -> BrokerResult<SequenceInfo> {
    let malformed =
        |line: &str| BrokerError::Describe(format!("unparseable describe output '{line}'"));

    let line = stdout.lines().next().unwrap_or("").trim();
    let mut words = line.split_whitespace();
    let (Some(length), Some(weight), Some(kind), None) =
        (words.next(), words.next(), words.next(), words.next())
    else {
        return Err(malformed(line));
    };
    let length: u64 = length.parse().map_err(|_| malformed(line))?;
    let total_weight: f64 = weight.parse().map_err(|_| malformed(line))?;
    let is_nucleotide = match kind {
        "nuc" => true,
        "prot" => false,
        _ => return Err(malformed(line)),
    };
    Ok(SequenceInfo {
        length,
        total_weight,
        is_nucleotide,
    })
}
