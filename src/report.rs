//! Per-item outcome tracking for batch runs.
//!
//! Batch loops never stop on a single bad file or series. Each unit of work
//! records an [`ItemOutcome`] and the collected [`RunReport`] is shown at the
//! end of the run, optionally saved as JSON.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

/// Flags shared by the batch subcommands.
#[derive(Args, Debug, Clone, Default)]
pub struct BatchArgs {
    /// Write the per-item run report as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Exit with an error when any item failed
    #[arg(long)]
    pub strict: bool,

    /// Hide the progress bar
    #[arg(long, short = 'q')]
    pub quiet: bool,
}

/// Category of a per-item failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The input could not be opened or parsed.
    Read,
    /// A series had too few usable slices.
    MissingSlices,
    /// Slices disagree on size, spacing, orientation, or are tilted.
    InconsistentGeometry,
    /// Pixel data could not be decoded.
    Decompress,
    /// The output could not be written.
    Write,
    /// Anything not covered above.
    Other,
}

impl FailureKind {
    pub const ALL: [FailureKind; 6] = [
        Self::Read,
        Self::MissingSlices,
        Self::InconsistentGeometry,
        Self::Decompress,
        Self::Write,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::MissingSlices => "missing slices",
            Self::InconsistentGeometry => "inconsistent geometry",
            Self::Decompress => "decompress",
            Self::Write => "write",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized failure for one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

/// Attach a [`FailureKind`] to any fallible result.
pub trait FailWith<T> {
    fn fail_with(self, kind: FailureKind) -> std::result::Result<T, Failure>;
}

impl<T, E: Into<anyhow::Error>> FailWith<T> for std::result::Result<T, E> {
    fn fail_with(self, kind: FailureKind) -> std::result::Result<T, Failure> {
        self.map_err(|e| Failure::new(kind, format!("{:#}", e.into())))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Written { output: PathBuf },
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub item: PathBuf,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Non-fatal note about an item that was still written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub item: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub operation: String,
    pub items: Vec<ItemOutcome>,
    pub warnings: Vec<Warning>,
}

impl RunReport {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            items: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Record the result of one unit of work.
    pub fn record(&mut self, item: &Path, result: std::result::Result<PathBuf, Failure>) {
        let outcome = match result {
            Ok(output) => Outcome::Written { output },
            Err(failure) => {
                tracing::warn!("✗ {item:?}: {failure}");
                Outcome::Failed {
                    kind: failure.kind,
                    message: failure.message,
                }
            }
        };
        self.items.push(ItemOutcome {
            item: item.to_path_buf(),
            outcome,
        });
    }

    pub fn warn(&mut self, item: &Path, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{item:?}: {message}");
        self.warnings.push(Warning {
            item: item.to_path_buf(),
            message,
        });
    }

    pub fn succeeded(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, Outcome::Written { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    /// Number of failures of the given kind.
    pub fn failed_with(&self, kind: FailureKind) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(&i.outcome, Outcome::Failed { kind: k, .. } if *k == kind))
            .count()
    }

    /// Human readable summary, one failure per line.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} complete: {} processed, {} written, {} failed, {} warnings",
            self.operation,
            self.items.len(),
            self.succeeded(),
            self.failed(),
            self.warnings.len()
        );
        if self.has_failures() {
            let by_kind: Vec<_> = FailureKind::ALL
                .iter()
                .map(|&kind| (kind, self.failed_with(kind)))
                .filter(|&(_, count)| count > 0)
                .map(|(kind, count)| format!("{kind} {count}"))
                .collect();
            out.push_str(&format!("\n  failures by kind: {}", by_kind.join(", ")));
        }
        for item in &self.items {
            if let Outcome::Failed { kind, message } = &item.outcome {
                out.push_str(&format!("\n  ✗ [{kind}] {:?}: {message}", item.item));
            }
        }
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create report folder: {parent:?}"))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write report: {path:?}"))
    }

    /// Print the summary, save the JSON report when requested, and turn
    /// failures into an error when `strict` is set.
    pub fn finish(&self, batch: &BatchArgs) -> Result<()> {
        println!("{}", self.summary());
        if let Some(path) = &batch.report {
            self.write_json(path)?;
            tracing::info!("Run report written to {path:?}");
        }
        if batch.strict && self.has_failures() {
            anyhow::bail!("{} item(s) failed during {}", self.failed(), self.operation);
        }
        Ok(())
    }
}
