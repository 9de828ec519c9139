//! Build errors.
//!
//! [`ExecError`] is what an instruction executor reports; the stage
//! executor wraps it, together with snapshot failures, cancellation and
//! timeouts, into a [`BuildError`] naming the failing instruction. Cache
//! errors never appear here: they are logged and treated as misses.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use kiln_common::KilnError;
use kiln_snapshot::SnapshotError;
use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`BuildError`].
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors that abort a build.
#[derive(Error, Diagnostic, Debug)]
pub enum BuildError {
    /// The delegated operation of an instruction failed.
    #[error("Instruction {index} failed: {instruction}")]
    #[diagnostic(code(kiln::build::instruction))]
    InstructionExecution {
        /// Position of the instruction in its stage.
        index: usize,
        /// Instruction text.
        instruction: String,
        /// Underlying failure.
        #[source]
        #[diagnostic_source]
        source: ExecError,
    },

    /// Scanning or capturing the instruction's changes failed.
    #[error("Snapshot of instruction {index} failed: {instruction}")]
    #[diagnostic(
        code(kiln::build::snapshot),
        help("Unreadable paths can be skipped with `snapshot.tolerate` in kiln.toml")
    )]
    Snapshot {
        /// Position of the instruction in its stage.
        index: usize,
        /// Instruction text.
        instruction: String,
        /// Underlying failure.
        #[source]
        #[diagnostic_source]
        source: SnapshotError,
    },

    /// The build was canceled while the instruction was in flight.
    #[error("Canceled during instruction {index}: {instruction}")]
    #[diagnostic(code(kiln::build::canceled))]
    Canceled {
        /// Position of the instruction in its stage.
        index: usize,
        /// Instruction text.
        instruction: String,
    },

    /// The instruction ran longer than the configured timeout.
    #[error("Instruction {index} timed out after {}s: {instruction}", after.as_secs_f64())]
    #[diagnostic(
        code(kiln::build::timeout),
        help("Raise `executor.instruction_timeout_secs` in kiln.toml")
    )]
    Timeout {
        /// Position of the instruction in its stage.
        index: usize,
        /// Instruction text.
        instruction: String,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// A stage reference names no stage.
    #[error("Unknown stage: {name}")]
    #[diagnostic(code(kiln::build::unknown_stage))]
    UnknownStage {
        /// The missing stage name.
        name: String,
    },

    /// Stages depend on each other in a cycle.
    #[error("Circular dependency between stages: {}", stages.join(" -> "))]
    #[diagnostic(code(kiln::build::stage_cycle))]
    StageCycle {
        /// Stages on the cycle.
        stages: Vec<String>,
    },

    /// A base image could not be prepared.
    #[error("Cannot prepare base image '{reference}': {message}")]
    #[diagnostic(
        code(kiln::build::base_image),
        help("Map image references to unpacked roots with --base NAME=DIR")
    )]
    BaseImage {
        /// Image reference.
        reference: String,
        /// What went wrong.
        message: String,
    },

    /// I/O error outside any instruction.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::build::io))]
    Io(#[from] io::Error),

    /// Shared error.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Common(#[from] KilnError),
}

impl BuildError {
    /// Whether the build stopped because of cancellation or a timeout
    /// rather than a failure.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled { .. } | Self::Timeout { .. })
    }
}

/// Errors reported by an instruction executor.
#[derive(Error, Diagnostic, Debug)]
pub enum ExecError {
    /// The process exited unsuccessfully.
    #[error("Command exited with {}: {command}", status.map_or_else(|| "a signal".to_string(), |c| format!("status {c}")))]
    #[diagnostic(code(kiln::exec::command_failed))]
    CommandFailed {
        /// The command line.
        command: String,
        /// Exit code, if the process was not killed by a signal.
        status: Option<i32>,
        /// Tail of the process's standard error.
        stderr: String,
    },

    /// The process could not be started.
    #[error("Cannot start {program}: {source}")]
    #[diagnostic(code(kiln::exec::spawn))]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Reading or writing a file failed.
    #[error("I/O error at {}: {source}", path.display())]
    #[diagnostic(code(kiln::exec::io))]
    Io {
        /// Host path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A copy or add source matched nothing.
    #[error("Source not found: {source_path}")]
    #[diagnostic(
        code(kiln::exec::source_not_found),
        help("Sources are resolved against the build context, or the named stage's root")
    )]
    SourceNotFound {
        /// The source as written.
        source_path: String,
    },

    /// A source glob does not compile.
    #[error("Invalid source pattern '{pattern}': {message}")]
    #[diagnostic(code(kiln::exec::invalid_pattern))]
    InvalidPattern {
        /// The pattern.
        pattern: String,
        /// Parser message.
        message: String,
    },

    /// Downloaded or local content does not match its declared checksum.
    #[error("Checksum mismatch for {source_path}: expected {expected}, got {actual}")]
    #[diagnostic(code(kiln::exec::checksum))]
    ChecksumMismatch {
        /// The source.
        source_path: String,
        /// Declared checksum.
        expected: String,
        /// Computed checksum.
        actual: String,
    },

    /// A remote source could not be fetched.
    #[error("Cannot download {url}: {source}")]
    #[diagnostic(code(kiln::exec::download))]
    Download {
        /// The URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// A copy names a stage whose root is not available.
    #[error("Stage '{name}' is not available to copy from")]
    #[diagnostic(code(kiln::exec::stage_unavailable))]
    StageUnavailable {
        /// Stage name.
        name: String,
    },

    /// The executor was handed an instruction it does not implement.
    #[error("{executor} executor cannot run: {instruction}")]
    #[diagnostic(code(kiln::exec::unsupported))]
    Unsupported {
        /// Executor name.
        executor: &'static str,
        /// Instruction text.
        instruction: String,
    },

    /// The executor observed cancellation.
    #[error("Canceled")]
    #[diagnostic(code(kiln::exec::canceled))]
    Canceled,
}

impl ExecError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failure_display() {
        let err = ExecError::CommandFailed {
            command: "false".to_string(),
            status: Some(1),
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "Command exited with status 1: false");

        let killed = ExecError::CommandFailed {
            command: "sleep 9".to_string(),
            status: None,
            stderr: String::new(),
        };
        assert_eq!(killed.to_string(), "Command exited with a signal: sleep 9");
    }

    #[test]
    fn failure_names_instruction() {
        let err = BuildError::InstructionExecution {
            index: 2,
            instruction: "RUN make".to_string(),
            source: ExecError::Canceled,
        };
        assert_eq!(err.to_string(), "Instruction 2 failed: RUN make");
        assert!(!err.is_cancellation());
    }

    #[test]
    fn timeout_is_cancellation() {
        let err = BuildError::Timeout {
            index: 0,
            instruction: "RUN sleep 100".to_string(),
            after: Duration::from_millis(1500),
        };
        assert!(err.is_cancellation());
        assert_eq!(err.to_string(), "Instruction 0 timed out after 1.5s: RUN sleep 100");
    }

    #[test]
    fn cycle_lists_stages() {
        let err = BuildError::StageCycle {
            stages: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "Circular dependency between stages: a -> b -> a");
    }
}
