//! Instruction executors.
//!
//! The stage executor never touches the filesystem itself; it hands every
//! filesystem-affecting instruction to an [`InstructionExecutor`] and
//! snapshots the root around the call. [`Executors`] bundles one executor
//! per kind so tests can swap in fakes.

mod add;
mod copy;
mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_common::{Digest, Settings};
use tokio_util::sync::CancellationToken;

pub use add::AddExecutor;
pub use copy::CopyExecutor;
pub use process::ProcessExecutor;

use crate::config::StageConfig;
use crate::error::ExecError;
use crate::instruction::Instruction;

/// Everything an executor may read while applying one instruction.
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Host directory holding the image root.
    pub root: PathBuf,
    /// Config in effect before the instruction.
    pub config: StageConfig,
    /// Build arguments.
    pub build_args: Arc<BTreeMap<String, String>>,
    /// Build context directory that copy and add sources resolve against.
    pub context_dir: PathBuf,
    /// Roots of finished stages, by name, for cross-stage copies.
    pub stage_roots: Arc<BTreeMap<String, PathBuf>>,
    /// Cancellation for the whole build.
    pub cancel: CancellationToken,
}

impl ExecContext {
    /// Host location of an image path in this root.
    #[must_use]
    pub fn host_path(&self, image_path: &str) -> PathBuf {
        kiln_snapshot::snapshot::host_path(&self.root, image_path)
    }
}

/// Realizes an instruction's effect on the image root.
#[async_trait]
pub trait InstructionExecutor: Send + Sync {
    /// Apply `instruction` to `ctx.root`.
    async fn apply(&self, ctx: &ExecContext, instruction: &Instruction) -> Result<(), ExecError>;

    /// Digest of the external inputs the instruction reads (copied files,
    /// downloaded content) when they are knowable before running it. It is
    /// folded into the cache key so changed sources miss the cache.
    async fn content_digest(&self, _ctx: &ExecContext, _instruction: &Instruction) -> Result<Option<Digest>, ExecError> {
        Ok(None)
    }

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

/// One executor per filesystem-affecting instruction kind.
#[derive(Clone)]
pub struct Executors {
    /// Runs [`Instruction::Run`].
    pub process: Arc<dyn InstructionExecutor>,
    /// Runs [`Instruction::Copy`].
    pub copy: Arc<dyn InstructionExecutor>,
    /// Runs [`Instruction::Add`].
    pub add: Arc<dyn InstructionExecutor>,
}

impl Executors {
    /// The real executors, configured from settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            process: Arc::new(ProcessExecutor::new(settings.executor.shell.clone())),
            copy: Arc::new(CopyExecutor::new()),
            add: Arc::new(AddExecutor::new()),
        }
    }

    /// Executor for `instruction`, or `None` for config-only instructions.
    #[must_use]
    pub fn for_instruction(&self, instruction: &Instruction) -> Option<&Arc<dyn InstructionExecutor>> {
        match instruction {
            Instruction::Run { .. } => Some(&self.process),
            Instruction::Copy { .. } => Some(&self.copy),
            Instruction::Add { .. } => Some(&self.add),
            _ => None,
        }
    }
}

impl Default for Executors {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl std::fmt::Debug for Executors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executors")
            .field("process", &self.process.name())
            .field("copy", &self.copy.name())
            .field("add", &self.add.name())
            .finish()
    }
}

/// Resolve a source path against a directory without letting `..` climb
/// out of it.
pub(crate) fn source_path(dir: &std::path::Path, source: &str) -> PathBuf {
    kiln_snapshot::snapshot::host_path(dir, &kiln_snapshot::snapshot::canonicalize(source))
}

/// Create the parent directories of `path`.
pub(crate) fn ensure_parent(path: &std::path::Path) -> Result<(), ExecError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ExecError::io(parent, e))?;
    }
    Ok(())
}
