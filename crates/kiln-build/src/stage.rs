//! The stage executor.
//!
//! A stage runs its instructions strictly in order against one live root.
//! For each instruction the executor derives a cache key from the lineage
//! so far, and either replays a cached layer or runs the instruction and
//! captures what it changed:
//!
//! ```text
//! Init -> { CacheCheck(i) -> Cached(i) | Executing(i) } -> Applied(i) -> ... -> Complete
//! ```
//!
//! `Failed` and `Canceled` end the stage from any state. A layer is only
//! stored after its instruction and capture both succeeded, so a failed,
//! canceled or timed-out instruction never leaves a cache entry behind.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use kiln_cache::{CacheKey, LayerCache};
use kiln_common::{Digest, Settings};
use kiln_snapshot::{FilesystemSnapshot, Layer, Scanner, SnapshotError, apply, capture};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StageConfig;
use crate::error::{BuildError, BuildResult, ExecError};
use crate::executor::{ExecContext, Executors};
use crate::instruction::Instruction;

/// What a stage starts from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BaseRef {
    /// An empty root.
    Scratch,
    /// The final state of another stage in the same build.
    Stage(String),
    /// An external image, prepared by a [`BaseResolver`](crate::graph::BaseResolver).
    Image(String),
}

impl BaseRef {
    /// Parse `scratch`, `stage:<name>` or an image reference.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value == "scratch" {
            Self::Scratch
        } else if let Some(name) = value.strip_prefix("stage:") {
            Self::Stage(name.to_string())
        } else {
            Self::Image(value.to_string())
        }
    }
}

impl fmt::Display for BaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scratch => f.write_str("scratch"),
            Self::Stage(name) => write!(f, "stage:{name}"),
            Self::Image(reference) => f.write_str(reference),
        }
    }
}

/// One base-image segment of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStage {
    /// Name other stages refer to this one by.
    pub name: Option<String>,
    /// Starting point.
    pub base: BaseRef,
    /// Instructions, in order.
    pub instructions: Vec<Instruction>,
}

impl BuildStage {
    /// An unnamed stage.
    #[must_use]
    pub const fn new(base: BaseRef) -> Self {
        Self {
            name: None,
            base,
            instructions: Vec::new(),
        }
    }

    /// Name the stage.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append an instruction.
    #[must_use]
    pub fn with_instruction(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    /// Stages this one reads from: its base and every copy source stage.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps: BTreeSet<String> = self
            .instructions
            .iter()
            .filter_map(Instruction::from_stage)
            .map(ToString::to_string)
            .collect();
        if let BaseRef::Stage(name) = &self.base {
            deps.insert(name.clone());
        }
        deps
    }
}

/// Filesystem identity and config a stage starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseState {
    /// Digest identifying the base filesystem; part of every cache key.
    pub digest: Digest,
    /// Config inherited from the base.
    pub config: StageConfig,
}

impl BaseState {
    /// The empty base.
    #[must_use]
    pub fn scratch() -> Self {
        Self {
            digest: Layer::empty_digest(),
            config: StageConfig::new(),
        }
    }
}

/// States of the per-stage state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Before the first instruction.
    Init,
    /// Looking up instruction `i` in the cache.
    CacheCheck(usize),
    /// Instruction `i`'s layer came from the cache.
    Cached(usize),
    /// Instruction `i` is running.
    Executing(usize),
    /// Instruction `i`'s layer is on the root and the config is updated.
    Applied(usize),
    /// Every instruction applied.
    Complete,
    /// An instruction or snapshot failed.
    Failed,
    /// Canceled or timed out.
    Canceled,
}

impl StageState {
    /// Whether the state ends the stage.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Canceled)
    }
}

/// The sequence of states a stage went through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageTrace {
    states: Vec<StageState>,
}

impl StageTrace {
    fn record(&mut self, stage: &str, state: StageState) {
        debug!(stage = %stage, state = ?state, "Stage transition");
        self.states.push(state);
    }

    /// All states in order.
    #[must_use]
    pub fn states(&self) -> &[StageState] {
        &self.states
    }

    /// The last state.
    #[must_use]
    pub fn last(&self) -> Option<StageState> {
        self.states.last().copied()
    }

    /// Indices of instructions served from the cache.
    #[must_use]
    pub fn cached(&self) -> Vec<usize> {
        self.states
            .iter()
            .filter_map(|s| match s {
                StageState::Cached(i) => Some(*i),
                _ => None,
            })
            .collect()
    }

    /// Indices of instructions that ran.
    #[must_use]
    pub fn executed(&self) -> Vec<usize> {
        self.states
            .iter()
            .filter_map(|s| match s {
                StageState::Executing(i) => Some(*i),
                _ => None,
            })
            .collect()
    }
}

/// What a finished stage hands on.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// One layer per instruction, in order; config-only instructions yield
    /// the empty layer.
    pub layers: Vec<Layer>,
    /// Config after the last instruction.
    pub config: StageConfig,
    /// Lineage digest after the last instruction; the base digest of any
    /// stage built on this one.
    pub lineage: Digest,
    /// States the stage went through.
    pub trace: StageTrace,
}

impl StageOutput {
    /// Layer digests, in instruction order.
    #[must_use]
    pub fn layer_digests(&self) -> Vec<Digest> {
        self.layers.iter().map(|l| l.digest().clone()).collect()
    }
}

/// Runs build stages against live roots.
#[derive(Clone)]
pub struct StageExecutor {
    cache: Option<Arc<dyn LayerCache>>,
    executors: Executors,
    scanner: Scanner,
    build_args: Arc<BTreeMap<String, String>>,
    context_dir: PathBuf,
    stage_roots: Arc<BTreeMap<String, PathBuf>>,
    timeout: Option<Duration>,
}

impl fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageExecutor")
            .field("cache", &self.cache.as_ref().map(|c| c.name()))
            .field("executors", &self.executors)
            .field("context_dir", &self.context_dir)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl StageExecutor {
    /// An executor with the real instruction executors, no cache, no
    /// timeout and the current directory as build context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: None,
            executors: Executors::default(),
            scanner: Scanner::new(),
            build_args: Arc::new(BTreeMap::new()),
            context_dir: PathBuf::from("."),
            stage_roots: Arc::new(BTreeMap::new()),
            timeout: None,
        }
    }

    /// Configure executors, scanner and timeout from settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a snapshot pattern is malformed.
    pub fn from_settings(settings: &Settings) -> BuildResult<Self> {
        let scanner = Scanner::from_settings(&settings.snapshot).map_err(|e| {
            BuildError::Common(kiln_common::KilnError::Config {
                message: e.to_string(),
            })
        })?;
        Ok(Self::new()
            .with_executors(Executors::from_settings(settings))
            .with_scanner(scanner)
            .with_timeout(settings.executor.instruction_timeout()))
    }

    /// Use a layer cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn LayerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the instruction executors.
    #[must_use]
    pub fn with_executors(mut self, executors: Executors) -> Self {
        self.executors = executors;
        self
    }

    /// Replace the filesystem scanner.
    #[must_use]
    pub fn with_scanner(mut self, scanner: Scanner) -> Self {
        self.scanner = scanner;
        self
    }

    /// Set the build arguments.
    #[must_use]
    pub fn with_build_args(mut self, args: BTreeMap<String, String>) -> Self {
        self.build_args = Arc::new(args);
        self
    }

    /// Set the build context directory.
    #[must_use]
    pub fn with_context_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.context_dir = dir.into();
        self
    }

    /// Set the roots of finished stages available to cross-stage copies.
    #[must_use]
    pub fn with_stage_roots(mut self, roots: BTreeMap<String, PathBuf>) -> Self {
        self.stage_roots = Arc::new(roots);
        self
    }

    /// Set the per-instruction timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build arguments.
    #[must_use]
    pub fn build_args(&self) -> &BTreeMap<String, String> {
        &self.build_args
    }

    /// Run `stage` against `root`, which must already hold the base
    /// filesystem described by `base`.
    ///
    /// # Errors
    ///
    /// Returns the first instruction or snapshot failure, or a
    /// cancellation/timeout error naming the in-flight instruction. Cache
    /// failures are logged and never returned.
    pub async fn run_stage(
        &self,
        stage: &BuildStage,
        root: &Path,
        base: &BaseState,
        cancel: &CancellationToken,
    ) -> BuildResult<StageOutput> {
        let name = stage.name.clone().unwrap_or_else(|| "<unnamed>".to_string());
        let mut run = StageRun {
            executor: self,
            name: &name,
            root,
            base,
            cancel,
            config: base.config.clone(),
            lineage: base.digest.clone(),
            layers: Vec::with_capacity(stage.instructions.len()),
            trace: StageTrace::default(),
        };
        run.trace.record(&name, StageState::Init);
        info!(stage = %name, base = %stage.base, instructions = stage.instructions.len(), "Starting stage");

        for (index, instruction) in stage.instructions.iter().enumerate() {
            if let Err(err) = run.step(index, instruction).await {
                let state = if err.is_cancellation() {
                    StageState::Canceled
                } else {
                    StageState::Failed
                };
                run.trace.record(&name, state);
                warn!(stage = %name, index, error = %err, "Stage stopped");
                return Err(err);
            }
        }

        run.trace.record(&name, StageState::Complete);
        info!(
            stage = %name,
            layers = run.layers.iter().filter(|l| !l.is_empty()).count(),
            cached = run.trace.cached().len(),
            "Stage complete"
        );
        Ok(StageOutput {
            layers: run.layers,
            config: run.config,
            lineage: run.lineage,
            trace: run.trace,
        })
    }
}

impl Default for StageExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable state of one `run_stage` call.
struct StageRun<'a> {
    executor: &'a StageExecutor,
    name: &'a str,
    root: &'a Path,
    base: &'a BaseState,
    cancel: &'a CancellationToken,
    config: StageConfig,
    lineage: Digest,
    layers: Vec<Layer>,
    trace: StageTrace,
}

impl StageRun<'_> {
    async fn step(&mut self, index: usize, raw: &Instruction) -> BuildResult<()> {
        let text = raw.to_string();
        if self.cancel.is_cancelled() {
            return Err(BuildError::Canceled {
                index,
                instruction: text,
            });
        }

        let mut vars = (*self.executor.build_args).clone();
        vars.extend(self.config.env().iter().map(|(k, v)| (k.clone(), v.clone())));
        let instruction = raw.substitute_args(&vars);
        let ctx = self.context();

        let mut key_text = raw.cache_text();
        if let Some(exec) = self.executor.executors.for_instruction(&instruction) {
            let digest = exec
                .content_digest(&ctx, &instruction)
                .await
                .map_err(|source| self.exec_error(index, &text, source))?;
            if let Some(digest) = digest {
                key_text.push_str(" #content=");
                key_text.push_str(digest.as_str());
            }
        }
        let key = CacheKey::derive(&self.lineage, &key_text, &self.executor.build_args, &self.base.digest);

        let cached = if raw.cache_relevant() {
            self.lookup(index, &key).await
        } else {
            None
        };
        if self.cancel.is_cancelled() {
            return Err(BuildError::Canceled {
                index,
                instruction: text,
            });
        }

        let layer = match cached {
            Some(layer) => {
                self.replay(index, &text, &layer).await?;
                self.trace.record(self.name, StageState::Cached(index));
                layer
            }
            None => {
                self.trace.record(self.name, StageState::Executing(index));
                info!(stage = %self.name, index, instruction = %text, "Executing");
                let layer = self.execute(index, &text, &instruction, ctx).await?;
                if raw.cache_relevant() {
                    self.store(&key, &layer).await;
                }
                layer
            }
        };

        self.config = instruction.apply_config(&self.config);
        self.lineage = key.lineage(layer.digest());
        self.layers.push(layer);
        self.trace.record(self.name, StageState::Applied(index));
        Ok(())
    }

    fn context(&self) -> ExecContext {
        ExecContext {
            root: self.root.to_path_buf(),
            config: self.config.clone(),
            build_args: Arc::clone(&self.executor.build_args),
            context_dir: self.executor.context_dir.clone(),
            stage_roots: Arc::clone(&self.executor.stage_roots),
            cancel: self.cancel.clone(),
        }
    }

    fn exec_error(&self, index: usize, text: &str, source: ExecError) -> BuildError {
        if matches!(source, ExecError::Canceled) {
            BuildError::Canceled {
                index,
                instruction: text.to_string(),
            }
        } else {
            BuildError::InstructionExecution {
                index,
                instruction: text.to_string(),
                source,
            }
        }
    }

    fn snapshot_error(index: usize, text: &str, source: SnapshotError) -> BuildError {
        if matches!(source, SnapshotError::Canceled) {
            BuildError::Canceled {
                index,
                instruction: text.to_string(),
            }
        } else {
            BuildError::Snapshot {
                index,
                instruction: text.to_string(),
                source,
            }
        }
    }

    /// Cache lookup; any backend failure counts as a miss.
    async fn lookup(&mut self, index: usize, key: &CacheKey) -> Option<Layer> {
        let Some(cache) = &self.executor.cache else {
            return None;
        };
        self.trace.record(self.name, StageState::CacheCheck(index));

        let result = tokio::select! {
            result = cache.get(key) => result,
            () = self.cancel.cancelled() => return None,
        };
        match result {
            Ok(Some(layer)) => {
                debug!(stage = %self.name, index, key = %key, layer = %layer.digest(), "Cache hit");
                Some(layer)
            }
            Ok(None) => {
                debug!(stage = %self.name, index, key = %key, "Cache miss");
                None
            }
            Err(err) => {
                warn!(
                    stage = %self.name,
                    index,
                    backend = cache.name(),
                    error = %err,
                    "Cache lookup failed, executing instead"
                );
                None
            }
        }
    }

    /// Best-effort store.
    async fn store(&self, key: &CacheKey, layer: &Layer) {
        let Some(cache) = &self.executor.cache else {
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }
        match cache.put(key, layer).await {
            Ok(()) => debug!(stage = %self.name, key = %key, layer = %layer.digest(), "Layer cached"),
            Err(err) => warn!(
                stage = %self.name,
                backend = cache.name(),
                error = %err,
                "Cache store failed, continuing"
            ),
        }
    }

    async fn replay(&self, index: usize, text: &str, layer: &Layer) -> BuildResult<()> {
        let layer = layer.clone();
        let root = self.root.to_path_buf();
        tokio::task::spawn_blocking(move || apply(&layer, &root))
            .await
            .map_err(|e| Self::snapshot_error(index, text, join_error(e)))?
            .map_err(|e| Self::snapshot_error(index, text, e))
    }

    async fn execute(&self, index: usize, text: &str, instruction: &Instruction, ctx: ExecContext) -> BuildResult<Layer> {
        let Some(exec) = self.executor.executors.for_instruction(instruction) else {
            return Ok(Layer::empty());
        };

        let scope = instruction.scope(&self.config).map(|s| vec![self.scope_root(&s)]);
        let before = self.scan(index, text, scope.clone()).await?;

        let started = Instant::now();
        let run = exec.apply(&ctx, instruction);
        let outcome = match self.executor.timeout {
            Some(limit) => tokio::select! {
                outcome = tokio::time::timeout(limit, run) => outcome.map_err(|_| BuildError::Timeout {
                    index,
                    instruction: text.to_string(),
                    after: limit,
                })?,
                () = self.cancel.cancelled() => Err(ExecError::Canceled),
            },
            None => tokio::select! {
                outcome = run => outcome,
                () = self.cancel.cancelled() => Err(ExecError::Canceled),
            },
        };
        outcome.map_err(|source| self.exec_error(index, text, source))?;
        debug!(stage = %self.name, index, executor = exec.name(), elapsed_ms = started.elapsed().as_millis() as u64, "Instruction finished");

        let layer = self.capture(index, text, before, scope).await?;
        debug!(stage = %self.name, index, ops = layer.len(), bytes = layer.content_size(), layer = %layer.digest(), "Captured layer");
        Ok(layer)
    }

    /// Highest ancestor of `path` that does not exist yet, so directories
    /// the instruction creates fall inside the scan scope.
    fn scope_root(&self, path: &str) -> String {
        let mut scope = path;
        for ancestor in kiln_snapshot::snapshot::ancestors(path) {
            if kiln_snapshot::snapshot::host_path(self.root, ancestor).exists() {
                break;
            }
            scope = ancestor;
        }
        scope.to_string()
    }

    fn scanner(&self) -> (Scanner, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let scanner = self.executor.scanner.clone().with_cancel_flag(Arc::clone(&flag));
        (scanner, flag)
    }

    async fn scan(&self, index: usize, text: &str, scope: Option<Vec<String>>) -> BuildResult<FilesystemSnapshot> {
        let (scanner, flag) = self.scanner();
        let root = self.root.to_path_buf();
        let task = tokio::task::spawn_blocking(move || scanner.scan(&root, scope.as_deref()));
        self.observe(index, text, flag, task).await
    }

    async fn capture(
        &self,
        index: usize,
        text: &str,
        before: FilesystemSnapshot,
        scope: Option<Vec<String>>,
    ) -> BuildResult<Layer> {
        let (scanner, flag) = self.scanner();
        let root = self.root.to_path_buf();
        let task = tokio::task::spawn_blocking(move || {
            let after = scanner.scan(&root, scope.as_deref())?;
            capture(&root, &before, &after)
        });
        self.observe(index, text, flag, task).await
    }

    /// Await blocking snapshot work, raising its cancel flag if the build
    /// is canceled meanwhile.
    async fn observe<T>(
        &self,
        index: usize,
        text: &str,
        flag: Arc<AtomicBool>,
        mut task: tokio::task::JoinHandle<Result<T, SnapshotError>>,
    ) -> BuildResult<T> {
        let joined = tokio::select! {
            joined = &mut task => joined,
            () = self.cancel.cancelled() => {
                flag.store(true, Ordering::Release);
                let _ = task.await;
                return Err(BuildError::Canceled { index, instruction: text.to_string() });
            }
        };
        joined
            .map_err(|e| Self::snapshot_error(index, text, join_error(e)))?
            .map_err(|e| Self::snapshot_error(index, text, e))
    }
}

fn join_error(err: tokio::task::JoinError) -> SnapshotError {
    SnapshotError::Io {
        path: "/".to_string(),
        source: std::io::Error::other(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_refs() {
        assert_eq!(BaseRef::parse("scratch"), BaseRef::Scratch);
        assert_eq!(BaseRef::parse("stage:build"), BaseRef::Stage("build".into()));
        assert_eq!(BaseRef::parse("alpine:3.20"), BaseRef::Image("alpine:3.20".into()));
        assert_eq!(BaseRef::Stage("b".into()).to_string(), "stage:b");
    }

    #[test]
    fn dependencies_include_copy_sources() {
        let stage = BuildStage::new(BaseRef::Stage("base".into()))
            .with_instruction(Instruction::copy_from("build", ["/out"], "/app"))
            .with_instruction(Instruction::run("true"));
        assert_eq!(
            stage.dependencies().into_iter().collect::<Vec<_>>(),
            vec!["base".to_string(), "build".to_string()]
        );
    }

    #[test]
    fn trace_queries() {
        let mut trace = StageTrace::default();
        for state in [
            StageState::Init,
            StageState::CacheCheck(0),
            StageState::Cached(0),
            StageState::Applied(0),
            StageState::CacheCheck(1),
            StageState::Executing(1),
            StageState::Applied(1),
            StageState::Complete,
        ] {
            trace.record("t", state);
        }
        assert_eq!(trace.cached(), vec![0]);
        assert_eq!(trace.executed(), vec![1]);
        assert_eq!(trace.last(), Some(StageState::Complete));
        assert!(StageState::Complete.is_terminal());
        assert!(!StageState::Applied(1).is_terminal());
    }

    #[test_log::test(tokio::test)]
    async fn scratch_stage_with_config_only_instructions() {
        let root = tempfile::tempdir().unwrap();
        let stage = BuildStage::new(BaseRef::Scratch)
            .with_instruction(Instruction::env("A", "1"))
            .with_instruction(Instruction::workdir("/app"));

        let output = StageExecutor::new()
            .run_stage(&stage, root.path(), &BaseState::scratch(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.layers, vec![Layer::empty(), Layer::empty()]);
        assert_eq!(output.config.env()["A"], "1");
        assert_eq!(output.config.workdir(), "/app");
        assert_eq!(output.trace.executed(), vec![0, 1]);
        assert_ne!(output.lineage, BaseState::scratch().digest);
    }

    /// A backend that never answers within a test's lifetime.
    struct StallingCache;

    #[async_trait::async_trait]
    impl LayerCache for StallingCache {
        async fn get(&self, _key: &CacheKey) -> kiln_cache::CacheResult<Option<Layer>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }

        async fn put(&self, _key: &CacheKey, _layer: &Layer) -> kiln_cache::CacheResult<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "stalling"
        }
    }

    #[tokio::test]
    async fn cancel_during_lookup_stops_before_executing() {
        let root = tempfile::tempdir().unwrap();
        let executor = StageExecutor::new().with_cache(Arc::new(StallingCache));
        let base = BaseState::scratch();
        let cancel = CancellationToken::new();
        let mut run = StageRun {
            executor: &executor,
            name: "app",
            root: root.path(),
            base: &base,
            cancel: &cancel,
            config: base.config.clone(),
            lineage: base.digest.clone(),
            layers: Vec::new(),
            trace: StageTrace::default(),
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = run.step(0, &Instruction::run("touch never")).await.unwrap_err();
        assert!(matches!(err, BuildError::Canceled { index: 0, .. }));
        assert_eq!(run.trace.states(), [StageState::CacheCheck(0)]);
        assert!(run.layers.is_empty());
        assert!(!root.path().join("never").exists());
    }

    #[tokio::test]
    async fn already_canceled_stage_runs_nothing() {
        let root = tempfile::tempdir().unwrap();
        let stage = BuildStage::new(BaseRef::Scratch).with_instruction(Instruction::run("touch /never"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = StageExecutor::new()
            .run_stage(&stage, root.path(), &BaseState::scratch(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Canceled { index: 0, .. }));
    }
}
