//! Stage executor scenarios against real roots, real executors and an
//! in-memory layer cache.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kiln_build::{
    BaseRef, BaseState, BuildError, BuildStage, ExecContext, ExecError, Executors, Instruction, InstructionExecutor,
    StageExecutor, StageState,
};
use kiln_cache::{CacheError, CacheKey, CacheResult, LayerCache, MemoryLayerCache};
use kiln_common::Digest;
use kiln_snapshot::{FileOp, Layer};
use tempfile::{TempDir, tempdir};
use tokio_util::sync::CancellationToken;

/// Delegates to a real executor and counts `apply` calls.
struct Counting {
    inner: Arc<dyn InstructionExecutor>,
    applied: Arc<AtomicUsize>,
}

#[async_trait]
impl InstructionExecutor for Counting {
    async fn apply(&self, ctx: &ExecContext, instruction: &Instruction) -> Result<(), ExecError> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        self.inner.apply(ctx, instruction).await
    }

    async fn content_digest(&self, ctx: &ExecContext, instruction: &Instruction) -> Result<Option<Digest>, ExecError> {
        self.inner.content_digest(ctx, instruction).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

fn counting_executors() -> (Executors, Arc<AtomicUsize>) {
    let applied = Arc::new(AtomicUsize::new(0));
    let real = Executors::default();
    let wrap = |inner| -> Arc<dyn InstructionExecutor> {
        Arc::new(Counting {
            inner,
            applied: Arc::clone(&applied),
        })
    };
    let executors = Executors {
        process: wrap(real.process),
        copy: wrap(real.copy),
        add: wrap(real.add),
    };
    (executors, applied)
}

/// A backend whose every call fails.
struct BrokenCache;

#[async_trait]
impl LayerCache for BrokenCache {
    async fn get(&self, _key: &CacheKey) -> CacheResult<Option<Layer>> {
        Err(CacheError::Unavailable {
            message: "disk on fire".to_string(),
        })
    }

    async fn put(&self, _key: &CacheKey, _layer: &Layer) -> CacheResult<()> {
        Err(CacheError::Unavailable {
            message: "disk on fire".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

/// A backend whose lookups take far longer than any test.
struct StallingCache;

#[async_trait]
impl LayerCache for StallingCache {
    async fn get(&self, _key: &CacheKey) -> CacheResult<Option<Layer>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(None)
    }

    async fn put(&self, _key: &CacheKey, _layer: &Layer) -> CacheResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stalling"
    }
}

fn context_with(content: &str) -> TempDir {
    let context = tempdir().unwrap();
    fs::write(context.path().join("app.txt"), content).unwrap();
    context
}

fn copy_then_append() -> BuildStage {
    BuildStage::new(BaseRef::Scratch)
        .with_instruction(Instruction::copy(["app.txt"], "/app.txt"))
        .with_instruction(Instruction::run("echo hi >> app.txt"))
}

fn executor(context: &Path, cache: &Arc<MemoryLayerCache>) -> StageExecutor {
    StageExecutor::new()
        .with_context_dir(context)
        .with_cache(Arc::clone(cache) as Arc<dyn LayerCache>)
}

async fn run(executor: &StageExecutor, stage: &BuildStage, root: &Path) -> Result<kiln_build::StageOutput, BuildError> {
    executor
        .run_stage(stage, root, &BaseState::scratch(), &CancellationToken::new())
        .await
}

#[test_log::test(tokio::test)]
async fn test_copy_then_run_produces_two_layers_and_replays_from_cache() {
    let context = context_with("original content\n");
    let cache = Arc::new(MemoryLayerCache::new());
    let stage = copy_then_append();

    let cold_root = tempdir().unwrap();
    let cold = run(&executor(context.path(), &cache), &stage, cold_root.path()).await.unwrap();

    assert_eq!(cold.layers.len(), 2);
    assert!(matches!(
        cold.layers[0].ops().first(),
        Some(FileOp::Add { path, .. }) if path == "/app.txt"
    ));
    let modified = cold.layers[1]
        .ops()
        .iter()
        .find(|op| op.path() == "/app.txt")
        .unwrap();
    assert!(matches!(modified, FileOp::Modify { .. }));
    assert!(cold.layers[1].ops().iter().all(|op| !matches!(op, FileOp::Add { .. })));
    assert_eq!(
        fs::read_to_string(cold_root.path().join("app.txt")).unwrap(),
        "original content\nhi\n"
    );
    assert_eq!(cold.trace.executed(), vec![0, 1]);
    assert_eq!(cache.stores(), 2);

    // Warm run in a fresh root: nothing executes, the result is identical.
    let (executors, applied) = counting_executors();
    let warm_root = tempdir().unwrap();
    let warm = run(
        &executor(context.path(), &cache).with_executors(executors),
        &stage,
        warm_root.path(),
    )
    .await
    .unwrap();

    assert_eq!(applied.load(Ordering::SeqCst), 0);
    assert_eq!(warm.trace.cached(), vec![0, 1]);
    assert!(warm.trace.executed().is_empty());
    assert_eq!(warm.layer_digests(), cold.layer_digests());
    assert_eq!(warm.lineage, cold.lineage);
    assert_eq!(
        fs::read_to_string(warm_root.path().join("app.txt")).unwrap(),
        "original content\nhi\n"
    );
    assert_eq!(warm.trace.last(), Some(StageState::Complete));
}

#[tokio::test]
async fn test_changed_source_invalidates_every_following_step() {
    let cache = Arc::new(MemoryLayerCache::new());
    let stage = copy_then_append();

    let first = context_with("original content\n");
    let root = tempdir().unwrap();
    run(&executor(first.path(), &cache), &stage, root.path()).await.unwrap();

    let second = context_with("changed content\n");
    let root = tempdir().unwrap();
    let output = run(&executor(second.path(), &cache), &stage, root.path()).await.unwrap();

    assert!(output.trace.cached().is_empty());
    assert_eq!(output.trace.executed(), vec![0, 1]);
    assert_eq!(
        fs::read_to_string(root.path().join("app.txt")).unwrap(),
        "changed content\nhi\n"
    );
}

#[tokio::test]
async fn test_env_value_is_part_of_the_lineage() {
    let context = tempdir().unwrap();
    let cache = Arc::new(MemoryLayerCache::new());
    let stage = |mode: &str| {
        BuildStage::new(BaseRef::Scratch)
            .with_instruction(Instruction::env("MODE", mode))
            .with_instruction(Instruction::run("echo $MODE > mode.txt"))
    };

    let root = tempdir().unwrap();
    run(&executor(context.path(), &cache), &stage("debug"), root.path())
        .await
        .unwrap();

    let root = tempdir().unwrap();
    let output = run(&executor(context.path(), &cache), &stage("release"), root.path())
        .await
        .unwrap();
    assert!(output.trace.cached().is_empty());
    assert_eq!(fs::read_to_string(root.path().join("mode.txt")).unwrap(), "release\n");
    assert_eq!(output.config.env()["MODE"], "release");
}

#[tokio::test]
async fn test_only_referenced_build_args_affect_the_key() {
    let context = tempdir().unwrap();
    let cache = Arc::new(MemoryLayerCache::new());
    let stage = BuildStage::new(BaseRef::Scratch).with_instruction(Instruction::run("echo $VERSION > v.txt"));
    let args = |version: &str, other: &str| {
        BTreeMap::from([
            ("VERSION".to_string(), version.to_string()),
            ("UNUSED".to_string(), other.to_string()),
        ])
    };

    let root = tempdir().unwrap();
    run(
        &executor(context.path(), &cache).with_build_args(args("1", "a")),
        &stage,
        root.path(),
    )
    .await
    .unwrap();
    assert_eq!(fs::read_to_string(root.path().join("v.txt")).unwrap(), "1\n");

    let root = tempdir().unwrap();
    let output = run(
        &executor(context.path(), &cache).with_build_args(args("1", "b")),
        &stage,
        root.path(),
    )
    .await
    .unwrap();
    assert_eq!(output.trace.cached(), vec![0]);

    let root = tempdir().unwrap();
    let output = run(
        &executor(context.path(), &cache).with_build_args(args("2", "b")),
        &stage,
        root.path(),
    )
    .await
    .unwrap();
    assert_eq!(output.trace.executed(), vec![0]);
    assert_eq!(fs::read_to_string(root.path().join("v.txt")).unwrap(), "2\n");
}

#[tokio::test]
async fn test_failed_instruction_stores_nothing() {
    let context = tempdir().unwrap();
    let cache = Arc::new(MemoryLayerCache::new());
    let stage = BuildStage::new(BaseRef::Scratch)
        .with_instruction(Instruction::run("echo ok > ok.txt"))
        .with_instruction(Instruction::run("echo nope >&2; exit 7"));

    let root = tempdir().unwrap();
    let err = run(&executor(context.path(), &cache), &stage, root.path())
        .await
        .unwrap_err();

    match err {
        BuildError::InstructionExecution { index, source, .. } => {
            assert_eq!(index, 1);
            assert!(matches!(source, ExecError::CommandFailed { status: Some(7), .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    // Only the successful first instruction was stored.
    assert_eq!(cache.stores(), 1);
}

#[tokio::test]
async fn test_cancel_during_run_stores_nothing() {
    let context = tempdir().unwrap();
    let cache = Arc::new(MemoryLayerCache::new());
    let stage = BuildStage::new(BaseRef::Scratch).with_instruction(Instruction::run("sleep 30"));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let root = tempdir().unwrap();
    let started = std::time::Instant::now();
    let err = executor(context.path(), &cache)
        .run_stage(&stage, root.path(), &BaseState::scratch(), &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancellation());
    assert!(matches!(err, BuildError::Canceled { index: 0, .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(cache.stores(), 0);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_cancel_during_cache_lookup_never_executes() {
    let context = tempdir().unwrap();
    let stage = BuildStage::new(BaseRef::Scratch).with_instruction(Instruction::run("touch never"));
    let cancel = CancellationToken::new();
    let (executors, applied) = counting_executors();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let root = tempdir().unwrap();
    let started = std::time::Instant::now();
    let err = StageExecutor::new()
        .with_context_dir(context.path())
        .with_cache(Arc::new(StallingCache))
        .with_executors(executors)
        .run_stage(&stage, root.path(), &BaseState::scratch(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Canceled { index: 0, .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(applied.load(Ordering::SeqCst), 0);
    assert!(!root.path().join("never").exists());
}

#[tokio::test]
async fn test_timeout_stores_nothing() {
    let context = tempdir().unwrap();
    let cache = Arc::new(MemoryLayerCache::new());
    let stage = BuildStage::new(BaseRef::Scratch).with_instruction(Instruction::run("sleep 30"));

    let root = tempdir().unwrap();
    let err = run(
        &executor(context.path(), &cache).with_timeout(Some(Duration::from_millis(200))),
        &stage,
        root.path(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BuildError::Timeout { index: 0, .. }));
    assert_eq!(cache.stores(), 0);
}

#[test_log::test(tokio::test)]
async fn test_broken_cache_backend_is_not_fatal() {
    let context = context_with("original content\n");
    let stage = copy_then_append();

    let root = tempdir().unwrap();
    let output = run(
        &StageExecutor::new()
            .with_context_dir(context.path())
            .with_cache(Arc::new(BrokenCache)),
        &stage,
        root.path(),
    )
    .await
    .unwrap();

    assert_eq!(output.trace.executed(), vec![0, 1]);
    assert!(output.trace.states().contains(&StageState::CacheCheck(0)));
    assert_eq!(
        fs::read_to_string(root.path().join("app.txt")).unwrap(),
        "original content\nhi\n"
    );
}

#[tokio::test]
async fn test_config_only_steps_skip_the_cache() {
    let context = context_with("original content\n");
    let cache = Arc::new(MemoryLayerCache::new());
    let stage = copy_then_append()
        .with_instruction(Instruction::workdir("/srv"))
        .with_instruction(Instruction::run("echo served > index.html"));

    let root = tempdir().unwrap();
    let output = run(&executor(context.path(), &cache), &stage, root.path()).await.unwrap();

    assert_eq!(output.layers.len(), 4);
    assert!(output.layers[2].is_empty());
    assert!(!output.trace.states().contains(&StageState::CacheCheck(2)));
    assert!(output.trace.states().contains(&StageState::CacheCheck(3)));
    assert_eq!(cache.stores(), 3);
    assert_eq!(output.config.workdir(), "/srv");
    assert_eq!(
        fs::read_to_string(root.path().join("srv/index.html")).unwrap(),
        "served\n"
    );

    // Without a cache the same stage never enters a cache check.
    let plain_root = tempdir().unwrap();
    let plain = run(
        &StageExecutor::new().with_context_dir(context.path()),
        &stage,
        plain_root.path(),
    )
    .await
    .unwrap();
    assert!(plain.trace.states().iter().all(|s| !matches!(s, StageState::CacheCheck(_))));
    assert_eq!(plain.trace.executed(), vec![0, 1, 2, 3]);
}
