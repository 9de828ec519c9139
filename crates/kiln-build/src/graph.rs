//! Multi-stage build graphs.
//!
//! Stages are vertices; a stage depends on the stage it is based on and on
//! every stage it copies from. Stages whose dependencies are finished run
//! concurrently, each in its own scratch root, sharing the executor's
//! layer cache.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_snapshot::{FilesystemSnapshot, Layer, Scanner, apply, capture};
use tempfile::TempDir;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::composer::ImageComposer;
use crate::config::StageConfig;
use crate::error::{BuildError, BuildResult};
use crate::stage::{BaseRef, BaseState, BuildStage, StageExecutor, StageOutput};

/// A prepared external base image.
#[derive(Debug, Clone)]
pub struct ResolvedBase {
    /// Identity and config of the base.
    pub state: BaseState,
    /// Layers that make up the base filesystem.
    pub layers: Vec<Layer>,
}

/// Prepares external base images in a stage root.
#[async_trait]
pub trait BaseResolver: Send + Sync {
    /// Materialize `reference` into the empty directory `root`.
    async fn prepare(&self, reference: &str, root: &Path) -> BuildResult<ResolvedBase>;
}

/// Resolves image references to unpacked root directories on disk.
///
/// The whole directory becomes a single base layer, so its digest, and
/// with it every cache key built on it, changes whenever its content does.
#[derive(Debug, Clone, Default)]
pub struct DirectoryBaseResolver {
    images: BTreeMap<String, PathBuf>,
    scanner: Scanner,
}

impl DirectoryBaseResolver {
    /// A resolver that knows no images.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `reference` to an unpacked root.
    #[must_use]
    pub fn with_image(mut self, reference: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.images.insert(reference.into(), dir.into());
        self
    }

    /// Use `scanner` to read image directories.
    #[must_use]
    pub fn with_scanner(mut self, scanner: Scanner) -> Self {
        self.scanner = scanner;
        self
    }
}

#[async_trait]
impl BaseResolver for DirectoryBaseResolver {
    async fn prepare(&self, reference: &str, root: &Path) -> BuildResult<ResolvedBase> {
        let base_image = |message: String| BuildError::BaseImage {
            reference: reference.to_string(),
            message,
        };
        let dir = self
            .images
            .get(reference)
            .cloned()
            .ok_or_else(|| base_image("no directory is mapped to this reference".to_string()))?;

        let scanner = self.scanner.clone();
        let root = root.to_path_buf();
        let layer = tokio::task::spawn_blocking(move || {
            let empty = FilesystemSnapshot::new();
            let image = scanner.scan(&dir, None)?;
            let layer = capture(&dir, &empty, &image)?;
            apply(&layer, &root)?;
            Ok::<_, kiln_snapshot::SnapshotError>(layer)
        })
        .await
        .map_err(|e| base_image(e.to_string()))?
        .map_err(|e| base_image(e.to_string()))?;

        debug!(reference = %reference, layer = %layer.digest(), "Prepared base image");
        Ok(ResolvedBase {
            state: BaseState {
                digest: layer.digest().clone(),
                config: StageConfig::new(),
            },
            layers: vec![layer],
        })
    }
}

/// A finished stage.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// What the stage executor produced.
    pub output: StageOutput,
    /// Every layer of the stage's image: the base's, then the stage's own.
    pub image_layers: Vec<Layer>,
    /// Host directory holding the stage's final root.
    pub root: PathBuf,
}

impl StageResult {
    /// Composer holding this stage's image.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be serialized.
    pub fn compose(&self) -> BuildResult<ImageComposer> {
        let mut composer = ImageComposer::new();
        for layer in &self.image_layers {
            let tar = layer.to_tar().map_err(|e| kiln_common::KilnError::Internal {
                message: format!("cannot serialize layer {}: {e}", layer.digest()),
            })?;
            composer.append_layer(layer.digest().clone(), tar);
        }
        composer.apply_config_delta(&self.output.config);
        Ok(composer)
    }
}

/// Results of a build.
#[derive(Debug)]
pub struct BuildOutput {
    /// Index of the target stage.
    pub target: usize,
    /// Results of every stage that ran, by index.
    pub stages: BTreeMap<usize, Arc<StageResult>>,
    _roots: Vec<TempDir>,
}

impl BuildOutput {
    /// Result of the target stage.
    #[must_use]
    pub fn target_result(&self) -> Option<&StageResult> {
        self.stages.get(&self.target).map(AsRef::as_ref)
    }
}

/// Validated stage dependency graph.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    stages: Vec<BuildStage>,
    names: BTreeMap<String, usize>,
    deps: Vec<BTreeSet<usize>>,
}

impl BuildGraph {
    /// Validate stages: names are unique, every referenced stage exists,
    /// and there are no cycles.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::UnknownStage`] or [`BuildError::StageCycle`].
    pub fn new(stages: Vec<BuildStage>) -> BuildResult<Self> {
        let mut names = BTreeMap::new();
        for (index, stage) in stages.iter().enumerate() {
            if let Some(name) = &stage.name {
                if names.insert(name.clone(), index).is_some() {
                    return Err(kiln_common::KilnError::Config {
                        message: format!("Duplicate stage name: {name}"),
                    }
                    .into());
                }
            }
        }

        let mut deps = Vec::with_capacity(stages.len());
        for stage in &stages {
            let mut resolved = BTreeSet::new();
            for name in stage.dependencies() {
                let index = lookup(&names, stages.len(), &name)
                    .ok_or_else(|| BuildError::UnknownStage { name: name.clone() })?;
                resolved.insert(index);
            }
            deps.push(resolved);
        }

        let graph = Self { stages, names, deps };
        graph.check_cycles()?;
        Ok(graph)
    }

    /// The stages, in declaration order.
    #[must_use]
    pub fn stages(&self) -> &[BuildStage] {
        &self.stages
    }

    /// Key other stages use for stage `index`: its name, or its position.
    #[must_use]
    pub fn stage_key(&self, index: usize) -> String {
        self.stages[index]
            .name
            .clone()
            .unwrap_or_else(|| index.to_string())
    }

    /// Index of `target`, or of the last stage.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::UnknownStage`] for an unknown name, or a
    /// config error if there are no stages.
    pub fn target_index(&self, target: Option<&str>) -> BuildResult<usize> {
        match target {
            Some(name) => lookup(&self.names, self.stages.len(), name)
                .ok_or_else(|| BuildError::UnknownStage { name: name.to_string() }),
            None => self.stages.len().checked_sub(1).ok_or_else(|| {
                kiln_common::KilnError::Config {
                    message: "Build has no stages".to_string(),
                }
                .into()
            }),
        }
    }

    /// `target` and every stage it transitively depends on.
    #[must_use]
    pub fn required(&self, target: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![target];
        while let Some(index) = stack.pop() {
            if seen.insert(index) {
                stack.extend(self.deps[index].iter().copied());
            }
        }
        seen
    }

    fn check_cycles(&self) -> BuildResult<()> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(graph: &BuildGraph, index: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> BuildResult<()> {
            match marks[index] {
                Mark::Done => return Ok(()),
                Mark::Active => {
                    let start = path.iter().position(|i| *i == index).unwrap_or(0);
                    let mut stages: Vec<String> = path[start..].iter().map(|i| graph.stage_key(*i)).collect();
                    stages.push(graph.stage_key(index));
                    return Err(BuildError::StageCycle { stages });
                }
                Mark::New => {}
            }
            marks[index] = Mark::Active;
            path.push(index);
            for dep in &graph.deps[index] {
                visit(graph, *dep, marks, path)?;
            }
            path.pop();
            marks[index] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::New; self.stages.len()];
        for index in 0..self.stages.len() {
            visit(self, index, &mut marks, &mut Vec::new())?;
        }
        Ok(())
    }

    /// Build `target` (default: the last stage) and the stages it needs.
    ///
    /// Each stage gets a fresh directory under `scratch`; the directories
    /// live as long as the returned [`BuildOutput`]. The first stage error
    /// cancels the stages still running and is returned.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure, or a base image or I/O error.
    pub async fn run(
        &self,
        executor: &StageExecutor,
        resolver: Arc<dyn BaseResolver>,
        scratch: &Path,
        target: Option<&str>,
        cancel: &CancellationToken,
    ) -> BuildResult<BuildOutput> {
        let target = self.target_index(target)?;
        let mut pending = self.required(target);
        let mut done: BTreeMap<usize, Arc<StageResult>> = BTreeMap::new();
        let mut roots = Vec::new();
        let mut tasks = JoinSet::new();
        let build_cancel = cancel.child_token();

        std::fs::create_dir_all(scratch)?;
        info!(stages = pending.len(), target = %self.stage_key(target), "Starting build");

        loop {
            let ready: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|i| self.deps[*i].iter().all(|d| done.contains_key(d)))
                .collect();
            for index in ready {
                pending.remove(&index);
                let dir = tempfile::Builder::new()
                    .prefix(&format!("stage-{index}-"))
                    .tempdir_in(scratch)?;
                let job = StageJob {
                    index,
                    stage: self.stages[index].clone(),
                    root: dir.path().to_path_buf(),
                    base_result: match &self.stages[index].base {
                        BaseRef::Stage(name) => lookup(&self.names, self.stages.len(), name)
                            .and_then(|i| done.get(&i).cloned()),
                        _ => None,
                    },
                    executor: executor.clone().with_stage_roots(
                        self.deps[index]
                            .iter()
                            .filter_map(|d| done.get(d).map(|r| (self.stage_key(*d), r.root.clone())))
                            .collect(),
                    ),
                    resolver: Arc::clone(&resolver),
                    cancel: build_cancel.clone(),
                };
                roots.push(dir);
                tasks.spawn(job.run());
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (index, result) = joined.map_err(|e| BuildError::Io(std::io::Error::other(e)))?;
            match result {
                Ok(result) => {
                    done.insert(index, Arc::new(result));
                }
                Err(err) => {
                    build_cancel.cancel();
                    while tasks.join_next().await.is_some() {}
                    return Err(err);
                }
            }
        }

        info!(stages = done.len(), "Build complete");
        Ok(BuildOutput {
            target,
            stages: done,
            _roots: roots,
        })
    }
}

/// Look a stage up by name, or by position for unnamed references.
fn lookup(names: &BTreeMap<String, usize>, len: usize, name: &str) -> Option<usize> {
    names
        .get(name)
        .copied()
        .or_else(|| name.parse::<usize>().ok().filter(|i| *i < len))
}

/// Everything one spawned stage needs.
struct StageJob {
    index: usize,
    stage: BuildStage,
    root: PathBuf,
    base_result: Option<Arc<StageResult>>,
    executor: StageExecutor,
    resolver: Arc<dyn BaseResolver>,
    cancel: CancellationToken,
}

impl StageJob {
    async fn run(self) -> (usize, BuildResult<StageResult>) {
        let index = self.index;
        (index, self.execute().await)
    }

    async fn execute(self) -> BuildResult<StageResult> {
        let (base, mut image_layers) = match &self.stage.base {
            BaseRef::Scratch => (BaseState::scratch(), Vec::new()),
            BaseRef::Stage(name) => {
                let parent = self
                    .base_result
                    .clone()
                    .ok_or_else(|| BuildError::UnknownStage { name: name.clone() })?;
                let layers = parent.image_layers.clone();
                let root = self.root.clone();
                let replay = layers.clone();
                tokio::task::spawn_blocking(move || replay.iter().try_for_each(|l| apply(l, &root)))
                    .await
                    .map_err(|e| BuildError::Io(std::io::Error::other(e)))?
                    .map_err(|e| BuildError::BaseImage {
                        reference: format!("stage:{name}"),
                        message: e.to_string(),
                    })?;
                let state = BaseState {
                    digest: parent.output.lineage.clone(),
                    config: parent.output.config.clone(),
                };
                (state, layers)
            }
            BaseRef::Image(reference) => {
                let resolved = self.resolver.prepare(reference, &self.root).await?;
                (resolved.state, resolved.layers)
            }
        };

        let output = self
            .executor
            .run_stage(&self.stage, &self.root, &base, &self.cancel)
            .await?;
        image_layers.extend(output.layers.iter().filter(|l| !l.is_empty()).cloned());
        Ok(StageResult {
            output,
            image_layers,
            root: self.root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;

    fn stage(name: &str, base: &str) -> BuildStage {
        BuildStage::new(BaseRef::parse(base)).named(name)
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let err = BuildGraph::new(vec![stage("app", "stage:missing")]).unwrap_err();
        assert!(matches!(err, BuildError::UnknownStage { name } if name == "missing"));

        let err = BuildGraph::new(vec![
            stage("app", "scratch").with_instruction(Instruction::copy_from("nope", ["/x"], "/x")),
        ])
        .unwrap_err();
        assert!(matches!(err, BuildError::UnknownStage { .. }));
    }

    #[test]
    fn cycles_are_rejected() {
        let err = BuildGraph::new(vec![
            stage("a", "stage:b"),
            stage("b", "scratch").with_instruction(Instruction::copy_from("a", ["/x"], "/x")),
        ])
        .unwrap_err();
        match err {
            BuildError::StageCycle { stages } => assert_eq!(stages, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        assert!(BuildGraph::new(vec![stage("a", "scratch"), stage("a", "scratch")]).is_err());
    }

    #[test]
    fn required_stages_follow_dependencies() {
        let graph = BuildGraph::new(vec![
            stage("deps", "scratch"),
            stage("unused", "scratch"),
            stage("build", "stage:deps"),
            stage("final", "scratch").with_instruction(Instruction::copy_from("build", ["/out"], "/app")),
        ])
        .unwrap();

        let target = graph.target_index(None).unwrap();
        assert_eq!(target, 3);
        assert_eq!(graph.required(target).into_iter().collect::<Vec<_>>(), vec![0, 2, 3]);
        assert_eq!(graph.target_index(Some("build")).unwrap(), 2);
        assert_eq!(graph.target_index(Some("1")).unwrap(), 1);
        assert!(graph.target_index(Some("nope")).is_err());
    }

    #[test]
    fn empty_graph_has_no_target() {
        let graph = BuildGraph::new(Vec::new()).unwrap();
        assert!(graph.target_index(None).is_err());
    }

    #[tokio::test]
    async fn directory_resolver_prepares_root() {
        let image = tempfile::tempdir().unwrap();
        std::fs::create_dir(image.path().join("etc")).unwrap();
        std::fs::write(image.path().join("etc/os-release"), "ID=test\n").unwrap();
        let root = tempfile::tempdir().unwrap();

        let resolver = DirectoryBaseResolver::new().with_image("test:1", image.path());
        let resolved = resolver.prepare("test:1", root.path()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(root.path().join("etc/os-release")).unwrap(),
            "ID=test\n"
        );
        assert_eq!(&resolved.state.digest, resolved.layers[0].digest());

        let err = resolver.prepare("other", root.path()).await.unwrap_err();
        assert!(matches!(err, BuildError::BaseImage { .. }));
    }
}
