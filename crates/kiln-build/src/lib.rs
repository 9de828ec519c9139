//! # kiln-build
//!
//! Stage execution and image assembly for the Kiln image builder.
//!
//! A build is a list of [`BuildStage`]s. The [`StageExecutor`] runs one
//! stage instruction by instruction against a live root directory: each
//! instruction gets a [`CacheKey`](kiln_cache::CacheKey) derived from its
//! parent's lineage, and is either replayed from the layer cache or executed
//! and snapshotted into a new layer. [`BuildGraph`] orders stages by their
//! dependencies and runs independent ones concurrently; [`ImageComposer`]
//! turns the target stage's layers and config into an OCI image layout.
//!
//! Build descriptions are read from a [`Buildfile`] (YAML, TOML or JSON).

#![warn(missing_docs)]

pub mod buildfile;
pub mod cli;
pub mod composer;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod instruction;
pub mod stage;

pub use buildfile::Buildfile;
pub use composer::{ImageComposer, ImageDescriptor, read_oci_layout};
pub use config::StageConfig;
pub use error::{BuildError, BuildResult, ExecError};
pub use executor::{AddExecutor, CopyExecutor, ExecContext, Executors, InstructionExecutor, ProcessExecutor};
pub use graph::{BaseResolver, BuildGraph, BuildOutput, DirectoryBaseResolver, ResolvedBase, StageResult};
pub use instruction::Instruction;
pub use stage::{BaseRef, BaseState, BuildStage, StageExecutor, StageOutput, StageState, StageTrace};
