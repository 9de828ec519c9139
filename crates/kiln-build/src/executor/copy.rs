//! Copy instructions.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kiln_common::Digest;
use kiln_snapshot::metadata::hash_file;
use sha2::{Digest as _, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use super::{ExecContext, InstructionExecutor, ensure_parent, source_path};
use crate::error::ExecError;
use crate::instruction::{Instruction, resolve_path};

/// Copies files and directories from the build context, or from another
/// stage's root, into the image root.
///
/// A directory source copies its contents. The destination is treated as a
/// directory when it ends in `/`, when there are several sources or glob
/// matches, or when it already exists as a directory.
#[derive(Debug, Clone, Default)]
pub struct CopyExecutor;

/// Sources resolved for one copy.
struct CopyPlan {
    matches: Vec<PathBuf>,
    dest: PathBuf,
    dest_is_dir: bool,
}

impl CopyExecutor {
    /// A copy executor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn plan(ctx: &ExecContext, instruction: &Instruction) -> Result<CopyPlan, ExecError> {
        let Instruction::Copy {
            sources,
            dest,
            from_stage,
        } = instruction
        else {
            return Err(ExecError::Unsupported {
                executor: "copy",
                instruction: instruction.to_string(),
            });
        };

        let base = match from_stage {
            Some(name) => ctx
                .stage_roots
                .get(name)
                .cloned()
                .ok_or_else(|| ExecError::StageUnavailable { name: name.clone() })?,
            None => ctx.context_dir.clone(),
        };

        let mut matches = Vec::new();
        let mut globbed = false;
        for source in sources {
            let found = expand(&base, source)?;
            globbed |= is_pattern(source);
            matches.extend(found);
        }

        let dest_image = resolve_path(ctx.config.workdir(), dest);
        let dest_host = ctx.host_path(&dest_image);
        let dest_is_dir = dest.ends_with('/') || matches.len() > 1 || globbed || dest_host.is_dir();

        Ok(CopyPlan {
            matches,
            dest: dest_host,
            dest_is_dir,
        })
    }
}

fn is_pattern(source: &str) -> bool {
    source.contains(['*', '?', '['])
}

/// Host paths a source names: the path itself, or its glob matches.
fn expand(base: &Path, source: &str) -> Result<Vec<PathBuf>, ExecError> {
    let path = source_path(base, source);
    if !is_pattern(source) {
        if fs::symlink_metadata(&path).is_err() {
            return Err(ExecError::SourceNotFound {
                source_path: source.to_string(),
            });
        }
        return Ok(vec![path]);
    }

    let pattern = path.to_string_lossy();
    let entries = glob::glob(&pattern).map_err(|e| ExecError::InvalidPattern {
        pattern: source.to_string(),
        message: e.to_string(),
    })?;
    let mut matches = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| {
            let path = e.path().to_path_buf();
            ExecError::io(path, e.into_error())
        })?;
        matches.push(path);
    }
    if matches.is_empty() {
        return Err(ExecError::SourceNotFound {
            source_path: source.to_string(),
        });
    }
    matches.sort();
    Ok(matches)
}

fn copy_all(plan: &CopyPlan) -> Result<usize, ExecError> {
    let mut copied = 0;
    for source in &plan.matches {
        let meta = fs::symlink_metadata(source).map_err(|e| ExecError::io(source, e))?;
        if meta.is_dir() {
            copied += copy_tree(source, &plan.dest)?;
        } else {
            let target = if plan.dest_is_dir {
                plan.dest.join(source.file_name().unwrap_or_default())
            } else {
                plan.dest.clone()
            };
            copy_entry(source, &target, &meta)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Copy the contents of `src` into `dest`. Directory modes are set once
/// every entry is in place, so a read-only source directory does not block
/// its own children.
fn copy_tree(src: &Path, dest: &Path) -> Result<usize, ExecError> {
    let mut copied = 0;
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map_or_else(|| src.to_path_buf(), Path::to_path_buf);
            ExecError::io(path, e.into())
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = if relative.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(relative)
        };
        let meta = entry.metadata().map_err(|e| ExecError::io(entry.path(), e.into()))?;
        if meta.is_dir() {
            make_dir(&target)?;
            dir_modes.push((target, meta.permissions().mode()));
        } else {
            copy_entry(entry.path(), &target, &meta)?;
        }
        copied += 1;
    }

    // Deepest first.
    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode)).map_err(|e| ExecError::io(&dir, e))?;
    }
    Ok(copied)
}

fn make_dir(target: &Path) -> Result<(), ExecError> {
    if let Ok(existing) = fs::symlink_metadata(target) {
        if !existing.is_dir() {
            fs::remove_file(target).map_err(|e| ExecError::io(target, e))?;
        }
    }
    fs::create_dir_all(target).map_err(|e| ExecError::io(target, e))
}

fn copy_entry(src: &Path, target: &Path, meta: &fs::Metadata) -> Result<(), ExecError> {
    let file_type = meta.file_type();
    ensure_parent(target)?;
    if let Ok(existing) = fs::symlink_metadata(target) {
        let removed = if existing.is_dir() {
            fs::remove_dir_all(target)
        } else if file_type.is_symlink() || existing.file_type().is_symlink() {
            fs::remove_file(target)
        } else {
            Ok(())
        };
        removed.map_err(|e| ExecError::io(target, e))?;
    }

    if file_type.is_symlink() {
        let link = fs::read_link(src).map_err(|e| ExecError::io(src, e))?;
        std::os::unix::fs::symlink(&link, target).map_err(|e| ExecError::io(target, e))?;
    } else {
        fs::copy(src, target).map_err(|e| ExecError::io(target, e))?;
    }
    Ok(())
}

/// Hash of every path, mode, link target and file content under the
/// matched sources, in a stable order.
fn digest_sources(matches: &[PathBuf]) -> Result<Digest, ExecError> {
    let mut hasher = Sha256::new();
    let mut field = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    };

    for source in matches {
        field(source.file_name().unwrap_or_default().as_encoded_bytes());
        for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| ExecError::io(source, e.into()))?;
            let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
            let meta = entry.metadata().map_err(|e| ExecError::io(entry.path(), e.into()))?;
            field(relative.as_os_str().as_encoded_bytes());
            field(&meta.permissions().mode().to_be_bytes());

            let file_type = meta.file_type();
            if file_type.is_symlink() {
                let link = fs::read_link(entry.path()).map_err(|e| ExecError::io(entry.path(), e))?;
                field(b"l");
                field(link.as_os_str().as_encoded_bytes());
            } else if file_type.is_file() {
                let hash = hash_file(entry.path()).map_err(|e| ExecError::io(entry.path(), e))?;
                field(b"f");
                field(hash.as_str().as_bytes());
            } else {
                field(b"d");
            }
        }
    }
    Ok(Digest::from_hasher(hasher))
}

#[async_trait]
impl InstructionExecutor for CopyExecutor {
    async fn apply(&self, ctx: &ExecContext, instruction: &Instruction) -> Result<(), ExecError> {
        let plan = Self::plan(ctx, instruction)?;
        let dest = plan.dest.clone();
        let copied = tokio::task::spawn_blocking(move || copy_all(&plan))
            .await
            .map_err(|e| ExecError::io(&dest, std::io::Error::other(e)))??;
        debug!(dest = %dest.display(), entries = copied, "Copied sources");
        Ok(())
    }

    async fn content_digest(&self, ctx: &ExecContext, instruction: &Instruction) -> Result<Option<Digest>, ExecError> {
        let plan = Self::plan(ctx, instruction)?;
        let digest = tokio::task::spawn_blocking(move || digest_sources(&plan.matches))
            .await
            .map_err(|e| ExecError::io(&ctx.context_dir, std::io::Error::other(e)))??;
        Ok(Some(digest))
    }

    fn name(&self) -> &'static str {
        "copy"
    }
}
