//! Add instructions: local files, local archives and remote URLs.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use kiln_common::Digest;
use kiln_snapshot::metadata::hash_file;
use tracing::{debug, info};

use super::{ExecContext, InstructionExecutor, ensure_parent, source_path};
use crate::error::ExecError;
use crate::instruction::{Instruction, resolve_path};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Adds a file to the image root.
///
/// Local `.tar`, `.tar.gz` and `.tgz` sources are extracted into the
/// destination directory; other local files and every URL are written as a
/// single file. A declared `sha256:` checksum is verified against the
/// source bytes before anything is written.
#[derive(Debug, Clone)]
pub struct AddExecutor {
    client: reqwest::Client,
}

impl AddExecutor {
    /// An add executor with its own HTTP client.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn download(&self, url: &str) -> Result<Bytes, ExecError> {
        info!(url = %url, "Downloading");
        let download = |source| ExecError::Download {
            url: url.to_string(),
            source,
        };
        self.client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(download)?
            .bytes()
            .await
            .map_err(download)
    }
}

impl Default for AddExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn archive_kind(source: &str) -> Option<bool> {
    if source.ends_with(".tar.gz") || source.ends_with(".tgz") {
        Some(true)
    } else if source.ends_with(".tar") {
        Some(false)
    } else {
        None
    }
}

fn file_name(source: &str) -> &str {
    let trimmed = source.split(['?', '#']).next().unwrap_or(source);
    trimmed
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("download")
}

fn verify(source: &str, expected: Option<&str>, actual: &Digest) -> Result<(), ExecError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let matches = expected == actual.as_str() || expected == actual.hex();
    if matches {
        Ok(())
    } else {
        Err(ExecError::ChecksumMismatch {
            source_path: source.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

fn unpack(archive: &Path, gzip: bool, dest: &Path) -> Result<(), ExecError> {
    let file = fs::File::open(archive).map_err(|e| ExecError::io(archive, e))?;
    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    fs::create_dir_all(dest).map_err(|e| ExecError::io(dest, e))?;
    let mut archive_reader = tar::Archive::new(reader);
    archive_reader.set_preserve_permissions(true);
    archive_reader.set_overwrite(true);
    archive_reader.unpack(dest).map_err(|e| ExecError::io(archive, e))
}

fn write_file(target: &Path, content: &[u8], mode: Option<u32>) -> Result<(), ExecError> {
    use std::os::unix::fs::PermissionsExt;

    ensure_parent(target)?;
    if fs::symlink_metadata(target).is_ok_and(|m| m.is_dir()) {
        fs::remove_dir_all(target).map_err(|e| ExecError::io(target, e))?;
    }
    fs::write(target, content).map_err(|e| ExecError::io(target, e))?;
    if let Some(mode) = mode {
        fs::set_permissions(target, fs::Permissions::from_mode(mode)).map_err(|e| ExecError::io(target, e))?;
    }
    Ok(())
}

#[async_trait]
impl InstructionExecutor for AddExecutor {
    async fn apply(&self, ctx: &ExecContext, instruction: &Instruction) -> Result<(), ExecError> {
        let Instruction::Add {
            source,
            dest,
            checksum,
        } = instruction
        else {
            return Err(ExecError::Unsupported {
                executor: self.name(),
                instruction: instruction.to_string(),
            });
        };

        let dest_host = ctx.host_path(&resolve_path(ctx.config.workdir(), dest));
        let into_dir = dest.ends_with('/') || dest_host.is_dir();
        let target = |name: &str| -> PathBuf {
            if into_dir {
                dest_host.join(name)
            } else {
                dest_host.clone()
            }
        };

        if is_url(source) {
            let content = self.download(source).await?;
            verify(source, checksum.as_deref(), &Digest::of(&content))?;
            let target = target(file_name(source));
            write_file(&target, &content, Some(0o600))?;
            debug!(url = %source, dest = %target.display(), bytes = content.len(), "Added download");
            return Ok(());
        }

        let local = source_path(&ctx.context_dir, source);
        let meta = fs::metadata(&local).map_err(|_| ExecError::SourceNotFound {
            source_path: source.clone(),
        })?;
        if checksum.is_some() {
            let actual = hash_file(&local).map_err(|e| ExecError::io(&local, e))?;
            verify(source, checksum.as_deref(), &actual)?;
        }

        let file = file_name(source).to_string();
        let dest_dir = dest_host.clone();
        tokio::task::spawn_blocking(move || match archive_kind(&file) {
            Some(gzip) if meta.is_file() => unpack(&local, gzip, &dest_dir),
            _ => {
                use std::os::unix::fs::PermissionsExt;
                let content = fs::read(&local).map_err(|e| ExecError::io(&local, e))?;
                let target = if into_dir { dest_dir.join(&file) } else { dest_dir };
                write_file(&target, &content, Some(meta.permissions().mode()))
            }
        })
        .await
        .map_err(|e| ExecError::io(&dest_host, std::io::Error::other(e)))??;
        debug!(source = %source, dest = %dest_host.display(), "Added local source");
        Ok(())
    }

    async fn content_digest(&self, ctx: &ExecContext, instruction: &Instruction) -> Result<Option<Digest>, ExecError> {
        let Instruction::Add { source, checksum, .. } = instruction else {
            return Ok(None);
        };
        if is_url(source) {
            // Without a checksum the remote content is unknown until fetched.
            return Ok(checksum.as_deref().and_then(|c| Digest::parse(c).ok()));
        }
        let local = source_path(&ctx.context_dir, source);
        let digest = hash_file(&local).map_err(|_| ExecError::SourceNotFound {
            source_path: source.clone(),
        })?;
        Ok(Some(digest))
    }

    fn name(&self) -> &'static str {
        "add"
    }
}
