//! Kiln CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use kiln_cache::{LayerCache, LocalLayerCache, RemoteLayerCache};
use kiln_common::{KilnPaths, Settings};
use tokio_util::sync::CancellationToken;

use crate::buildfile::Buildfile;
use crate::composer::read_oci_layout;
use crate::graph::{BuildGraph, DirectoryBaseResolver};
use crate::stage::StageExecutor;

/// Kiln - daemonless container image builder
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Settings file (kiln.toml)
    #[arg(long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory (cache and scratch space)
    #[arg(long, global = true, env = "KILN_ROOT")]
    pub root: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Kiln commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Build an image
    Build {
        /// Path to Kilnfile
        #[arg(short, long, default_value = "Kilnfile.yaml")]
        file: PathBuf,

        /// Build context directory
        #[arg(default_value = ".")]
        context: PathBuf,

        /// Image reference recorded in the output
        #[arg(short, long)]
        tag: Option<String>,

        /// Build arguments (KEY=VALUE)
        #[arg(long = "build-arg")]
        args: Vec<String>,

        /// Target stage to build
        #[arg(long)]
        target: Option<String>,

        /// Don't use cache
        #[arg(long)]
        no_cache: bool,

        /// Output directory for the OCI image layout
        #[arg(short, long, default_value = "image")]
        output: PathBuf,

        /// Base image directories (NAME=DIR)
        #[arg(long = "base")]
        bases: Vec<String>,

        /// Per-instruction timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Inspect an OCI image layout
    Inspect {
        /// Layout directory
        path: PathBuf,

        /// Format output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage the layer cache
    Cache {
        /// Cache subcommands.
        #[command(subcommand)]
        command: CacheCommands,
    },
}

/// Layer cache management subcommands.
#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cached layers
    List {
        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },
    /// Evict least recently used entries
    Prune {
        /// Size to shrink the cache to; defaults to the configured limit
        #[arg(long)]
        max_bytes: Option<u64>,
    },
    /// Clear all cache
    Clear {
        /// Don't ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Show cache statistics
    Stats,
}

fn parse_pairs(values: &[String], what: &str) -> BTreeMap<String, String> {
    values
        .iter()
        .filter_map(|value| match value.split_once('=') {
            Some((k, v)) if !k.is_empty() => Some((k.to_string(), v.to_string())),
            _ => {
                eprintln!("Warning: Invalid {what} format '{value}'. Expected KEY=VALUE");
                None
            }
        })
        .collect()
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let settings = Settings::load(self.config.as_deref())?;
        let paths = self.root.map_or_else(KilnPaths::new, KilnPaths::with_root);

        match self.command {
            Commands::Build {
                file,
                context,
                tag,
                args,
                target,
                no_cache,
                output,
                bases,
                timeout,
            } => {
                tracing::info!(
                    file = %file.display(),
                    context = %context.display(),
                    tag = ?tag,
                    "Building image"
                );

                let kilnfile = Buildfile::from_file(&file)?;
                let build_args = kilnfile.resolve_args(&parse_pairs(&args, "build-arg"));
                let graph = BuildGraph::new(kilnfile.to_stages())?;
                let tag = tag.or_else(|| kilnfile.metadata.reference());

                let mut executor = StageExecutor::from_settings(&settings)?
                    .with_build_args(build_args)
                    .with_context_dir(&context);
                if let Some(secs) = timeout {
                    executor = executor.with_timeout(Some(Duration::from_secs(secs)));
                }
                if settings.cache.enabled && !no_cache {
                    let cache: Arc<dyn LayerCache> = match &settings.cache.remote_url {
                        Some(url) => Arc::new(RemoteLayerCache::new(url)?),
                        None => Arc::new(LocalLayerCache::new(&settings.cache_dir(&paths))?),
                    };
                    tracing::debug!(cache = cache.name(), "Layer cache enabled");
                    executor = executor.with_cache(cache);
                }

                let resolver = parse_pairs(&bases, "base")
                    .into_iter()
                    .fold(DirectoryBaseResolver::new(), |resolver, (name, dir)| {
                        resolver.with_image(name, dir)
                    });

                let cancel = CancellationToken::new();
                let interrupt = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("Interrupted, canceling build");
                        interrupt.cancel();
                    }
                });

                let result = graph
                    .run(&executor, Arc::new(resolver), &paths.scratch(), target.as_deref(), &cancel)
                    .await?;
                let stage = result
                    .target_result()
                    .ok_or_else(|| eyre!("Target stage produced no result"))?;

                let mut composer = stage.compose()?;
                if let Some(tag) = &tag {
                    composer = composer.with_reference(tag.clone());
                }
                let image = composer.write_oci_layout(&output)?;

                let trace = &stage.output.trace;
                println!("\nBuild complete!");
                if let Some(tag) = &tag {
                    println!("  Tag:    {tag}");
                }
                println!("  Digest: {}", image.digest);
                println!("  Layers: {}", image.manifest.layers.len());
                println!("  Size:   {}", format_size(image.layers_size()));
                println!("  Cached: {} of {} steps", trace.cached().len(), trace.cached().len() + trace.executed().len());
                println!("  Output: {}", output.display());

                Ok(())
            }

            Commands::Inspect { path, json } => {
                let image = read_oci_layout(&path)?;
                let config = &image.config.config;

                if json {
                    let output = serde_json::json!({
                        "digest": image.digest,
                        "reference": image.reference,
                        "architecture": image.config.architecture,
                        "os": image.config.os,
                        "layers": image.manifest.layers,
                        "config": config,
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                    return Ok(());
                }

                println!("Image: {}", path.display());
                println!("Digest: {}", image.digest);
                if let Some(reference) = &image.reference {
                    println!("Reference: {reference}");
                }
                println!("Architecture: {}", image.config.architecture);
                println!("OS: {}", image.config.os);
                println!("Layers: {}", image.manifest.layers.len());
                for layer in &image.manifest.layers {
                    println!("  {} ({})", layer.digest, format_size(layer.size));
                }
                if let Some(entrypoint) = &config.entrypoint {
                    println!("Entrypoint: {entrypoint:?}");
                }
                if let Some(cmd) = &config.cmd {
                    println!("Cmd: {cmd:?}");
                }
                if let Some(workdir) = &config.working_dir {
                    println!("WorkingDir: {workdir}");
                }
                if !config.env.is_empty() {
                    println!("Environment:");
                    for env in &config.env {
                        println!("  {env}");
                    }
                }
                if !config.labels.is_empty() {
                    println!("Labels:");
                    for (k, v) in &config.labels {
                        println!("  {k}: {v}");
                    }
                }
                Ok(())
            }

            Commands::Cache { command } => {
                let cache_dir = settings.cache_dir(&paths);
                let cache = LocalLayerCache::new(&cache_dir)?;

                match command {
                    CacheCommands::List { verbose } => {
                        let mut entries = cache.list_entries()?;
                        if entries.is_empty() {
                            println!("No cached layers");
                            return Ok(());
                        }
                        entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));

                        println!("Cached layers ({}):", entries.len());
                        println!();
                        for entry in &entries {
                            if verbose {
                                println!("Key:      {}", entry.key);
                                println!("Layer:    {}", entry.layer_digest);
                                println!("Ops:      {}", entry.ops.len());
                                println!("Size:     {}", format_size(entry.size_bytes));
                                println!("Stored:   {}", format_timestamp(entry.stored_at));
                                println!("Accessed: {}", format_timestamp(entry.last_accessed));
                                println!();
                            } else {
                                let hex = entry.key.hex();
                                println!(
                                    "  {} ({}) - {}",
                                    &hex[..12.min(hex.len())],
                                    format_size(entry.size_bytes),
                                    format_timestamp(entry.last_accessed)
                                );
                            }
                        }
                        println!();
                        println!(
                            "Total: {} entries, {} total",
                            entries.len(),
                            format_size(cache.total_size()?)
                        );
                        Ok(())
                    }

                    CacheCommands::Prune { max_bytes } => {
                        let Some(limit) = max_bytes.or(settings.cache.max_bytes) else {
                            return Err(eyre!("No size limit given; pass --max-bytes or set cache.max_bytes"));
                        };
                        println!("Pruning cache to {}...", format_size(limit));
                        let stats = cache.prune(limit)?;
                        println!(
                            "Removed {} entries and {} blobs, freed {}",
                            stats.entries_removed,
                            stats.blobs_removed,
                            format_size(stats.bytes_freed)
                        );
                        Ok(())
                    }

                    CacheCommands::Clear { yes } => {
                        if !yes {
                            println!("This will delete all cached layers.");
                            print!("Continue? [y/N] ");
                            use std::io::{self, Write};
                            io::stdout().flush()?;

                            let mut input = String::new();
                            io::stdin().read_line(&mut input)?;

                            if !input.trim().eq_ignore_ascii_case("y") {
                                println!("Aborted");
                                return Ok(());
                            }
                        }

                        let size = cache.total_size()?;
                        cache.clear()?;
                        println!("Cleared cache, freed {}", format_size(size));
                        Ok(())
                    }

                    CacheCommands::Stats => {
                        println!("Layer Cache Statistics");
                        println!("======================");
                        println!("Location: {}", cache_dir.display());
                        println!("Entries:  {}", cache.list_entries()?.len());
                        println!("Size:     {}", format_size(cache.total_size()?));
                        if let Some(limit) = settings.cache.max_bytes {
                            println!("Limit:    {}", format_size(limit));
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    let secs = (Utc::now() - ts).num_seconds();
    if secs < 0 {
        "unknown".to_string()
    } else if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86400)
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
