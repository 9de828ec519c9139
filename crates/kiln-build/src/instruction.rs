//! Build instructions.
//!
//! [`Instruction`] is a closed set. Each variant answers the questions the
//! stage executor asks of it: does it touch the filesystem, which subtree
//! can it touch, what text identifies it in a cache key, and how does it
//! change the [`StageConfig`].

use std::collections::BTreeMap;
use std::fmt;

use kiln_cache::normalize_instruction;
use kiln_snapshot::snapshot::canonicalize;

use crate::config::StageConfig;

/// One build instruction with its operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Run a shell command in the image root.
    Run {
        /// Command line handed to the shell.
        command: String,
    },
    /// Copy files from the build context or another stage.
    Copy {
        /// Source paths or glob patterns.
        sources: Vec<String>,
        /// Destination; a trailing `/` names a directory.
        dest: String,
        /// Stage to copy from instead of the build context.
        from_stage: Option<String>,
    },
    /// Add a local file, a local archive (extracted) or a remote URL.
    Add {
        /// Path in the build context or an http(s) URL.
        source: String,
        /// Destination; a trailing `/` names a directory.
        dest: String,
        /// Expected `sha256:<hex>` of the source.
        checksum: Option<String>,
    },
    /// Set environment variables.
    Env {
        /// Variables to set.
        vars: BTreeMap<String, String>,
    },
    /// Set the working directory.
    Workdir {
        /// Absolute, or relative to the current working directory.
        path: String,
    },
    /// Set the user.
    User {
        /// User name or id.
        user: String,
    },
    /// Expose a port.
    Expose {
        /// `port` or `port/protocol`.
        port: String,
    },
    /// Set labels.
    Label {
        /// Labels to set.
        labels: BTreeMap<String, String>,
    },
    /// Set the entry point.
    Entrypoint {
        /// Program and arguments.
        args: Vec<String>,
    },
    /// Set the default command.
    Cmd {
        /// Program and arguments.
        args: Vec<String>,
    },
    /// Declare a volume mount point.
    Volume {
        /// Mount point.
        path: String,
    },
}

impl Instruction {
    /// A run instruction.
    pub fn run(command: impl Into<String>) -> Self {
        Self::Run {
            command: command.into(),
        }
    }

    /// A copy from the build context.
    pub fn copy<S: Into<String>>(sources: impl IntoIterator<Item = S>, dest: impl Into<String>) -> Self {
        Self::Copy {
            sources: sources.into_iter().map(Into::into).collect(),
            dest: dest.into(),
            from_stage: None,
        }
    }

    /// A copy from another stage's root.
    pub fn copy_from<S: Into<String>>(
        stage: impl Into<String>,
        sources: impl IntoIterator<Item = S>,
        dest: impl Into<String>,
    ) -> Self {
        Self::Copy {
            sources: sources.into_iter().map(Into::into).collect(),
            dest: dest.into(),
            from_stage: Some(stage.into()),
        }
    }

    /// A single environment variable.
    pub fn env(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Env {
            vars: BTreeMap::from([(key.into(), value.into())]),
        }
    }

    /// A working directory change.
    pub fn workdir(path: impl Into<String>) -> Self {
        Self::Workdir { path: path.into() }
    }

    /// Keyword of the instruction.
    #[must_use]
    pub const fn keyword(&self) -> &'static str {
        match self {
            Self::Run { .. } => "RUN",
            Self::Copy { .. } => "COPY",
            Self::Add { .. } => "ADD",
            Self::Env { .. } => "ENV",
            Self::Workdir { .. } => "WORKDIR",
            Self::User { .. } => "USER",
            Self::Expose { .. } => "EXPOSE",
            Self::Label { .. } => "LABEL",
            Self::Entrypoint { .. } => "ENTRYPOINT",
            Self::Cmd { .. } => "CMD",
            Self::Volume { .. } => "VOLUME",
        }
    }

    /// Whether executing the instruction can change the image root.
    #[must_use]
    pub const fn affects_filesystem(&self) -> bool {
        matches!(self, Self::Run { .. } | Self::Copy { .. } | Self::Add { .. })
    }

    /// Whether the instruction's layer is looked up in and stored to the
    /// layer cache. Config-only instructions always yield the empty layer,
    /// so they only contribute their key to the lineage.
    #[must_use]
    pub const fn cache_relevant(&self) -> bool {
        self.affects_filesystem()
    }

    /// Normalized instruction text, including every operand value.
    #[must_use]
    pub fn cache_text(&self) -> String {
        normalize_instruction(&self.to_string())
    }

    /// Stage a copy reads from, if any.
    #[must_use]
    pub fn from_stage(&self) -> Option<&str> {
        match self {
            Self::Copy { from_stage, .. } => from_stage.as_deref(),
            _ => None,
        }
    }

    /// Image path the instruction can change, for a scoped scan, or `None`
    /// when any path may change.
    #[must_use]
    pub fn scope(&self, config: &StageConfig) -> Option<String> {
        match self {
            Self::Copy { dest, .. } | Self::Add { dest, .. } => Some(resolve_path(config.workdir(), dest)),
            _ => None,
        }
    }

    /// The config after this instruction.
    #[must_use]
    pub fn apply_config(&self, config: &StageConfig) -> StageConfig {
        let next = config.clone();
        match self {
            Self::Run { .. } | Self::Copy { .. } | Self::Add { .. } => next,
            Self::Env { vars } => vars.iter().fold(next, |c, (k, v)| c.with_env(k, v)),
            Self::Workdir { path } => {
                let workdir = resolve_path(config.workdir(), path);
                next.with_workdir(workdir)
            }
            Self::User { user } => next.with_user(user),
            Self::Expose { port } => next.with_exposed_port(normalize_port(port)),
            Self::Label { labels } => labels.iter().fold(next, |c, (k, v)| c.with_label(k, v)),
            Self::Entrypoint { args } => next.with_entrypoint(args.clone()),
            Self::Cmd { args } => next.with_cmd(args.clone()),
            Self::Volume { path } => next.with_volume(path),
        }
    }

    /// Replace `$NAME` and `${NAME}` references in the operands with values
    /// from `vars`. Unknown names are left as written. Run commands are
    /// left alone: the shell expands them from the environment.
    #[must_use]
    pub fn substitute_args(&self, vars: &BTreeMap<String, String>) -> Self {
        let sub = |s: &String| substitute(s, vars);
        match self {
            Self::Run { .. } | Self::Entrypoint { .. } | Self::Cmd { .. } => self.clone(),
            Self::Copy {
                sources,
                dest,
                from_stage,
            } => Self::Copy {
                sources: sources.iter().map(sub).collect(),
                dest: sub(dest),
                from_stage: from_stage.as_ref().map(sub),
            },
            Self::Add {
                source,
                dest,
                checksum,
            } => Self::Add {
                source: sub(source),
                dest: sub(dest),
                checksum: checksum.as_ref().map(sub),
            },
            Self::Env { vars: env } => Self::Env {
                vars: env.iter().map(|(k, v)| (k.clone(), sub(v))).collect(),
            },
            Self::Workdir { path } => Self::Workdir { path: sub(path) },
            Self::User { user } => Self::User { user: sub(user) },
            Self::Expose { port } => Self::Expose { port: sub(port) },
            Self::Label { labels } => Self::Label {
                labels: labels.iter().map(|(k, v)| (k.clone(), sub(v))).collect(),
            },
            Self::Volume { path } => Self::Volume { path: sub(path) },
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyword())?;
        match self {
            Self::Run { command } => write!(f, " {command}"),
            Self::Copy {
                sources,
                dest,
                from_stage,
            } => {
                if let Some(stage) = from_stage {
                    write!(f, " --from={stage}")?;
                }
                let mut operands = sources.clone();
                operands.push(dest.clone());
                write!(f, " {}", quoted_list(&operands))
            }
            Self::Add {
                source,
                dest,
                checksum,
            } => {
                if let Some(checksum) = checksum {
                    write!(f, " --checksum={checksum}")?;
                }
                write!(f, " {}", quoted_list(&[source.clone(), dest.clone()]))
            }
            Self::Env { vars: map } | Self::Label { labels: map } => {
                for (key, value) in map {
                    write!(f, " {key}={}", quoted(value))?;
                }
                Ok(())
            }
            Self::Workdir { path } | Self::Volume { path } => write!(f, " {path}"),
            Self::User { user } => write!(f, " {user}"),
            Self::Expose { port } => write!(f, " {port}"),
            Self::Entrypoint { args } | Self::Cmd { args } => write!(f, " {}", quoted_list(args)),
        }
    }
}

fn quoted(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn quoted_list(values: &[String]) -> String {
    let items: Vec<String> = values.iter().map(|v| quoted(v)).collect();
    format!("[{}]", items.join(", "))
}

/// `80` becomes `80/tcp`; an explicit protocol is kept, lowercased.
fn normalize_port(port: &str) -> String {
    match port.split_once('/') {
        Some((number, protocol)) => format!("{number}/{}", protocol.to_ascii_lowercase()),
        None => format!("{port}/tcp"),
    }
}

/// Resolve `path` against `workdir` into a canonical image path.
#[must_use]
pub fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        canonicalize(path)
    } else {
        canonicalize(&format!("{workdir}/{path}"))
    }
}

/// Expand `$NAME` and `${NAME}` from `vars`, leaving unknown references and
/// malformed ones as written. `\$` yields a literal `$`.
#[must_use]
pub fn substitute(text: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find(['$', '\\']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("\\$") {
            out.push('$');
            rest = after;
            continue;
        }
        if tail.starts_with('\\') {
            out.push('\\');
            rest = &tail[1..];
            continue;
        }

        let (name, consumed) = match tail[1..].strip_prefix('{') {
            Some(inner) => match inner.find('}') {
                Some(end) if is_name(&inner[..end]) => (&inner[..end], end + 3),
                _ => ("", 1),
            },
            None => {
                let len = tail[1..]
                    .bytes()
                    .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
                    .count();
                let name = &tail[1..=len];
                if is_name(name) { (name, len + 1) } else { ("", 1) }
            }
        };

        match vars.get(name) {
            Some(value) if !name.is_empty() => out.push_str(value),
            _ => out.push_str(&tail[..consumed]),
        }
        rest = &tail[consumed..];
    }
    out.push_str(rest);
    out
}

fn is_name(name: &str) -> bool {
    name.bytes().next().is_some_and(|b| b.is_ascii_alphabetic() || b == b'_')
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn capability_flags() {
        assert!(Instruction::run("make").affects_filesystem());
        assert!(Instruction::copy(["a"], "/b").cache_relevant());
        assert!(!Instruction::env("A", "1").affects_filesystem());
        assert!(!Instruction::workdir("/app").cache_relevant());
    }

    #[test]
    fn display_quotes_operands() {
        assert_eq!(Instruction::run("echo hi").to_string(), "RUN echo hi");
        assert_eq!(
            Instruction::copy_from("build", ["out/app"], "/usr/bin/").to_string(),
            r#"COPY --from=build ["out/app", "/usr/bin/"]"#
        );
        assert_eq!(
            Instruction::env("GREETING", "hello  world").to_string(),
            r#"ENV GREETING="hello  world""#
        );
    }

    #[test]
    fn cache_text_includes_values() {
        let a = Instruction::env("MODE", "debug").cache_text();
        let b = Instruction::env("MODE", "release").cache_text();
        assert_ne!(a, b);
        assert_eq!(
            Instruction::run("  make   all ").cache_text(),
            Instruction::run("make all").cache_text()
        );
        // Whitespace inside a value is significant.
        assert_ne!(
            Instruction::env("A", "x y").cache_text(),
            Instruction::env("A", "x  y").cache_text()
        );
    }

    #[test]
    fn scope_resolves_against_workdir() {
        let config = StageConfig::new().with_workdir("/app");
        assert_eq!(
            Instruction::copy(["a"], "src/").scope(&config).as_deref(),
            Some("/app/src")
        );
        assert_eq!(
            Instruction::copy(["a"], "/etc/../opt").scope(&config).as_deref(),
            Some("/opt")
        );
        assert_eq!(Instruction::run("true").scope(&config), None);
    }

    #[test]
    fn apply_config_threads_values() {
        let config = Instruction::workdir("/app").apply_config(&StageConfig::new());
        let config = Instruction::workdir("sub").apply_config(&config);
        let config = Instruction::Expose { port: "8080".into() }.apply_config(&config);
        let config = Instruction::env("A", "1").apply_config(&config);

        assert_eq!(config.workdir(), "/app/sub");
        assert!(config.exposed_ports().contains("8080/tcp"));
        assert_eq!(config.env()["A"], "1");
        assert_eq!(Instruction::run("x").apply_config(&config), config);
    }

    #[test]
    fn substitution() {
        let v = vars(&[("VERSION", "1.2"), ("DIR", "/opt")]);
        assert_eq!(substitute("${DIR}/app-$VERSION.tar", &v), "/opt/app-1.2.tar");
        assert_eq!(substitute("$UNKNOWN ${ALSO}", &v), "$UNKNOWN ${ALSO}");
        assert_eq!(substitute(r"\$VERSION $ ${", &v), "$VERSION $ ${");
        assert_eq!(substitute("$1 $VERSION_X", &v), "$1 $VERSION_X");
    }

    #[test]
    fn substitute_args_leaves_run_alone() {
        let v = vars(&[("V", "2")]);
        assert_eq!(Instruction::run("echo $V").substitute_args(&v), Instruction::run("echo $V"));
        assert_eq!(
            Instruction::copy(["app-$V"], "/opt/$V/").substitute_args(&v),
            Instruction::copy(["app-2"], "/opt/2/")
        );
    }
}
