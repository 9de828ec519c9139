//! Kilnfile - the build description format.
//!
//! A Kilnfile lists build arguments and stages. It can be written as YAML,
//! TOML or JSON:
//!
//! ```yaml
//! args:
//!   VERSION: "1.0"
//!   TOKEN: { env: CI_TOKEN, default: "" }
//!
//! stages:
//!   - name: build
//!     from: scratch
//!     steps:
//!       - copy: { from: app.txt, to: /app.txt }
//!       - run: echo hi >> app.txt
//!   - from: stage:build
//!     steps:
//!       - env: { MODE: release }
//!       - cmd: ["/app.txt"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use kiln_common::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};

use crate::instruction::Instruction;
use crate::stage::{BaseRef, BuildStage};

/// A parsed Kilnfile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Buildfile {
    /// Build arguments with optional env fallbacks.
    #[serde(default)]
    pub args: BTreeMap<String, ArgValue>,

    /// Image metadata.
    #[serde(default)]
    pub metadata: Metadata,

    /// Build stages, in order. The last one is the default target.
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// Argument value with optional environment fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// Simple string value.
    Simple(String),

    /// Value read from the environment, with a default.
    WithFallback {
        /// Default value.
        #[serde(default)]
        default: Option<String>,
        /// Environment variable to read from.
        #[serde(rename = "env", default)]
        env_var: Option<String>,
        /// Description for documentation.
        #[serde(default)]
        description: Option<String>,
    },
}

impl ArgValue {
    /// Resolve the value: the environment variable if set, else the
    /// default. `None` when neither gives a value.
    #[must_use]
    pub fn resolve(&self) -> Option<String> {
        match self {
            Self::Simple(s) => Some(s.clone()),
            Self::WithFallback {
                default, env_var, ..
            } => env_var
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .or_else(|| default.clone()),
        }
    }
}

/// Image metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Image name.
    #[serde(default)]
    pub name: Option<String>,
    /// Image tag.
    #[serde(default)]
    pub tag: Option<String>,
    /// Labels applied to the final image.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Metadata {
    /// `name:tag`, or `name` alone, if a name is set.
    #[must_use]
    pub fn reference(&self) -> Option<String> {
        let name = self.name.as_ref()?;
        Some(match &self.tag {
            Some(tag) => format!("{name}:{tag}"),
            None => name.clone(),
        })
    }
}

/// One stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name.
    #[serde(default)]
    pub name: Option<String>,
    /// `scratch`, `stage:<name>`, or an image reference.
    #[serde(default = "default_from")]
    pub from: String,
    /// Steps, in order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_from() -> String {
    "scratch".to_string()
}

/// One step of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    /// Run a shell command.
    Run(String),
    /// Copy files.
    Copy(CopyStep),
    /// Add a file, archive or URL.
    Add(AddStep),
    /// Set environment variables.
    Env(BTreeMap<String, String>),
    /// Set the working directory.
    Workdir(String),
    /// Set the user.
    User(String),
    /// Expose a port.
    Expose(ExposeStep),
    /// Set labels.
    Label(BTreeMap<String, String>),
    /// Set the entry point.
    Entrypoint(Vec<String>),
    /// Set the default command.
    Cmd(Vec<String>),
    /// Declare a volume.
    Volume(String),
}

/// Copy step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CopyStep {
    /// Several sources, optionally from another stage.
    Detailed {
        /// Source paths or globs.
        sources: Vec<String>,
        /// Destination.
        to: String,
        /// Stage to copy from.
        #[serde(default)]
        from_stage: Option<String>,
    },
    /// One source from the build context.
    Simple {
        /// Source path or glob.
        from: String,
        /// Destination.
        to: String,
    },
}

/// Add step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddStep {
    /// Local path or URL.
    pub source: String,
    /// Destination.
    pub to: String,
    /// Expected `sha256:<hex>`.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Expose step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExposeStep {
    /// Bare port number.
    Port(u16),
    /// `port/protocol` text.
    Spec(String),
    /// Port with protocol.
    Detailed {
        /// Port number.
        port: u16,
        /// `tcp` or `udp`.
        #[serde(default = "default_protocol")]
        protocol: String,
    },
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl From<&Step> for Instruction {
    fn from(step: &Step) -> Self {
        match step {
            Step::Run(command) => Self::run(command.clone()),
            Step::Copy(CopyStep::Simple { from, to }) => Self::copy([from.clone()], to.clone()),
            Step::Copy(CopyStep::Detailed {
                sources,
                to,
                from_stage,
            }) => Self::Copy {
                sources: sources.clone(),
                dest: to.clone(),
                from_stage: from_stage.clone(),
            },
            Step::Add(add) => Self::Add {
                source: add.source.clone(),
                dest: add.to.clone(),
                checksum: add.checksum.clone(),
            },
            Step::Env(vars) => Self::Env { vars: vars.clone() },
            Step::Workdir(path) => Self::workdir(path.clone()),
            Step::User(user) => Self::User { user: user.clone() },
            Step::Expose(ExposeStep::Port(port)) => Self::Expose {
                port: port.to_string(),
            },
            Step::Expose(ExposeStep::Spec(port)) => Self::Expose { port: port.clone() },
            Step::Expose(ExposeStep::Detailed { port, protocol }) => Self::Expose {
                port: format!("{port}/{protocol}"),
            },
            Step::Label(labels) => Self::Label {
                labels: labels.clone(),
            },
            Step::Entrypoint(args) => Self::Entrypoint { args: args.clone() },
            Step::Cmd(args) => Self::Cmd { args: args.clone() },
            Step::Volume(path) => Self::Volume { path: path.clone() },
        }
    }
}

impl Buildfile {
    /// Load from a file, choosing the format by extension (YAML by default).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> KilnResult<Self> {
        let content = fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

        match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse from YAML.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem.
    pub fn from_yaml(content: &str) -> KilnResult<Self> {
        let value: serde_json::Value = serde_yaml::from_str(content).map_err(|e| KilnError::Config {
            message: format!("Failed to parse YAML structure: {e}"),
        })?;

        serde_json::from_value(value).map_err(|e| KilnError::Config {
            message: format!("Failed to interpret YAML as Kilnfile: {e}"),
        })
    }

    /// Parse from TOML.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem.
    pub fn from_toml(content: &str) -> KilnResult<Self> {
        toml::from_str(content).map_err(|e| KilnError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })
    }

    /// Parse from JSON.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem.
    pub fn from_json(content: &str) -> KilnResult<Self> {
        serde_json::from_str(content).map_err(|e| KilnError::Config {
            message: format!("Failed to parse JSON: {e}"),
        })
    }

    /// Build arguments: declared values, then `overrides` on top.
    #[must_use]
    pub fn resolve_args(&self, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut args: BTreeMap<String, String> = self
            .args
            .iter()
            .filter_map(|(k, v)| v.resolve().map(|v| (k.clone(), v)))
            .collect();
        args.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        args
    }

    /// The stages as build stages. Metadata labels are appended to the last
    /// stage as a label instruction.
    #[must_use]
    pub fn to_stages(&self) -> Vec<BuildStage> {
        let mut stages: Vec<BuildStage> = self
            .stages
            .iter()
            .map(|stage| BuildStage {
                name: stage.name.clone(),
                base: BaseRef::parse(&stage.from),
                instructions: stage.steps.iter().map(Instruction::from).collect(),
            })
            .collect();
        if let Some(last) = stages.last_mut() {
            if !self.metadata.labels.is_empty() {
                last.instructions.push(Instruction::Label {
                    labels: self.metadata.labels.clone(),
                });
            }
        }
        stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
args:
  VERSION: "1.0"
  FROM_ENV:
    env: KILN_TEST_SURELY_UNSET_VARIABLE
    default: fallback
  NOTHING:
    description: no value anywhere

metadata:
  name: demo
  tag: latest
  labels:
    org.example.team: builds

stages:
  - name: build
    steps:
      - copy: { from: app.txt, to: /app.txt }
      - run: echo hi >> app.txt
      - add: { source: "https://example.com/tool-${VERSION}.tgz", to: /opt/, checksum: "sha256:00" }
  - from: stage:build
    steps:
      - copy: { sources: [/app.txt], to: /srv/, from_stage: build }
      - env: { MODE: release }
      - workdir: /srv
      - expose: 8080
      - expose: { port: 53, protocol: udp }
      - expose: 443/tcp
      - cmd: ["cat", "app.txt"]
"#;

    #[test]
    fn parses_yaml() {
        let file = Buildfile::from_yaml(SAMPLE_YAML).unwrap();
        assert_eq!(file.stages.len(), 2);
        assert_eq!(file.stages[0].from, "scratch");
        assert_eq!(file.metadata.reference().as_deref(), Some("demo:latest"));
        assert_eq!(file.stages[0].steps[1], Step::Run("echo hi >> app.txt".to_string()));
    }

    #[test]
    fn converts_to_stages() {
        let stages = Buildfile::from_yaml(SAMPLE_YAML).unwrap().to_stages();
        assert_eq!(stages[0].name.as_deref(), Some("build"));
        assert_eq!(stages[0].instructions[0], Instruction::copy(["app.txt"], "/app.txt"));
        assert_eq!(stages[1].base, BaseRef::Stage("build".to_string()));
        assert_eq!(
            stages[1].instructions[0],
            Instruction::copy_from("build", ["/app.txt"], "/srv/")
        );

        let ports: Vec<_> = stages[1]
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Expose { port } => Some(port.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ports, vec!["8080", "53/udp", "443/tcp"]);
        assert!(matches!(stages[1].instructions.last(), Some(Instruction::Label { .. })));
    }

    #[test]
    fn resolves_args_with_overrides() {
        let file = Buildfile::from_yaml(SAMPLE_YAML).unwrap();
        let args = file.resolve_args(&BTreeMap::from([("VERSION".to_string(), "2.0".to_string())]));
        assert_eq!(args["VERSION"], "2.0");
        assert_eq!(args["FROM_ENV"], "fallback");
        assert!(!args.contains_key("NOTHING"));
    }

    #[test]
    fn parses_toml_and_json() {
        let toml = r#"
            [[stages]]
            name = "only"
            from = "scratch"

            [[stages.steps]]
            run = "true"

            [[stages.steps]]
            env = { A = "1" }
        "#;
        let file = Buildfile::from_toml(toml).unwrap();
        assert_eq!(file.stages[0].steps.len(), 2);

        let json = r#"{"stages":[{"steps":[{"workdir":"/app"},{"volume":"/data"}]}]}"#;
        let stages = Buildfile::from_json(json).unwrap().to_stages();
        assert_eq!(stages[0].base, BaseRef::Scratch);
        assert_eq!(stages[0].instructions[0], Instruction::workdir("/app"));
    }

    #[test]
    fn unknown_step_is_an_error() {
        let err = Buildfile::from_yaml("stages:\n  - steps:\n      - teleport: now\n").unwrap_err();
        assert!(matches!(err, KilnError::Config { .. }));
    }

    #[test]
    fn from_file_uses_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Kilnfile.json");
        fs::write(&path, r#"{"stages":[{"name":"x"}]}"#).unwrap();
        let file = Buildfile::from_file(&path).unwrap();
        assert_eq!(file.stages[0].name.as_deref(), Some("x"));
    }
}
