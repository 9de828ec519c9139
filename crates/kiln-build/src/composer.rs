//! Image composition.
//!
//! The composer only accumulates: it takes the layers a build produced, in
//! order, and the final config, and turns them into an OCI image config,
//! manifest and layout. It never diffs or caches.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use kiln_common::{Digest, KilnError, KilnResult};
use kiln_snapshot::Layer;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::StageConfig;

/// Media type of an OCI image manifest.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// Media type of an OCI image config.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
/// Media type of an uncompressed layer tar.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
/// Annotation carrying the layer digest a tar was serialized from.
pub const LAYER_DIGEST_ANNOTATION: &str = "dev.kiln.layer.digest";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Content digest.
    pub digest: Digest,
    /// Content size.
    pub size: u64,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Schema version.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Media type.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors.
    pub layers: Vec<Descriptor>,
}

/// Runtime configuration inside the image config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    /// User.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// `KEY=value` environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Entry point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Default command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Exposed ports.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    /// Volumes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, serde_json::Value>,
    /// Labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl From<&StageConfig> for ContainerConfig {
    fn from(config: &StageConfig) -> Self {
        let empty = || serde_json::Value::Object(serde_json::Map::new());
        Self {
            user: config.user().map(ToString::to_string),
            env: config.env_list(),
            entrypoint: config.entrypoint().map(<[String]>::to_vec),
            cmd: config.cmd().map(<[String]>::to_vec),
            working_dir: config.has_workdir().then(|| config.workdir().to_string()),
            exposed_ports: config.exposed_ports().iter().map(|p| (p.clone(), empty())).collect(),
            volumes: config.volumes().iter().map(|v| (v.clone(), empty())).collect(),
            labels: config.labels().clone(),
        }
    }
}

/// Layer list of an image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Digests of the uncompressed layer tars, in order.
    pub diff_ids: Vec<Digest>,
}

/// OCI image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// CPU architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Runtime configuration.
    pub config: ContainerConfig,
    /// Layers.
    pub rootfs: RootFs,
}

/// A finalized image: config and manifest with their serialized bytes.
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    /// The image config.
    pub config: ImageConfig,
    /// Serialized config.
    pub config_bytes: Vec<u8>,
    /// The manifest.
    pub manifest: ImageManifest,
    /// Serialized manifest.
    pub manifest_bytes: Vec<u8>,
    /// Digest of the serialized manifest; the image's identity.
    pub digest: Digest,
}

impl ImageDescriptor {
    /// Total size of the layer tars.
    #[must_use]
    pub fn layers_size(&self) -> u64 {
        self.manifest.layers.iter().map(|l| l.size).sum()
    }
}

#[derive(Debug, Clone)]
struct PendingLayer {
    digest: Digest,
    diff_id: Digest,
    tar: Vec<u8>,
}

/// Accumulates layers and config into an image.
#[derive(Debug, Clone, Default)]
pub struct ImageComposer {
    layers: Vec<PendingLayer>,
    config: StageConfig,
    reference: Option<String>,
}

/// OCI architecture name for the host.
fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

impl ImageComposer {
    /// An image with no layers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Name recorded in the layout index.
    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Append a layer's tar. Empty layers add nothing to the image.
    pub fn append_layer(&mut self, digest: Digest, tar: Vec<u8>) {
        if digest == Layer::empty_digest() {
            debug!("Skipping empty layer");
            return;
        }
        let diff_id = Digest::of(&tar);
        self.layers.push(PendingLayer { digest, diff_id, tar });
    }

    /// Take the config the build ended with.
    pub fn apply_config_delta(&mut self, config: &StageConfig) {
        self.config = config.clone();
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no layers were appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Build the config and manifest.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if either document cannot be encoded.
    pub fn finalize(&self) -> KilnResult<ImageDescriptor> {
        let config = ImageConfig {
            architecture: host_architecture().to_string(),
            os: "linux".to_string(),
            config: ContainerConfig::from(&self.config),
            rootfs: RootFs {
                kind: "layers".to_string(),
                diff_ids: self.layers.iter().map(|l| l.diff_id.clone()).collect(),
            },
        };
        let config_bytes = serde_json::to_vec(&config)?;

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config: Descriptor {
                media_type: CONFIG_MEDIA_TYPE.to_string(),
                digest: Digest::of(&config_bytes),
                size: config_bytes.len() as u64,
                annotations: BTreeMap::new(),
            },
            layers: self
                .layers
                .iter()
                .map(|l| Descriptor {
                    media_type: LAYER_MEDIA_TYPE.to_string(),
                    digest: l.diff_id.clone(),
                    size: l.tar.len() as u64,
                    annotations: BTreeMap::from([(LAYER_DIGEST_ANNOTATION.to_string(), l.digest.to_string())]),
                })
                .collect(),
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let digest = Digest::of(&manifest_bytes);

        Ok(ImageDescriptor {
            config,
            config_bytes,
            manifest,
            manifest_bytes,
            digest,
        })
    }

    /// Write the image as an OCI image layout in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be finalized or written.
    pub fn write_oci_layout(&self, dir: &Path) -> KilnResult<ImageDescriptor> {
        let image = self.finalize()?;
        let blobs = dir.join("blobs").join("sha256");
        fs::create_dir_all(&blobs)?;

        let write_blob = |digest: &Digest, bytes: &[u8]| -> KilnResult<()> {
            let path = blobs.join(digest.hex());
            if !path.exists() {
                fs::write(path, bytes)?;
            }
            Ok(())
        };
        for layer in &self.layers {
            write_blob(&layer.diff_id, &layer.tar)?;
        }
        write_blob(&image.manifest.config.digest, &image.config_bytes)?;
        write_blob(&image.digest, &image.manifest_bytes)?;

        let mut annotations = BTreeMap::new();
        if let Some(reference) = &self.reference {
            annotations.insert(REF_NAME_ANNOTATION.to_string(), reference.clone());
        }
        let entry = Descriptor {
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            digest: image.digest.clone(),
            size: image.manifest_bytes.len() as u64,
            annotations,
        };
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [entry],
        });
        fs::write(dir.join("index.json"), serde_json::to_vec_pretty(&index)?)?;
        fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#)?;

        debug!(path = %dir.display(), digest = %image.digest, layers = self.layers.len(), "OCI layout written");
        Ok(image)
    }
}

/// An image read back from an OCI layout.
#[derive(Debug, Clone)]
pub struct LayoutImage {
    /// Manifest digest.
    pub digest: Digest,
    /// Name from the index, if any.
    pub reference: Option<String>,
    /// The manifest.
    pub manifest: ImageManifest,
    /// The config.
    pub config: ImageConfig,
}

/// Read the first image of the OCI layout in `dir`.
///
/// # Errors
///
/// Returns a configuration error if `dir` is not a valid layout or a blob
/// does not match its digest.
pub fn read_oci_layout(dir: &Path) -> KilnResult<LayoutImage> {
    let invalid = |message: String| KilnError::Config { message };
    if !dir.join("oci-layout").exists() {
        return Err(invalid(format!("Not an OCI image layout: {}", dir.display())));
    }

    let index: serde_json::Value = serde_json::from_slice(&fs::read(dir.join("index.json"))?)?;
    let entry = index["manifests"]
        .get(0)
        .cloned()
        .ok_or_else(|| invalid("No manifests in image".to_string()))?;
    let entry: Descriptor = serde_json::from_value(entry)?;

    let read_blob = |digest: &Digest| -> KilnResult<Vec<u8>> {
        let bytes = fs::read(dir.join("blobs").join(digest.algorithm()).join(digest.hex()))?;
        if &Digest::of(&bytes) != digest {
            return Err(invalid(format!("Blob does not match its digest: {digest}")));
        }
        Ok(bytes)
    };

    let manifest: ImageManifest = serde_json::from_slice(&read_blob(&entry.digest)?)?;
    let config: ImageConfig = serde_json::from_slice(&read_blob(&manifest.config.digest)?)?;
    Ok(LayoutImage {
        digest: entry.digest,
        reference: entry.annotations.get(REF_NAME_ANNOTATION).cloned(),
        manifest,
        config,
    })
}
