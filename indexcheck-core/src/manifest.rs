//! Operator manifest parsing
//!
//! Three document shapes matter to the pipeline:
//! - Kubernetes objects in a bundle's manifest directory, one of which must be
//!   a `ClusterServiceVersion` (CSV) carrying the version and upgrade edges
//! - the bundle's `metadata/annotations.yaml`
//! - a `package.yaml` package manifest listing channels and their heads
//!
//! Objects are kept as `serde_json::Value` so everything round-trips through
//! the catalog database untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CSV_KIND: &str = "ClusterServiceVersion";
pub const SKIP_RANGE_ANNOTATION: &str = "olm.skipRange";

pub const MEDIATYPE_LABEL: &str = "operators.operatorframework.io.bundle.mediatype.v1";
pub const MANIFESTS_LABEL: &str = "operators.operatorframework.io.bundle.manifests.v1";
pub const METADATA_LABEL: &str = "operators.operatorframework.io.bundle.metadata.v1";
pub const PACKAGE_LABEL: &str = "operators.operatorframework.io.bundle.package.v1";
pub const CHANNELS_LABEL: &str = "operators.operatorframework.io.bundle.channels.v1";
pub const DEFAULT_CHANNEL_LABEL: &str = "operators.operatorframework.io.bundle.channel.default.v1";

pub const REGISTRY_V1_MEDIATYPE: &str = "registry+v1";
pub const MANIFESTS_DIR: &str = "manifests/";
pub const METADATA_DIR: &str = "metadata/";
pub const ANNOTATIONS_FILE: &str = "annotations.yaml";

/// Errors reading or interpreting manifests
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("{} is not a directory", .path.display())]
    NotADirectory { path: PathBuf },

    #[error("no ClusterServiceVersion found in {}", .path.display())]
    MissingCsv { path: PathBuf },

    #[error("more than one ClusterServiceVersion found in {}", .path.display())]
    MultipleCsvs { path: PathBuf },

    #[error("invalid {what} in {}: {message}", .path.display())]
    Invalid {
        what: &'static str,
        path: PathBuf,
        message: String,
    },
}

/// Is this a file the loaders should parse?
pub fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Parse every YAML document in `content`, skipping empty ones
pub fn parse_documents(path: &Path, content: &str) -> Result<Vec<Value>, ManifestError> {
    let mut documents = Vec::new();
    for document in serde_yaml_ng::Deserializer::from_str(content) {
        let value = Value::deserialize(document).map_err(|e| ManifestError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

/// Read and parse all documents of one file
pub fn read_documents(path: &Path) -> Result<Vec<Value>, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_documents(path, &content)
}

/// `kind` of a Kubernetes object
pub fn object_kind(object: &Value) -> Option<&str> {
    object.get("kind").and_then(Value::as_str)
}

/// `metadata.name` of a Kubernetes object
pub fn object_name(object: &Value) -> Option<&str> {
    object
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
}

/// Read-only view over a ClusterServiceVersion object
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterServiceVersion {
    object: Value,
}

impl ClusterServiceVersion {
    /// Wrap an object, checking kind and name
    pub fn from_object(object: Value) -> Option<Self> {
        (object_kind(&object) == Some(CSV_KIND) && object_name(&object).is_some())
            .then_some(Self { object })
    }

    pub fn name(&self) -> &str {
        object_name(&self.object).unwrap_or_default()
    }

    fn spec_str(&self, key: &str) -> Option<&str> {
        self.object
            .get("spec")
            .and_then(|s| s.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// `spec.version`, empty when absent
    pub fn version(&self) -> &str {
        self.spec_str("version").unwrap_or_default()
    }

    /// `spec.replaces`
    pub fn replaces(&self) -> Option<&str> {
        self.spec_str("replaces")
    }

    /// `spec.skips`
    pub fn skips(&self) -> Vec<String> {
        self.object
            .get("spec")
            .and_then(|s| s.get("skips"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `olm.skipRange` annotation
    pub fn skip_range(&self) -> Option<&str> {
        self.object
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(SKIP_RANGE_ANNOTATION))
            .and_then(Value::as_str)
    }

    pub fn as_value(&self) -> &Value {
        &self.object
    }
}

/// All objects of one bundle's manifest directory
#[derive(Debug, Clone)]
pub struct ManifestDir {
    pub path: PathBuf,
    pub csv: ClusterServiceVersion,
    /// Every object in the directory, CSV included, in file-name order
    pub objects: Vec<Value>,
}

impl ManifestDir {
    /// Load a bundle manifest directory (not recursive)
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.is_dir() {
            return Err(ManifestError::NotADirectory {
                path: path.to_path_buf(),
            });
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(|source| ManifestError::Read {
                path: path.to_path_buf(),
                source,
            })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_manifest_file(p))
            .collect();
        files.sort();

        let mut objects = Vec::new();
        for file in &files {
            objects.extend(
                read_documents(file)?
                    .into_iter()
                    .filter(|doc| object_kind(doc).is_some()),
            );
        }

        let mut csvs = objects
            .iter()
            .filter(|o| object_kind(o) == Some(CSV_KIND))
            .cloned();
        let csv = csvs.next().ok_or_else(|| ManifestError::MissingCsv {
            path: path.to_path_buf(),
        })?;
        if csvs.next().is_some() {
            return Err(ManifestError::MultipleCsvs {
                path: path.to_path_buf(),
            });
        }
        let csv = ClusterServiceVersion::from_object(csv).ok_or_else(|| ManifestError::Invalid {
            what: CSV_KIND,
            path: path.to_path_buf(),
            message: "metadata.name is required".to_string(),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            csv,
            objects,
        })
    }
}

/// Bundle `metadata/annotations.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleAnnotations {
    pub annotations: BTreeMap<String, String>,
}

impl BundleAnnotations {
    /// Annotations for a `registry+v1` bundle
    pub fn registry_v1(package: &str, channels: &[String], default_channel: Option<&str>) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(MEDIATYPE_LABEL.to_string(), REGISTRY_V1_MEDIATYPE.to_string());
        annotations.insert(MANIFESTS_LABEL.to_string(), MANIFESTS_DIR.to_string());
        annotations.insert(METADATA_LABEL.to_string(), METADATA_DIR.to_string());
        annotations.insert(PACKAGE_LABEL.to_string(), package.to_string());
        annotations.insert(CHANNELS_LABEL.to_string(), channels.join(","));
        if let Some(default) = default_channel {
            annotations.insert(DEFAULT_CHANNEL_LABEL.to_string(), default.to_string());
        }
        Self { annotations }
    }

    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: Self = serde_yaml_ng::from_str(&content).map_err(|e| ManifestError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if parsed.package().is_none() {
            return Err(ManifestError::Invalid {
                what: "annotations",
                path: path.to_path_buf(),
                message: format!("missing {PACKAGE_LABEL}"),
            });
        }
        if parsed.channels().is_empty() {
            return Err(ManifestError::Invalid {
                what: "annotations",
                path: path.to_path_buf(),
                message: format!("missing {CHANNELS_LABEL}"),
            });
        }
        Ok(parsed)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml_ng::Error> {
        serde_yaml_ng::to_string(self)
    }

    pub fn package(&self) -> Option<&str> {
        self.annotations
            .get(PACKAGE_LABEL)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn channels(&self) -> Vec<String> {
        self.annotations
            .get(CHANNELS_LABEL)
            .map(|c| {
                c.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn default_channel(&self) -> Option<&str> {
        self.annotations
            .get(DEFAULT_CHANNEL_LABEL)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// A channel entry in a package manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageChannel {
    pub name: String,
    #[serde(rename = "currentCSV")]
    pub current_csv: String,
}

/// `package.yaml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub package_name: String,
    pub channels: Vec<PackageChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_channel: Option<String>,
}

impl PackageManifest {
    /// Interpret a parsed document as a package manifest
    pub fn from_value(value: &Value) -> Option<Result<Self, serde_json::Error>> {
        value
            .get("packageName")
            .map(|_| serde_json::from_value(value.clone()))
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml_ng::Error> {
        serde_yaml_ng::to_string(self)
    }

    /// Default channel, falling back to the only channel
    pub fn effective_default_channel(&self) -> Option<&str> {
        match (&self.default_channel, self.channels.as_slice()) {
            (Some(default), _) if !default.is_empty() => Some(default.as_str()),
            (_, [only]) => Some(only.name.as_str()),
            _ => None,
        }
    }
}
