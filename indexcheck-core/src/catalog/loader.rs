use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{Bundle, CatalogDatabase, CatalogError};
use crate::manifest::{self, ManifestDir, PackageManifest, CSV_KIND};

/// Populates a catalog from a directory of exported manifests
///
/// Any directory holding a ClusterServiceVersion is a bundle. Any document
/// with `packageName` is a package manifest. Bundles are inserted first so
/// channel graphs can be walked once everything is present.
pub struct DirectoryLoader<'a> {
    db: &'a mut CatalogDatabase,
    root: PathBuf,
}

#[derive(Debug, Default)]
struct Discovered {
    bundle_dirs: BTreeSet<PathBuf>,
    packages: Vec<(PathBuf, PackageManifest)>,
}

impl<'a> DirectoryLoader<'a> {
    pub fn new(db: &'a mut CatalogDatabase, root: impl Into<PathBuf>) -> Self {
        Self {
            db,
            root: root.into(),
        }
    }

    /// Load everything under the root; returns the number of bundles inserted
    pub fn populate(&mut self) -> Result<usize, CatalogError> {
        info!("Loading manifests from {}", self.root.display());
        let discovered = self.discover()?;

        if discovered.bundle_dirs.is_empty() {
            return Err(CatalogError::NoBundles {
                path: self.root.clone(),
            });
        }

        for dir in &discovered.bundle_dirs {
            let manifests = ManifestDir::load(dir)?;
            self.db.add_bundle(&Bundle::from_manifest_dir(&manifests))?;
        }

        for (path, package) in &discovered.packages {
            debug!(
                "Adding package {} from {}",
                package.package_name,
                path.display()
            );
            self.db.add_package_channels(package)?;
        }

        info!(
            "Loaded {} bundle(s) and {} package(s)",
            discovered.bundle_dirs.len(),
            discovered.packages.len()
        );
        Ok(discovered.bundle_dirs.len())
    }

    fn discover(&self) -> Result<Discovered, CatalogError> {
        let mut found = Discovered::default();

        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| CatalogError::Walk {
                path: e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.root.clone()),
                message: e.to_string(),
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() || !manifest::is_manifest_file(path) {
                continue;
            }

            for document in manifest::read_documents(path)? {
                if manifest::object_kind(&document) == Some(CSV_KIND) {
                    if let Some(parent) = path.parent() {
                        found.bundle_dirs.insert(parent.to_path_buf());
                    }
                    continue;
                }
                if let Some(parsed) = PackageManifest::from_value(&document) {
                    let package = parsed.map_err(|e| CatalogError::PackageManifest {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })?;
                    found.packages.push((path.to_path_buf(), package));
                }
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn csv(name: &str, version: &str, replaces: Option<&str>) -> String {
        let mut out = format!(
            "apiVersion: operators.coreos.com/v1alpha1\nkind: ClusterServiceVersion\nmetadata:\n  name: {name}\nspec:\n  version: {version}\n"
        );
        if let Some(r) = replaces {
            out.push_str(&format!("  replaces: {r}\n"));
        }
        out
    }

    fn write_bundle(root: &Path, version: &str, name: &str, replaces: Option<&str>) {
        let dir = root.join(version);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(format!("{name}.clusterserviceversion.yaml")),
            csv(name, version, replaces),
        )
        .unwrap();
        fs::write(
            dir.join("widgets.example.com.customresourcedefinition.yaml"),
            "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.com\n",
        )
        .unwrap();
    }

    fn migrated() -> CatalogDatabase {
        let mut db = CatalogDatabase::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    #[test]
    fn test_populate_exported_layout() {
        let root = TempDir::new().unwrap();
        write_bundle(root.path(), "1.0.0", "widget.v1.0.0", None);
        write_bundle(root.path(), "1.1.0", "widget.v1.1.0", Some("widget.v1.0.0"));
        fs::write(
            root.path().join("package.yaml"),
            "packageName: widget\ndefaultChannel: stable\nchannels:\n  - name: stable\n    currentCSV: widget.v1.1.0\n",
        )
        .unwrap();

        let mut db = migrated();
        let loaded = DirectoryLoader::new(&mut db, root.path()).populate().unwrap();
        assert_eq!(loaded, 2);

        assert_eq!(
            db.channel_bundle_names("widget", "stable").unwrap(),
            vec!["widget.v1.1.0", "widget.v1.0.0"]
        );
        let bundle = db.get_bundle("widget.v1.0.0").unwrap().unwrap();
        assert_eq!(bundle.objects.len(), 2);
    }

    #[test]
    fn test_empty_directory_has_no_bundles() {
        let root = TempDir::new().unwrap();
        let mut db = migrated();
        let err = DirectoryLoader::new(&mut db, root.path())
            .populate()
            .unwrap_err();
        assert!(matches!(err, CatalogError::NoBundles { .. }));
    }

    #[test]
    fn test_head_not_loaded() {
        let root = TempDir::new().unwrap();
        write_bundle(root.path(), "1.0.0", "widget.v1.0.0", None);
        fs::write(
            root.path().join("package.yaml"),
            "packageName: widget\nchannels:\n  - name: stable\n    currentCSV: widget.v9.9.9\n",
        )
        .unwrap();

        let mut db = migrated();
        let err = DirectoryLoader::new(&mut db, root.path())
            .populate()
            .unwrap_err();
        assert!(matches!(err, CatalogError::MissingHead { .. }));
    }

    #[test]
    fn test_dangling_replaces() {
        let root = TempDir::new().unwrap();
        write_bundle(root.path(), "1.1.0", "widget.v1.1.0", Some("widget.v1.0.0"));
        fs::write(
            root.path().join("package.yaml"),
            "packageName: widget\nchannels:\n  - name: stable\n    currentCSV: widget.v1.1.0\n",
        )
        .unwrap();

        let mut db = migrated();
        let err = DirectoryLoader::new(&mut db, root.path())
            .populate()
            .unwrap_err();
        assert!(matches!(err, CatalogError::MissingReplaces { .. }));
    }

    #[test]
    fn test_malformed_package_manifest() {
        let root = TempDir::new().unwrap();
        write_bundle(root.path(), "1.0.0", "widget.v1.0.0", None);
        fs::write(
            root.path().join("package.yaml"),
            "packageName: widget\nchannels: not-a-list\n",
        )
        .unwrap();

        let mut db = migrated();
        let err = DirectoryLoader::new(&mut db, root.path())
            .populate()
            .unwrap_err();
        assert!(matches!(err, CatalogError::PackageManifest { .. }));
    }

    #[test]
    fn test_unparsable_yaml() {
        let root = TempDir::new().unwrap();
        write_bundle(root.path(), "1.0.0", "widget.v1.0.0", None);
        fs::write(root.path().join("broken.yaml"), "key: [unterminated\n").unwrap();

        let mut db = migrated();
        let err = DirectoryLoader::new(&mut db, root.path())
            .populate()
            .unwrap_err();
        assert!(matches!(err, CatalogError::Manifest(_)));
    }
}
