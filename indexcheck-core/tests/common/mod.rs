//! Shared helpers for integration tests
//!
//! [`DirectoryStoreClient`] stands in for docker: a built image is a copy of
//! its build context, pushing marks it as available remotely, and extracting
//! copies a path out of the stored context. This lets the real bundle
//! builder, index adder, exporter and verifier run end to end.

#![allow(dead_code)]

use async_trait::async_trait;
use indexcheck_core::container::{ContainerClient, ContainerError, Credentials};
use indexcheck_core::image::ImageReference;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use walkdir::WalkDir;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Repository root, where the prometheus fixture manifests live
pub fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..")
}

pub fn fixture_bundle(version: &str) -> PathBuf {
    fixtures_root()
        .join("manifests")
        .join("prometheus")
        .join(version)
}

#[derive(Default)]
struct Store {
    local: HashMap<String, PathBuf>,
    remote: HashSet<String>,
    calls: Vec<String>,
    builds: usize,
}

pub struct DirectoryStoreClient {
    root: PathBuf,
    store: Mutex<Store>,
}

impl DirectoryStoreClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        fs::create_dir_all(&root).unwrap();
        Self {
            root,
            store: Mutex::new(Store::default()),
        }
    }

    /// Every call in order, e.g. `push quay.io/x:abc`
    pub fn calls(&self) -> Vec<String> {
        self.store.lock().unwrap().calls.clone()
    }

    pub fn is_pushed(&self, image: &ImageReference) -> bool {
        self.store.lock().unwrap().remote.contains(&image.to_string())
    }

    /// Stored content of a locally built image
    pub fn image_dir(&self, image: &ImageReference) -> Option<PathBuf> {
        self.store.lock().unwrap().local.get(&image.to_string()).cloned()
    }

    fn record(&self, call: String) {
        self.store.lock().unwrap().calls.push(call);
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl ContainerClient for DirectoryStoreClient {
    async fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), ContainerError> {
        self.record(format!("login {registry} {}", credentials.username));
        Ok(())
    }

    async fn build(
        &self,
        dockerfile: &Path,
        context: &Path,
        image: &ImageReference,
    ) -> Result<(), ContainerError> {
        if !dockerfile.is_file() {
            return Err(ContainerError::ImageNotFound(dockerfile.display().to_string()));
        }
        let target = {
            let mut store = self.store.lock().unwrap();
            store.builds += 1;
            self.root.join(format!("image-{}", store.builds))
        };
        copy_tree(context, &target)?;

        let mut store = self.store.lock().unwrap();
        store.local.insert(image.to_string(), target);
        store.calls.push(format!("build {image}"));
        Ok(())
    }

    async fn push(&self, image: &ImageReference) -> Result<(), ContainerError> {
        let mut store = self.store.lock().unwrap();
        store.calls.push(format!("push {image}"));
        if !store.local.contains_key(&image.to_string()) {
            return Err(ContainerError::ImageNotFound(image.to_string()));
        }
        store.remote.insert(image.to_string());
        Ok(())
    }

    async fn pull(&self, image: &ImageReference) -> Result<(), ContainerError> {
        let mut store = self.store.lock().unwrap();
        store.calls.push(format!("pull {image}"));
        if !store.remote.contains(&image.to_string()) {
            return Err(ContainerError::ImageNotFound(image.to_string()));
        }
        Ok(())
    }

    async fn extract(
        &self,
        image: &ImageReference,
        source: &str,
        dest: &Path,
    ) -> Result<(), ContainerError> {
        let dir = self
            .image_dir(image)
            .ok_or_else(|| ContainerError::ImageNotFound(image.to_string()))?;
        self.record(format!("extract {image} {source}"));

        let from = dir.join(source.trim_start_matches('/'));
        if from.is_dir() {
            copy_tree(&from, dest)?;
        } else {
            fs::copy(&from, dest)?;
        }
        Ok(())
    }
}
