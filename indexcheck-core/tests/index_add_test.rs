//! Index adder modes the pipeline itself does not use

mod common;

use common::{fixture_bundle, init_test_logging, DirectoryStoreClient};
use indexcheck_core::bundle::{BundleBuildRequest, BundleBuilder, ImageBundleBuilder};
use indexcheck_core::catalog::CatalogDatabase;
use indexcheck_core::container::ContainerClient;
use indexcheck_core::image::ImageReference;
use indexcheck_core::index::{
    ImageIndexAdder, IndexAdder, IndexBuildRequest, IndexError, INDEX_DOCKERFILE,
};
use std::sync::Arc;
use tempfile::TempDir;

const BUNDLE_REPO: &str = "quay.io/olmtest/e2e-bundle";

async fn publish_bundle(client: &Arc<DirectoryStoreClient>, version: &str) -> ImageReference {
    let image = ImageReference::new(BUNDLE_REPO, version.replace('.', "-"));
    let builder = ImageBundleBuilder::new(client.clone());
    builder
        .build(&BundleBuildRequest {
            path: fixture_bundle(version),
            image: image.clone(),
            package_name: "prometheus".to_string(),
            channels: vec!["preview".to_string()],
            default_channel: Some("preview".to_string()),
            generate_only: false,
        })
        .await
        .unwrap();
    client.push(&image).await.unwrap();
    image
}

fn heads(db: &CatalogDatabase) -> Vec<String> {
    db.channel_bundle_names("prometheus", "preview").unwrap()
}

#[tokio::test]
async fn test_generate_writes_dockerfile_and_database() {
    init_test_logging();
    let work = TempDir::new().unwrap();
    let client = Arc::new(DirectoryStoreClient::new(work.path().join("store")));
    let bundles = vec![
        publish_bundle(&client, "0.14.0").await,
        publish_bundle(&client, "0.15.0").await,
    ];

    let out = work.path().join("out").join(INDEX_DOCKERFILE);
    let mut request = IndexBuildRequest::new(
        ImageReference::new("quay.io/olmtest/e2e-index", "gen"),
        bundles,
    );
    request.generate = true;
    request.out_dockerfile = Some(out.clone());

    ImageIndexAdder::new(client.clone())
        .add_to_index(&request)
        .await
        .unwrap();

    let dockerfile = std::fs::read_to_string(&out).unwrap();
    assert!(dockerfile.contains("ADD database /database"));
    assert!(!client.calls().iter().any(|c| c.contains("e2e-index")));

    let db = CatalogDatabase::open(&work.path().join("out").join("database").join("index.db"))
        .unwrap();
    assert_eq!(
        heads(&db),
        vec!["prometheusoperator.0.15.0", "prometheusoperator.0.14.0"]
    );
}

#[tokio::test]
async fn test_add_to_existing_index() {
    init_test_logging();
    let work = TempDir::new().unwrap();
    let client = Arc::new(DirectoryStoreClient::new(work.path().join("store")));
    let adder = ImageIndexAdder::new(client.clone());

    let first = ImageReference::new("quay.io/olmtest/e2e-index", "one");
    let bundles = vec![
        publish_bundle(&client, "0.14.0").await,
        publish_bundle(&client, "0.15.0").await,
    ];
    adder
        .add_to_index(&IndexBuildRequest::new(first.clone(), bundles))
        .await
        .unwrap();
    client.push(&first).await.unwrap();

    let second = ImageReference::new("quay.io/olmtest/e2e-index", "two");
    let mut request = IndexBuildRequest::new(
        second.clone(),
        vec![publish_bundle(&client, "0.22.2").await],
    );
    request.from_index = Some(first);
    adder.add_to_index(&request).await.unwrap();

    let db_path = client
        .image_dir(&second)
        .unwrap()
        .join("database")
        .join("index.db");
    let db = CatalogDatabase::open(&db_path).unwrap();
    assert_eq!(
        heads(&db),
        vec![
            "prometheusoperator.0.22.2",
            "prometheusoperator.0.15.0",
            "prometheusoperator.0.14.0"
        ]
    );
    let package = db.get_package("prometheus").unwrap().unwrap();
    assert_eq!(package.default_channel.as_deref(), Some("preview"));
}

#[tokio::test]
async fn test_unpushed_bundle_is_invalid_unless_permissive() {
    init_test_logging();
    let work = TempDir::new().unwrap();
    let client = Arc::new(DirectoryStoreClient::new(work.path().join("store")));
    let good = publish_bundle(&client, "0.14.0").await;
    let missing = ImageReference::new(BUNDLE_REPO, "never-built");
    let adder = ImageIndexAdder::new(client.clone());

    let strict = IndexBuildRequest::new(
        ImageReference::new("quay.io/olmtest/e2e-index", "strict"),
        vec![good.clone(), missing.clone()],
    );
    let err = adder.add_to_index(&strict).await.unwrap_err();
    assert!(matches!(err, IndexError::InvalidBundle { ref image, .. } if image.ends_with("never-built")));

    let mut lenient = IndexBuildRequest::new(
        ImageReference::new("quay.io/olmtest/e2e-index", "lenient"),
        vec![good, missing],
    );
    lenient.permissive = true;
    adder.add_to_index(&lenient).await.unwrap();

    let db_path = client
        .image_dir(&lenient.tag)
        .unwrap()
        .join("database")
        .join("index.db");
    let db = CatalogDatabase::open(&db_path).unwrap();
    assert_eq!(heads(&db), vec!["prometheusoperator.0.14.0"]);
}
