use std::path::{Path, PathBuf};
use std::sync::Arc;

use bmh_core::{BusinessDescriptor, Source};
use bmh_fetchers::{
    build_fetcher_set, fixture_bundle_path, load_fixture_bundle, FetchBudget, FetchContext, FetchMode,
    SourceRegistry,
};
use bmh_storage::{HttpClient, HttpClientConfig};
use chrono::Utc;
use uuid::Uuid;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap()
}

#[test]
fn every_source_has_a_sample_bundle() {
    let root = workspace_root();
    for source in Source::ALL {
        let bundle = load_fixture_bundle(fixture_bundle_path(&root, source)).unwrap();
        assert_eq!(bundle.source, source);
        assert!(!bundle.items.is_empty(), "{source} bundle is empty");
    }
}

#[test]
fn sources_yaml_lists_all_six_sources_in_fixture_mode() {
    let registry = SourceRegistry::load(workspace_root().join("sources.yaml")).unwrap();
    for source in Source::ALL {
        let config = registry.config_for(source).unwrap();
        assert!(config.enabled);
        assert_eq!(config.mode, FetchMode::Fixture);
    }
}

#[tokio::test]
async fn workspace_fetchers_replay_fixture_items() {
    let root = workspace_root();
    let registry = SourceRegistry::load(root.join("sources.yaml")).unwrap();
    let budgets = registry.budgets(FetchBudget::default());
    let http = Arc::new(HttpClient::new(HttpClientConfig::default()).unwrap());
    let fetchers = build_fetcher_set(&registry, &root, http);

    let descriptor = BusinessDescriptor::new("Acme Plumbing")
        .with_business_url("https://www.acmeplumbing.example")
        .with_google_maps_url("https://www.google.com/maps/place/Acme+Plumbing")
        .with_trustpilot_url("https://www.trustpilot.com/review/acmeplumbing.example");

    for source in Source::ALL {
        let target = descriptor.target_for(source).unwrap();
        let ctx = FetchContext {
            job_id: Uuid::new_v4(),
            started_at: Utc::now(),
            budget: budgets.for_source(source),
        };
        let items = fetchers.get(source).fetch(&ctx, &target).await.unwrap();
        assert!(!items.is_empty());
        assert!(items.iter().all(|item| item.source == source));
    }
}
