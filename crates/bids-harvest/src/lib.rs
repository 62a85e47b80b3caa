//! Harvesting runs: fetch raw items for one source, persist them, derive bids
//! and commit everything in a single unit of work.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bids_adapters::ProviderConfig;
use bids_core::{
    Bid, ProviderError, RawItem, RawItemProvider, ScopeState, Source, StorageError, UnitOfWork,
    UnitOfWorkFactory,
};
use bids_storage::{StorageConfig, DEFAULT_DATABASE_URL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bids-harvest";

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("source with code '{0}' not found")]
    SourceNotFound(String),
    #[error("provider failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub storage: StorageConfig,
    pub provider: ProviderConfig,
    pub workspace_root: PathBuf,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let provider_defaults = ProviderConfig::default();
        Self {
            storage: StorageConfig {
                database_url: lookup("DATABASE_URL")
                    .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: lookup("BIDS_DB_MAX_CONNECTIONS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(StorageConfig::default().max_connections),
            },
            provider: ProviderConfig {
                user_agent: lookup("BIDS_USER_AGENT"),
                http_timeout_secs: lookup("BIDS_HTTP_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(provider_defaults.http_timeout_secs),
                samosval_listings_url: lookup("SAMOSVAL_LISTINGS_URL")
                    .unwrap_or(provider_defaults.samosval_listings_url),
                fixture_dir: lookup("BIDS_FIXTURE_DIR").map(PathBuf::from),
            },
            workspace_root: lookup("BIDS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn sources_file(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub code: String,
    pub name: String,
    pub kind: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub description: String,
}

fn default_active() -> bool {
    true
}

impl SourceRegistry {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub created: usize,
    pub updated: usize,
}

/// Exits the scope with the outcome of the work done inside it. A failure
/// inside the scope wins over a failure to roll back.
async fn finish_scope<T>(
    uow: Box<dyn UnitOfWork>,
    outcome: Result<T, HarvestError>,
) -> Result<(T, ScopeState), HarvestError> {
    match outcome {
        Ok(value) => {
            let state = uow.exit(false).await?;
            Ok((value, state))
        }
        Err(err) => {
            if let Err(exit_err) = uow.exit(true).await {
                warn!(error = %exit_err, "rollback after failure did not complete");
            }
            Err(err)
        }
    }
}

/// Inserts registry sources that are missing and updates the others, matched
/// by code, in one committed scope.
pub async fn seed_sources(
    factory: &dyn UnitOfWorkFactory,
    registry: &SourceRegistry,
) -> Result<SeedReport, HarvestError> {
    let mut uow = factory.begin().await?;
    let outcome = upsert_sources(uow.as_mut(), registry).await;
    let (report, _) = finish_scope(uow, outcome).await?;
    info!(created = report.created, updated = report.updated, "sources seeded");
    Ok(report)
}

async fn upsert_sources(
    uow: &mut dyn UnitOfWork,
    registry: &SourceRegistry,
) -> Result<SeedReport, HarvestError> {
    let mut report = SeedReport::default();
    for entry in &registry.sources {
        let existing = uow.sources().get_by_code(&entry.code).await?;
        let mut source = match existing {
            Some(source) => {
                report.updated += 1;
                source
            }
            None => {
                report.created += 1;
                Source::new(&entry.code, &entry.name, &entry.kind)
            }
        };
        source.name = entry.name.clone();
        source.kind = entry.kind.clone();
        source.is_active = entry.is_active;
        source.description = entry.description.clone();
        uow.sources().save(source).await?;
    }
    uow.commit().await?;
    Ok(report)
}

pub async fn list_sources(factory: &dyn UnitOfWorkFactory) -> Result<Vec<Source>, HarvestError> {
    let uow = factory.begin().await?;
    let outcome = uow.sources().list_all().await.map_err(HarvestError::from);
    let (sources, _) = finish_scope(uow, outcome).await?;
    Ok(sources)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestCommand {
    pub source_code: String,
}

impl HarvestCommand {
    pub fn new(source_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub run_id: Uuid,
    pub source_code: String,
    pub raw_items: usize,
    pub bids: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub committed: bool,
}

/// One bid per persisted raw item, carrying its source, link and external id.
pub fn derive_bid(source: &Source, raw_item: &RawItem) -> Result<Bid, StorageError> {
    let raw_item_id = raw_item
        .id
        .persisted()
        .ok_or(StorageError::MissingIdentity { entity: "raw item" })?;
    let source_id = raw_item.source_id.ok_or(StorageError::MissingField {
        entity: "raw item",
        field: "source_id",
    })?;

    let label = if source.name.is_empty() {
        &source.code
    } else {
        &source.name
    };
    let reference = raw_item
        .external_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .map_or_else(|| raw_item_id.to_string(), str::to_string);

    let mut bid = Bid::new(source_id, format!("{label}: bid {reference}"));
    bid.raw_item_id = Some(raw_item_id);
    bid.external_id = raw_item.external_id.clone();
    bid.description = raw_item.payload.clone();
    bid.url = raw_item.url.clone();
    Ok(bid)
}

#[derive(Clone)]
pub struct HarvestService {
    uow_factory: Arc<dyn UnitOfWorkFactory>,
    provider: Arc<dyn RawItemProvider>,
}

impl HarvestService {
    pub fn new(uow_factory: Arc<dyn UnitOfWorkFactory>, provider: Arc<dyn RawItemProvider>) -> Self {
        Self {
            uow_factory,
            provider,
        }
    }

    pub async fn execute(&self, command: &HarvestCommand) -> Result<(), HarvestError> {
        self.harvest(command).await.map(|_| ())
    }

    /// Runs one harvest. Nothing is persisted unless every step succeeds.
    pub async fn harvest(&self, command: &HarvestCommand) -> Result<HarvestReport, HarvestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("harvest_run", %run_id, source_code = %command.source_code);
        self.run(run_id, command).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, command: &HarvestCommand) -> Result<HarvestReport, HarvestError> {
        let started_at = Utc::now();
        let mut uow = self.uow_factory.begin().await?;
        let outcome = self.harvest_in_scope(uow.as_mut(), command).await;
        let ((raw_items, bids), state) = finish_scope(uow, outcome).await?;

        let report = HarvestReport {
            run_id,
            source_code: command.source_code.clone(),
            raw_items,
            bids,
            started_at,
            finished_at: Utc::now(),
            committed: state == ScopeState::Committed,
        };
        info!(
            raw_items = report.raw_items,
            bids = report.bids,
            committed = report.committed,
            "harvest run finished"
        );
        Ok(report)
    }

    async fn harvest_in_scope(
        &self,
        uow: &mut dyn UnitOfWork,
        command: &HarvestCommand,
    ) -> Result<(usize, usize), HarvestError> {
        let source = uow
            .sources()
            .get_by_code(&command.source_code)
            .await?
            .ok_or_else(|| HarvestError::SourceNotFound(command.source_code.clone()))?;
        let source_id = source
            .id
            .persisted()
            .ok_or(StorageError::MissingIdentity { entity: "source" })?;

        let mut raw_items = self.provider.fetch_raw_items(&source).await?;
        info!(count = raw_items.len(), "fetched raw items");
        if raw_items.is_empty() {
            return Ok((0, 0));
        }
        for item in raw_items.iter_mut().filter(|item| item.source_id.is_none()) {
            item.source_id = Some(source_id);
        }

        let raw_items = uow.raw_items().add_many(raw_items).await?;
        let bids = raw_items
            .iter()
            .map(|raw_item| derive_bid(&source, raw_item))
            .collect::<Result<Vec<_>, _>>()?;
        let bids = uow.bids().add_many(bids).await?;

        uow.commit().await?;
        Ok((raw_items.len(), bids.len()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bids_core::memory::InMemoryStore;
    use bids_core::{Identity, RawItemId, SourceId};
    use proptest::prelude::*;

    use super::*;

    struct FixedProvider {
        items: Mutex<Vec<RawItem>>,
    }

    impl FixedProvider {
        fn new(items: Vec<RawItem>) -> Arc<Self> {
            Arc::new(Self {
                items: Mutex::new(items),
            })
        }
    }

    #[async_trait]
    impl RawItemProvider for FixedProvider {
        async fn fetch_raw_items(&self, _source: &Source) -> Result<Vec<RawItem>, ProviderError> {
            Ok(self.items.lock().unwrap().clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl RawItemProvider for FailingProvider {
        async fn fetch_raw_items(&self, _source: &Source) -> Result<Vec<RawItem>, ProviderError> {
            Err(ProviderError::Message("listing page unavailable".into()))
        }
    }

    fn bids_per_raw_item(bids: &[Bid]) -> HashMap<i64, usize> {
        let mut counts = HashMap::new();
        for bid in bids {
            if let Some(id) = bid.raw_item_id {
                *counts.entry(id.0).or_insert(0) += 1;
            }
        }
        counts
    }

    fn store() -> InMemoryStore {
        InMemoryStore::with_sources([Source::new("ATI", "ATI.su", "html")]).unwrap()
    }

    fn item(external_id: Option<&str>) -> RawItem {
        let mut item = RawItem::new(format!("payload {external_id:?}"));
        item.external_id = external_id.map(str::to_string);
        item.url = Some("https://ati.su/".into());
        item
    }

    fn service(store: &InMemoryStore, provider: Arc<dyn RawItemProvider>) -> HarvestService {
        HarvestService::new(Arc::new(store.clone()), provider)
    }

    #[tokio::test]
    async fn persists_raw_items_and_one_bid_each() {
        let store = store();
        let provider = FixedProvider::new(vec![item(Some("a-1")), item(None)]);

        let report = service(&store, provider)
            .harvest(&HarvestCommand::new("ATI"))
            .await
            .unwrap();

        assert!(report.committed);
        assert_eq!((report.raw_items, report.bids), (2, 2));
        let raw_items = store.raw_items();
        let bids = store.bids();
        assert!(raw_items.iter().all(|r| r.source_id == Some(SourceId(1))));
        assert!(bids.iter().all(|b| b.source_id == SourceId(1)));
        assert!(bids_per_raw_item(&bids).values().all(|&n| n == 1));

        assert_eq!(bids[0].title, "ATI.su: bid a-1");
        assert_eq!(bids[0].raw_item_id, raw_items[0].id.persisted());
        assert_eq!(bids[0].description, raw_items[0].payload);
        assert_eq!(bids[0].url.as_deref(), Some("https://ati.su/"));
        let second_raw = raw_items[1].id.persisted().unwrap();
        assert_eq!(bids[1].title, format!("ATI.su: bid {second_raw}"));
        assert_eq!(bids[1].external_id, None);
    }

    #[tokio::test]
    async fn unknown_source_fails_without_writes() {
        let store = store();
        let provider = FixedProvider::new(vec![item(Some("a-1"))]);

        let err = service(&store, provider)
            .execute(&HarvestCommand::new("UNKNOWN"))
            .await
            .unwrap_err();

        assert!(matches!(err, HarvestError::SourceNotFound(ref code) if code == "UNKNOWN"));
        assert!(err.to_string().contains("UNKNOWN"));
        assert!(store.raw_items().is_empty());
        assert!(store.bids().is_empty());
    }

    #[tokio::test]
    async fn empty_provider_result_succeeds_without_writes() {
        let store = store();
        let report = service(&store, FixedProvider::new(vec![]))
            .harvest(&HarvestCommand::new("ATI"))
            .await
            .unwrap();

        assert!(!report.committed);
        assert_eq!((report.raw_items, report.bids), (0, 0));
        assert!(store.raw_items().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_propagates_and_persists_nothing() {
        let store = store();
        let err = service(&store, Arc::new(FailingProvider))
            .execute(&HarvestCommand::new("ATI"))
            .await
            .unwrap_err();

        assert!(matches!(err, HarvestError::Provider(_)));
        assert!(store.raw_items().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_mid_run_aborts_everything() {
        let store = store();
        let mut orphan = item(Some("orphan"));
        orphan.source_id = Some(SourceId(404));
        let provider = FixedProvider::new(vec![item(Some("ok")), orphan]);

        let err = service(&store, provider)
            .execute(&HarvestCommand::new("ATI"))
            .await
            .unwrap_err();

        assert!(matches!(err, HarvestError::Storage(StorageError::Constraint(_))));
        assert!(store.raw_items().is_empty());
        assert!(store.bids().is_empty());
    }

    #[test]
    fn derive_bid_falls_back_to_code_and_requires_identity() {
        let source = Source::new("SAMOSVAL", "", "html");
        let mut raw_item = item(Some("123"));
        raw_item.source_id = Some(SourceId(2));

        let err = derive_bid(&source, &raw_item).unwrap_err();
        assert!(matches!(err, StorageError::MissingIdentity { .. }));

        raw_item.id = Identity::Persisted(RawItemId(0));
        let bid = derive_bid(&source, &raw_item).unwrap();
        assert_eq!(bid.title, "SAMOSVAL: bid 123");
        assert_eq!(bid.raw_item_id, Some(RawItemId(0)));
        assert_eq!(bid.source_id, SourceId(2));
        assert!(bid.id.is_pending());
    }

    #[test]
    fn derive_bid_treats_empty_external_id_as_missing() {
        let source = Source::new("ATI", "ATI.su", "html");
        let mut raw_item = item(Some(""));
        raw_item.source_id = Some(SourceId(1));
        raw_item.id = Identity::Persisted(RawItemId(5));

        let bid = derive_bid(&source, &raw_item).unwrap();
        assert_eq!(bid.title, "ATI.su: bid 5");
        assert_eq!(bid.external_id.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn seeding_upserts_by_code() {
        let store = InMemoryStore::new();
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - code: ATI
    name: ATI.su
    kind: html
  - code: SAMOSVAL
    name: samosval.info
    kind: html
    is_active: false
"#,
        )
        .unwrap();

        let first = seed_sources(&store, &registry).await.unwrap();
        assert_eq!(first, SeedReport { created: 2, updated: 0 });

        let mut renamed = registry.clone();
        renamed.sources[0].name = "ATI".into();
        let second = seed_sources(&store, &renamed).await.unwrap();
        assert_eq!(second, SeedReport { created: 0, updated: 2 });

        let sources = list_sources(&store).await.unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name, "ATI");
        assert!(!sources[1].is_active);
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = HarvestConfig::from_lookup(|_| None);
        assert_eq!(config.storage.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.provider, ProviderConfig::default());
        assert_eq!(config.sources_file(), PathBuf::from("./sources.yaml"));

        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "sqlite://other.sqlite"),
            ("BIDS_DB_MAX_CONNECTIONS", "2"),
            ("BIDS_HTTP_TIMEOUT_SECS", "not-a-number"),
            ("BIDS_FIXTURE_DIR", "fixtures"),
        ]);
        let config = HarvestConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.storage.database_url, "sqlite://other.sqlite");
        assert_eq!(config.storage.max_connections, 2);
        assert_eq!(config.provider.http_timeout_secs, 10);
        assert_eq!(config.provider.fixture_dir, Some(PathBuf::from("fixtures")));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn n_raw_items_yield_n_bids(external_ids in proptest::collection::vec(proptest::option::of("[a-z0-9]{1,8}"), 0..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let n = external_ids.len();
            let store = store();
            let items = external_ids.iter().map(|id| item(id.as_deref())).collect();

            let report = runtime
                .block_on(service(&store, FixedProvider::new(items)).harvest(&HarvestCommand::new("ATI")))
                .unwrap();

            prop_assert_eq!(report.raw_items, n);
            prop_assert_eq!(report.bids, n);
            prop_assert_eq!(store.raw_items().len(), n);
            prop_assert_eq!(store.bids().len(), n);
            prop_assert_eq!(report.committed, n > 0);
            let counts = bids_per_raw_item(&store.bids());
            prop_assert!(counts.values().all(|&c| c == 1));
            prop_assert_eq!(counts.len(), n);
        }
    }
}
