use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bids_adapters::{FixtureHtmlClient, SamosvalProvider, StubRawItemProvider};
use bids_core::{
    Bid, BidId, BidRepository, RawItemRepository, ScopeState, SourceId, SourceRepository,
    StorageError, UnitOfWork, UnitOfWorkFactory,
};
use bids_harvest::{
    list_sources, seed_sources, HarvestCommand, HarvestError, HarvestService, SourceRegistry,
};
use bids_storage::{Database, SqliteUnitOfWorkFactory, StorageConfig};
use chrono::{DateTime, Utc};
use tempfile::{tempdir, TempDir};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

async fn seeded_database(dir: &TempDir) -> Database {
    let config = StorageConfig {
        database_url: format!("sqlite://{}", dir.path().join("bids.sqlite").display()),
        max_connections: 2,
    };
    let db = Database::connect(&config).await.expect("connect");
    db.migrate().await.expect("migrate");

    let registry = SourceRegistry::load(workspace_root().join("sources.yaml"))
        .await
        .expect("registry");
    seed_sources(&db.unit_of_work_factory(), &registry)
        .await
        .expect("seed");
    db
}

/// Raw items and bids persisted for the source with `code`.
async fn persisted_counts(db: &Database, code: &str) -> (usize, usize) {
    let uow = db.unit_of_work_factory().begin().await.expect("begin");
    let source = uow
        .sources()
        .get_by_code(code)
        .await
        .expect("lookup")
        .expect("seeded");
    let source_id = source.id.persisted().expect("id");
    let raw_items = uow
        .raw_items()
        .list_for_source_since(source_id, DateTime::<Utc>::MIN_UTC)
        .await
        .expect("raw items");
    let bids = uow
        .bids()
        .list_for_source_since(source_id, DateTime::<Utc>::MIN_UTC)
        .await
        .expect("bids");
    uow.exit(false).await.expect("exit");
    (raw_items.len(), bids.len())
}

fn samosval_service(db: &Database) -> HarvestService {
    let client = FixtureHtmlClient::from_file(
        "https://samosval.info/",
        workspace_root().join("fixtures/samosval/listing.html"),
    )
    .expect("fixture");
    HarvestService::new(
        Arc::new(db.unit_of_work_factory()),
        Arc::new(SamosvalProvider::new(client, "https://samosval.info/")),
    )
}

#[tokio::test]
async fn samosval_fixture_run_persists_raw_items_and_bids() {
    let dir = tempdir().expect("tempdir");
    let db = seeded_database(&dir).await;

    let report = samosval_service(&db)
        .harvest(&HarvestCommand::new("SAMOSVAL"))
        .await
        .expect("harvest");
    assert!(report.committed);
    assert_eq!((report.raw_items, report.bids), (2, 2));

    let uow = db.unit_of_work_factory().begin().await.expect("begin");
    let source = uow
        .sources()
        .get_by_code("SAMOSVAL")
        .await
        .expect("lookup")
        .expect("seeded");
    let source_id = source.id.persisted().expect("id");
    let raw_items = uow
        .raw_items()
        .list_for_source_since(source_id, DateTime::<Utc>::MIN_UTC)
        .await
        .expect("raw items");
    let bids = uow
        .bids()
        .list_for_source_since(source_id, DateTime::<Utc>::MIN_UTC)
        .await
        .expect("bids");
    uow.exit(false).await.expect("exit");

    assert_eq!(raw_items.len(), 2);
    assert_eq!(bids.len(), 2);
    for (raw_item, bid) in raw_items.iter().zip(&bids) {
        assert_eq!(bid.raw_item_id, raw_item.id.persisted());
        assert_eq!(bid.source_id, source_id);
        assert_eq!(bid.external_id, raw_item.external_id);
        assert_eq!(bid.description, raw_item.payload);
    }
    let titles: Vec<_> = bids.iter().map(|b| b.title.as_str()).collect();
    assert!(titles.contains(&"samosval.info: bid 123"));
    assert!(titles.contains(&"samosval.info: bid 124"));
    assert!(raw_items
        .iter()
        .any(|r| r.url.as_deref() == Some("https://samosval.info/order/124")));
}

#[tokio::test]
async fn unknown_source_leaves_database_untouched() {
    let dir = tempdir().expect("tempdir");
    let db = seeded_database(&dir).await;

    let err = samosval_service(&db)
        .execute(&HarvestCommand::new("NOPE"))
        .await
        .expect_err("missing source");

    assert!(matches!(err, HarvestError::SourceNotFound(_)));
    assert!(err.to_string().contains("NOPE"));
    assert_eq!(persisted_counts(&db, "SAMOSVAL").await, (0, 0));
    assert_eq!(persisted_counts(&db, "ATI").await, (0, 0));
}

#[tokio::test]
async fn stub_provider_runs_end_to_end() {
    let dir = tempdir().expect("tempdir");
    let db = seeded_database(&dir).await;
    let factory: Arc<dyn UnitOfWorkFactory> = Arc::new(db.unit_of_work_factory());

    let service = HarvestService::new(Arc::clone(&factory), Arc::new(StubRawItemProvider));
    let report = service
        .harvest(&HarvestCommand::new("ATI"))
        .await
        .expect("harvest");

    assert!(report.committed);
    assert_eq!((report.raw_items, report.bids), (1, 1));
    let sources = list_sources(factory.as_ref()).await.expect("sources");
    assert!(sources.iter().any(|s| s.code == "ATI"));
    assert_eq!(persisted_counts(&db, "ATI").await, (1, 1));
    assert_eq!(persisted_counts(&db, "SAMOSVAL").await, (0, 0));
}

/// Bid repository that refuses every write.
struct RejectingBids;

#[async_trait]
impl BidRepository for RejectingBids {
    async fn add(&self, _bid: Bid) -> Result<Bid, StorageError> {
        Err(StorageError::Constraint("bids table unavailable".into()))
    }

    async fn get_by_id(&self, _id: BidId) -> Result<Option<Bid>, StorageError> {
        Ok(None)
    }

    async fn list_for_source_since(
        &self,
        _source_id: SourceId,
        _since: DateTime<Utc>,
    ) -> Result<Vec<Bid>, StorageError> {
        Ok(Vec::new())
    }

    async fn find_duplicate_candidates(&self, _bid: &Bid) -> Result<Vec<Bid>, StorageError> {
        Ok(Vec::new())
    }
}

/// SQLite scope whose bid writes fail after raw items went through.
struct BidStageFailure {
    inner: Box<dyn UnitOfWork>,
    bids: RejectingBids,
}

#[async_trait]
impl UnitOfWork for BidStageFailure {
    fn sources(&self) -> &dyn SourceRepository {
        self.inner.sources()
    }

    fn raw_items(&self) -> &dyn RawItemRepository {
        self.inner.raw_items()
    }

    fn bids(&self) -> &dyn BidRepository {
        &self.bids
    }

    fn state(&self) -> ScopeState {
        self.inner.state()
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        self.inner.rollback().await
    }

    async fn exit(self: Box<Self>, failed: bool) -> Result<ScopeState, StorageError> {
        let scope = *self;
        scope.inner.exit(failed).await
    }
}

struct BidStageFailureFactory(SqliteUnitOfWorkFactory);

#[async_trait]
impl UnitOfWorkFactory for BidStageFailureFactory {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        let inner = self.0.begin().await?;
        Ok(Box::new(BidStageFailure {
            inner,
            bids: RejectingBids,
        }))
    }
}

#[tokio::test]
async fn bid_stage_failure_discards_raw_items() {
    let dir = tempdir().expect("tempdir");
    let db = seeded_database(&dir).await;
    let client = FixtureHtmlClient::from_file(
        "https://samosval.info/",
        workspace_root().join("fixtures/samosval/listing.html"),
    )
    .expect("fixture");

    let service = HarvestService::new(
        Arc::new(BidStageFailureFactory(db.unit_of_work_factory())),
        Arc::new(SamosvalProvider::new(client, "https://samosval.info/")),
    );
    let err = service
        .harvest(&HarvestCommand::new("SAMOSVAL"))
        .await
        .expect_err("bid stage fails");

    assert!(matches!(
        err,
        HarvestError::Storage(StorageError::Constraint(_))
    ));
    assert_eq!(persisted_counts(&db, "SAMOSVAL").await, (0, 0));
}
