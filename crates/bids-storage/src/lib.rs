//! SQLite persistence for the bid harvester: connection setup, embedded schema,
//! row mapping and the transactional unit of work.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bids_core::ports::{BidRepository, RawItemRepository, SourceRepository};
use bids_core::{
    Bid, BidId, ExitAction, ExitPolicy, Identity, RawItem, RawItemId, ScopeState, Source,
    SourceId, StorageError, UnitOfWork, UnitOfWorkFactory,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqliteConnection, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "bids-storage";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://bids.sqlite";

/// Weight is kept as thousandths of a ton.
const WEIGHT_SCALE: f64 = 1000.0;
/// Price is kept in minor currency units.
const PRICE_SCALE: f64 = 100.0;
const WEIGHT_UNIT_TONS: &str = "t";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(config: &StorageConfig) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .with_context(|| format!("parsing database url {}", config.database_url))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        debug!(database_url = %config.database_url, "database pool ready");
        Ok(Self { pool })
    }

    /// Applies the embedded schema migrations; already-applied ones are skipped.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying schema migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn unit_of_work_factory(&self) -> SqliteUnitOfWorkFactory {
        SqliteUnitOfWorkFactory::new(self.pool.clone())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// NaN and infinities are not measurements and map to NULL.
fn to_fixed(value: Option<f64>, scale: f64) -> Option<i64> {
    value
        .map(|v| (v * scale).round())
        .filter(|v| v.is_finite())
        .map(|v| v as i64)
}

fn from_fixed(value: Option<i64>, scale: f64) -> Option<f64> {
    value.map(|v| v as f64 / scale)
}

fn storage_error(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        if matches!(
            db.kind(),
            ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation
        ) {
            return StorageError::Constraint(db.message().to_string());
        }
    }
    StorageError::backend(err)
}

#[derive(Debug, Clone, FromRow)]
pub struct SourceRow {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub kind: String,
    pub is_active: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceRow {
    pub fn into_source(self) -> Source {
        Source {
            id: Identity::Persisted(SourceId(self.id)),
            code: self.code,
            name: self.name,
            kind: self.kind,
            is_active: self.is_active,
            description: self.description,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RawItemRow {
    pub id: i64,
    pub source_id: i64,
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub payload: String,
    pub status: String,
    pub error_message: Option<String>,
    pub hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RawItemRow {
    pub fn into_raw_item(self) -> RawItem {
        RawItem {
            id: Identity::Persisted(RawItemId(self.id)),
            source_id: Some(SourceId(self.source_id)),
            external_id: self.external_id,
            payload: self.payload,
            url: self.url,
            created_at: self.created_at,
            received_at: self.fetched_at,
        }
    }
}

/// Stored shape of a bid. Columns without an entity counterpart
/// (regions, contact name/email, dedup markers) stay at their defaults.
#[derive(Debug, Clone, FromRow)]
pub struct BidRow {
    pub id: i64,
    pub source_id: i64,
    pub raw_item_id: Option<i64>,
    pub external_id: Option<String>,
    pub title: String,
    pub description: String,
    pub cargo_type: Option<String>,
    pub transport_type: Option<String>,
    pub weight_value: Option<i64>,
    pub weight_unit: Option<String>,
    pub price_value: Option<i64>,
    pub price_currency: Option<String>,
    pub load_location: Option<String>,
    pub unload_location: Option<String>,
    pub load_region: Option<String>,
    pub unload_region: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub url: Option<String>,
    pub dedup_key: Option<String>,
    pub is_duplicate: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BidRow {
    pub fn into_bid(self) -> Bid {
        Bid {
            id: Identity::Persisted(BidId(self.id)),
            source_id: SourceId(self.source_id),
            raw_item_id: self.raw_item_id.map(RawItemId),
            external_id: self.external_id,
            title: self.title,
            description: self.description,
            cargo_type: self.cargo_type,
            transport_type: self.transport_type,
            load_point: self.load_location,
            unload_point: self.unload_location,
            weight_tons: from_fixed(self.weight_value, WEIGHT_SCALE),
            price: from_fixed(self.price_value, PRICE_SCALE),
            currency: self.price_currency,
            contact: self.contact_phone,
            url: self.url,
            published_at: self.published_at,
            created_at: self.created_at,
        }
    }
}

type Session = Arc<Mutex<Option<Transaction<'static, Sqlite>>>>;

fn active<'a>(
    slot: &'a mut Option<Transaction<'static, Sqlite>>,
) -> Result<&'a mut SqliteConnection, StorageError> {
    slot.as_deref_mut().ok_or(StorageError::ScopeClosed)
}

#[derive(Debug, Clone)]
pub struct SqliteUnitOfWorkFactory {
    pool: SqlitePool,
}

impl SqliteUnitOfWorkFactory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UnitOfWorkFactory for SqliteUnitOfWorkFactory {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        let tx = self.pool.begin().await.map_err(storage_error)?;
        debug!("sqlite scope acquired");
        Ok(Box::new(SqliteUnitOfWork::new(tx)))
    }
}

/// One SQLite transaction shared by the three repositories of a scope.
pub struct SqliteUnitOfWork {
    session: Session,
    sources: SqliteSourceRepository,
    raw_items: SqliteRawItemRepository,
    bids: SqliteBidRepository,
    state: ScopeState,
}

impl SqliteUnitOfWork {
    pub fn new(tx: Transaction<'static, Sqlite>) -> Self {
        let session: Session = Arc::new(Mutex::new(Some(tx)));
        Self {
            sources: SqliteSourceRepository {
                session: Arc::clone(&session),
            },
            raw_items: SqliteRawItemRepository {
                session: Arc::clone(&session),
            },
            bids: SqliteBidRepository {
                session: Arc::clone(&session),
            },
            session,
            state: ScopeState::Active,
        }
    }
}

impl Drop for SqliteUnitOfWork {
    fn drop(&mut self) {
        if self.state == ScopeState::Active {
            warn!("unit of work dropped without exit; transaction rolled back");
        }
    }
}

#[async_trait]
impl UnitOfWork for SqliteUnitOfWork {
    fn sources(&self) -> &dyn SourceRepository {
        &self.sources
    }

    fn raw_items(&self) -> &dyn RawItemRepository {
        &self.raw_items
    }

    fn bids(&self) -> &dyn BidRepository {
        &self.bids
    }

    fn state(&self) -> ScopeState {
        self.state
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let tx = self
            .session
            .lock()
            .await
            .take()
            .ok_or(StorageError::ScopeClosed)?;
        self.state = ScopeState::Aborted;
        tx.commit().await.map_err(storage_error)?;
        self.state = ScopeState::Committed;
        info!("unit of work committed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        let tx = self.session.lock().await.take();
        if let Some(tx) = tx {
            self.state = ScopeState::Aborted;
            tx.rollback().await.map_err(storage_error)?;
            info!("unit of work rolled back");
        }
        Ok(())
    }

    async fn exit(self: Box<Self>, failed: bool) -> Result<ScopeState, StorageError> {
        let mut scope = self;
        if ExitPolicy::decide(failed, scope.state) == ExitAction::Rollback {
            scope.rollback().await?;
        }
        Ok(scope.state)
    }
}

pub struct SqliteSourceRepository {
    session: Session,
}

#[async_trait]
impl SourceRepository for SqliteSourceRepository {
    async fn get_by_id(&self, id: SourceId) -> Result<Option<Source>, StorageError> {
        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        let row = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage_error)?;
        Ok(row.map(SourceRow::into_source))
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<Source>, StorageError> {
        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        let row = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources WHERE code = ?")
            .bind(code)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage_error)?;
        Ok(row.map(SourceRow::into_source))
    }

    async fn list_all(&self) -> Result<Vec<Source>, StorageError> {
        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        let rows = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources ORDER BY id")
            .fetch_all(&mut *conn)
            .await
            .map_err(storage_error)?;
        Ok(rows.into_iter().map(SourceRow::into_source).collect())
    }

    async fn list_active(&self) -> Result<Vec<Source>, StorageError> {
        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        let rows =
            sqlx::query_as::<_, SourceRow>("SELECT * FROM sources WHERE is_active = 1 ORDER BY id")
                .fetch_all(&mut *conn)
                .await
                .map_err(storage_error)?;
        Ok(rows.into_iter().map(SourceRow::into_source).collect())
    }

    async fn save(&self, source: Source) -> Result<Source, StorageError> {
        let now = Utc::now();
        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        match source.id {
            Identity::Pending => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO sources (code, name, kind, is_active, description, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&source.code)
                .bind(&source.name)
                .bind(&source.kind)
                .bind(source.is_active)
                .bind(&source.description)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await
                .map_err(storage_error)?;
                Ok(Source {
                    id: Identity::Persisted(SourceId(result.last_insert_rowid())),
                    ..source
                })
            }
            Identity::Persisted(id) => {
                sqlx::query(
                    r#"
                    INSERT INTO sources (id, code, name, kind, is_active, description, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        code = excluded.code,
                        name = excluded.name,
                        kind = excluded.kind,
                        is_active = excluded.is_active,
                        description = excluded.description,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(id.0)
                .bind(&source.code)
                .bind(&source.name)
                .bind(&source.kind)
                .bind(source.is_active)
                .bind(&source.description)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await
                .map_err(storage_error)?;
                Ok(source)
            }
        }
    }
}

pub struct SqliteRawItemRepository {
    session: Session,
}

#[async_trait]
impl RawItemRepository for SqliteRawItemRepository {
    async fn add(&self, raw_item: RawItem) -> Result<RawItem, StorageError> {
        if !raw_item.id.is_pending() {
            return Err(StorageError::AlreadyPersisted { entity: "raw item" });
        }
        let source_id = raw_item.source_id.ok_or(StorageError::MissingField {
            entity: "raw item",
            field: "source_id",
        })?;
        let hash = sha256_hex(raw_item.payload.as_bytes());

        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        let result = sqlx::query(
            r#"
            INSERT INTO raw_items (source_id, external_id, url, fetched_at, payload, hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(source_id.0)
        .bind(&raw_item.external_id)
        .bind(&raw_item.url)
        .bind(raw_item.received_at)
        .bind(&raw_item.payload)
        .bind(&hash)
        .bind(raw_item.created_at)
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;

        Ok(RawItem {
            id: Identity::Persisted(RawItemId(result.last_insert_rowid())),
            ..raw_item
        })
    }

    async fn get_by_id(&self, id: RawItemId) -> Result<Option<RawItem>, StorageError> {
        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        let row = sqlx::query_as::<_, RawItemRow>("SELECT * FROM raw_items WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage_error)?;
        Ok(row.map(RawItemRow::into_raw_item))
    }

    async fn list_for_source_since(
        &self,
        source_id: SourceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawItem>, StorageError> {
        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        let rows = sqlx::query_as::<_, RawItemRow>(
            r#"
            SELECT * FROM raw_items
             WHERE source_id = ? AND created_at >= ?
             ORDER BY created_at, id
            "#,
        )
        .bind(source_id.0)
        .bind(since)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_error)?;
        Ok(rows.into_iter().map(RawItemRow::into_raw_item).collect())
    }
}

pub struct SqliteBidRepository {
    session: Session,
}

#[async_trait]
impl BidRepository for SqliteBidRepository {
    async fn add(&self, bid: Bid) -> Result<Bid, StorageError> {
        if !bid.id.is_pending() {
            return Err(StorageError::AlreadyPersisted { entity: "bid" });
        }
        let weight_unit = bid.weight_tons.map(|_| WEIGHT_UNIT_TONS);

        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        let result = sqlx::query(
            r#"
            INSERT INTO bids (
                source_id, raw_item_id, external_id, title, description,
                cargo_type, transport_type, weight_value, weight_unit,
                price_value, price_currency, load_location, unload_location,
                published_at, contact_phone, url, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(bid.source_id.0)
        .bind(bid.raw_item_id.map(|id| id.0))
        .bind(&bid.external_id)
        .bind(&bid.title)
        .bind(&bid.description)
        .bind(&bid.cargo_type)
        .bind(&bid.transport_type)
        .bind(to_fixed(bid.weight_tons, WEIGHT_SCALE))
        .bind(weight_unit)
        .bind(to_fixed(bid.price, PRICE_SCALE))
        .bind(&bid.currency)
        .bind(&bid.load_point)
        .bind(&bid.unload_point)
        .bind(bid.published_at)
        .bind(&bid.contact)
        .bind(&bid.url)
        .bind(bid.created_at)
        .bind(bid.created_at)
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;

        Ok(Bid {
            id: Identity::Persisted(BidId(result.last_insert_rowid())),
            ..bid
        })
    }

    async fn get_by_id(&self, id: BidId) -> Result<Option<Bid>, StorageError> {
        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        let row = sqlx::query_as::<_, BidRow>("SELECT * FROM bids WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage_error)?;
        Ok(row.map(BidRow::into_bid))
    }

    async fn list_for_source_since(
        &self,
        source_id: SourceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Bid>, StorageError> {
        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        let rows = sqlx::query_as::<_, BidRow>(
            r#"
            SELECT * FROM bids
             WHERE source_id = ? AND created_at >= ?
             ORDER BY created_at, id
            "#,
        )
        .bind(source_id.0)
        .bind(since)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_error)?;
        Ok(rows.into_iter().map(BidRow::into_bid).collect())
    }

    async fn find_duplicate_candidates(&self, bid: &Bid) -> Result<Vec<Bid>, StorageError> {
        let mut guard = self.session.lock().await;
        let conn = active(&mut guard)?;
        // `IS` so that a missing external id matches other missing ones.
        let rows = sqlx::query_as::<_, BidRow>(
            "SELECT * FROM bids WHERE source_id = ? AND external_id IS ? ORDER BY id",
        )
        .bind(bid.source_id.0)
        .bind(&bid.external_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_error)?;
        Ok(rows.into_iter().map(BidRow::into_bid).collect())
    }
}
