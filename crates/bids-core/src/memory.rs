//! In-memory unit of work with the same commit-gated visibility as the SQL one.
//!
//! Each scope works on a private copy of the committed tables; `commit`
//! publishes the copy, anything else drops it. Concurrent scopes are not
//! reconciled: the last commit wins.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::ports::{BidRepository, RawItemRepository, SourceRepository};
use crate::uow::{ExitAction, ExitPolicy, ScopeState, UnitOfWork, UnitOfWorkFactory};
use crate::{Bid, BidId, Identity, RawItem, RawItemId, Source, SourceId, StorageError};

#[derive(Debug, Clone, Default)]
struct Tables {
    sources: BTreeMap<SourceId, Source>,
    raw_items: BTreeMap<RawItemId, RawItem>,
    bids: BTreeMap<BidId, Bid>,
    next_source_id: i64,
    next_raw_item_id: i64,
    next_bid_id: i64,
}

impl Tables {
    fn insert_source(&mut self, mut source: Source) -> Result<Source, StorageError> {
        if self.sources.values().any(|s| s.code == source.code && s.id != source.id) {
            return Err(StorageError::Constraint(format!(
                "sources.code '{}' already exists",
                source.code
            )));
        }
        let id = match source.id {
            Identity::Persisted(id) => id,
            Identity::Pending => {
                self.next_source_id += 1;
                SourceId(self.next_source_id)
            }
        };
        self.next_source_id = self.next_source_id.max(id.0);
        source.id = Identity::Persisted(id);
        self.sources.insert(id, source.clone());
        Ok(source)
    }

    fn insert_raw_item(&mut self, mut raw_item: RawItem) -> Result<RawItem, StorageError> {
        if !raw_item.id.is_pending() {
            return Err(StorageError::AlreadyPersisted { entity: "raw item" });
        }
        let source_id = raw_item.source_id.ok_or(StorageError::MissingField {
            entity: "raw item",
            field: "source_id",
        })?;
        if !self.sources.contains_key(&source_id) {
            return Err(StorageError::Constraint(format!(
                "raw_items.source_id references missing source {source_id}"
            )));
        }
        self.next_raw_item_id += 1;
        let id = RawItemId(self.next_raw_item_id);
        raw_item.id = Identity::Persisted(id);
        self.raw_items.insert(id, raw_item.clone());
        Ok(raw_item)
    }

    fn insert_bid(&mut self, mut bid: Bid) -> Result<Bid, StorageError> {
        if !bid.id.is_pending() {
            return Err(StorageError::AlreadyPersisted { entity: "bid" });
        }
        if !self.sources.contains_key(&bid.source_id) {
            return Err(StorageError::Constraint(format!(
                "bids.source_id references missing source {}",
                bid.source_id
            )));
        }
        if let Some(raw_item_id) = bid.raw_item_id {
            if !self.raw_items.contains_key(&raw_item_id) {
                return Err(StorageError::Constraint(format!(
                    "bids.raw_item_id references missing raw item {raw_item_id}"
                )));
            }
        }
        self.next_bid_id += 1;
        let id = BidId(self.next_bid_id);
        bid.id = Identity::Persisted(id);
        self.bids.insert(id, bid.clone());
        Ok(bid)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared committed state plus the factory for scopes over it.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    committed: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with committed sources; pending ones get fresh ids.
    pub fn with_sources(sources: impl IntoIterator<Item = Source>) -> Result<Self, StorageError> {
        let store = Self::new();
        {
            let mut tables = lock(&store.committed);
            for source in sources {
                tables.insert_source(source)?;
            }
        }
        Ok(store)
    }

    pub fn sources(&self) -> Vec<Source> {
        lock(&self.committed).sources.values().cloned().collect()
    }

    pub fn raw_items(&self) -> Vec<RawItem> {
        lock(&self.committed).raw_items.values().cloned().collect()
    }

    pub fn bids(&self) -> Vec<Bid> {
        lock(&self.committed).bids.values().cloned().collect()
    }

    /// Deletes a source, cascading to its raw items. Refused while bids reference it.
    pub fn delete_source(&self, id: SourceId) -> Result<(), StorageError> {
        let mut tables = lock(&self.committed);
        if tables.bids.values().any(|b| b.source_id == id) {
            return Err(StorageError::Constraint(format!(
                "source {id} is still referenced by bids"
            )));
        }
        tables.sources.remove(&id);
        tables.raw_items.retain(|_, item| item.source_id != Some(id));
        Ok(())
    }

    /// Deletes a raw item and clears the weak link on bids derived from it.
    pub fn delete_raw_item(&self, id: RawItemId) {
        let mut tables = lock(&self.committed);
        tables.raw_items.remove(&id);
        for bid in tables.bids.values_mut() {
            if bid.raw_item_id == Some(id) {
                bid.raw_item_id = None;
            }
        }
    }
}

#[async_trait]
impl UnitOfWorkFactory for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        let staged = lock(&self.committed).clone();
        let session = Arc::new(Mutex::new(Some(staged)));
        debug!("in-memory scope acquired");
        Ok(Box::new(InMemoryUnitOfWork {
            committed: Arc::clone(&self.committed),
            sources: MemorySourceRepository {
                session: Session(Arc::clone(&session)),
            },
            raw_items: MemoryRawItemRepository {
                session: Session(Arc::clone(&session)),
            },
            bids: MemoryBidRepository {
                session: Session(Arc::clone(&session)),
            },
            session: Session(session),
            state: ScopeState::Active,
        }))
    }
}

#[derive(Debug, Clone)]
struct Session(Arc<Mutex<Option<Tables>>>);

impl Session {
    fn with<R>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut slot = lock(&self.0);
        let tables = slot.as_mut().ok_or(StorageError::ScopeClosed)?;
        f(tables)
    }

    fn take(&self) -> Option<Tables> {
        lock(&self.0).take()
    }
}

pub struct InMemoryUnitOfWork {
    committed: Arc<Mutex<Tables>>,
    session: Session,
    sources: MemorySourceRepository,
    raw_items: MemoryRawItemRepository,
    bids: MemoryBidRepository,
    state: ScopeState,
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
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
        let staged = self.session.take().ok_or(StorageError::ScopeClosed)?;
        *lock(&self.committed) = staged;
        self.state = ScopeState::Committed;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        if self.session.take().is_some() {
            self.state = ScopeState::Aborted;
        }
        Ok(())
    }

    async fn exit(self: Box<Self>, failed: bool) -> Result<ScopeState, StorageError> {
        let mut scope = self;
        if ExitPolicy::decide(failed, scope.state) == ExitAction::Rollback {
            scope.rollback().await?;
        }
        scope.session.take();
        Ok(scope.state)
    }
}

struct MemorySourceRepository {
    session: Session,
}

#[async_trait]
impl SourceRepository for MemorySourceRepository {
    async fn get_by_id(&self, id: SourceId) -> Result<Option<Source>, StorageError> {
        self.session.with(|t| Ok(t.sources.get(&id).cloned()))
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<Source>, StorageError> {
        self.session
            .with(|t| Ok(t.sources.values().find(|s| s.code == code).cloned()))
    }

    async fn list_all(&self) -> Result<Vec<Source>, StorageError> {
        self.session.with(|t| Ok(t.sources.values().cloned().collect()))
    }

    async fn list_active(&self) -> Result<Vec<Source>, StorageError> {
        self.session
            .with(|t| Ok(t.sources.values().filter(|s| s.is_active).cloned().collect()))
    }

    async fn save(&self, source: Source) -> Result<Source, StorageError> {
        self.session.with(|t| t.insert_source(source))
    }
}

struct MemoryRawItemRepository {
    session: Session,
}

#[async_trait]
impl RawItemRepository for MemoryRawItemRepository {
    async fn add(&self, raw_item: RawItem) -> Result<RawItem, StorageError> {
        self.session.with(|t| t.insert_raw_item(raw_item))
    }

    async fn get_by_id(&self, id: RawItemId) -> Result<Option<RawItem>, StorageError> {
        self.session.with(|t| Ok(t.raw_items.get(&id).cloned()))
    }

    async fn list_for_source_since(
        &self,
        source_id: SourceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawItem>, StorageError> {
        self.session.with(|t| {
            let mut items: Vec<RawItem> = t
                .raw_items
                .values()
                .filter(|i| i.source_id == Some(source_id) && i.created_at >= since)
                .cloned()
                .collect();
            items.sort_by_key(|i| (i.created_at, i.id.persisted()));
            Ok(items)
        })
    }
}

struct MemoryBidRepository {
    session: Session,
}

#[async_trait]
impl BidRepository for MemoryBidRepository {
    async fn add(&self, bid: Bid) -> Result<Bid, StorageError> {
        self.session.with(|t| t.insert_bid(bid))
    }

    async fn get_by_id(&self, id: BidId) -> Result<Option<Bid>, StorageError> {
        self.session.with(|t| Ok(t.bids.get(&id).cloned()))
    }

    async fn list_for_source_since(
        &self,
        source_id: SourceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Bid>, StorageError> {
        self.session.with(|t| {
            let mut bids: Vec<Bid> = t
                .bids
                .values()
                .filter(|b| b.source_id == source_id && b.created_at >= since)
                .cloned()
                .collect();
            bids.sort_by_key(|b| (b.created_at, b.id.persisted()));
            Ok(bids)
        })
    }

    async fn find_duplicate_candidates(&self, bid: &Bid) -> Result<Vec<Bid>, StorageError> {
        self.session.with(|t| {
            Ok(t.bids
                .values()
                .filter(|b| b.source_id == bid.source_id && b.external_id == bid.external_id)
                .cloned()
                .collect())
        })
    }
}
