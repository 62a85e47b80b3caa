//! Capability contracts consumed by the harvesting orchestrator.
//!
//! Repositories never commit or roll back; that belongs to the
//! [`UnitOfWork`](crate::UnitOfWork) they were obtained from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Bid, BidId, ProviderError, RawItem, RawItemId, Source, SourceId, StorageError};

#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn get_by_id(&self, id: SourceId) -> Result<Option<Source>, StorageError>;

    async fn get_by_code(&self, code: &str) -> Result<Option<Source>, StorageError>;

    /// All sources ordered by identity.
    async fn list_all(&self) -> Result<Vec<Source>, StorageError>;

    async fn list_active(&self) -> Result<Vec<Source>, StorageError>;

    /// Inserts a pending source or updates a persisted one.
    async fn save(&self, source: Source) -> Result<Source, StorageError>;
}

#[async_trait]
pub trait RawItemRepository: Send + Sync {
    /// Stores a pending raw item and returns it with its identity assigned.
    async fn add(&self, raw_item: RawItem) -> Result<RawItem, StorageError>;

    /// Stores every item in input order; the output has the same length and order.
    async fn add_many(&self, raw_items: Vec<RawItem>) -> Result<Vec<RawItem>, StorageError> {
        let mut saved = Vec::with_capacity(raw_items.len());
        for raw_item in raw_items {
            saved.push(self.add(raw_item).await?);
        }
        Ok(saved)
    }

    async fn get_by_id(&self, id: RawItemId) -> Result<Option<RawItem>, StorageError>;

    /// Items of `source_id` created at or after `since`, oldest first.
    async fn list_for_source_since(
        &self,
        source_id: SourceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawItem>, StorageError>;
}

#[async_trait]
pub trait BidRepository: Send + Sync {
    async fn add(&self, bid: Bid) -> Result<Bid, StorageError>;

    async fn add_many(&self, bids: Vec<Bid>) -> Result<Vec<Bid>, StorageError> {
        let mut saved = Vec::with_capacity(bids.len());
        for bid in bids {
            saved.push(self.add(bid).await?);
        }
        Ok(saved)
    }

    async fn get_by_id(&self, id: BidId) -> Result<Option<Bid>, StorageError>;

    async fn list_for_source_since(
        &self,
        source_id: SourceId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Bid>, StorageError>;

    /// Bids that may describe the same listing: equal `source_id` and equal
    /// `external_id` (an absent external id matches an absent one).
    async fn find_duplicate_candidates(&self, bid: &Bid) -> Result<Vec<Bid>, StorageError>;
}

/// External fetch capability for one source.
///
/// Implementations return 0..N pending raw items and must not touch storage.
#[async_trait]
pub trait RawItemProvider: Send + Sync {
    async fn fetch_raw_items(&self, source: &Source) -> Result<Vec<RawItem>, ProviderError>;
}
