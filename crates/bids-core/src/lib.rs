//! Core domain model, repository ports and unit-of-work contract for the bid harvester.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod error;
pub mod memory;
pub mod ports;
pub mod uow;

pub use error::{ProviderError, StorageError};
pub use ports::{BidRepository, RawItemProvider, RawItemRepository, SourceRepository};
pub use uow::{ExitAction, ExitPolicy, ScopeState, UnitOfWork, UnitOfWorkFactory};

pub const CRATE_NAME: &str = "bids-core";

/// Identity of a record that may not have been stored yet.
///
/// `Pending` and `Persisted(0)` are different states; zero is never used as a
/// "not saved" marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "id")]
pub enum Identity<T> {
    Pending,
    Persisted(T),
}

impl<T> Default for Identity<T> {
    fn default() -> Self {
        Self::Pending
    }
}

impl<T: Copy> Identity<T> {
    pub fn persisted(&self) -> Option<T> {
        match self {
            Self::Persisted(id) => Some(*id),
            Self::Pending => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawItemId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BidId(pub i64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RawItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configured origin of listings (a site, a channel, an API).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Identity<SourceId>,
    /// Unique human-readable key, e.g. `ATI`.
    pub code: String,
    pub name: String,
    /// Free-form origin classification: html / telegram / api / whatsapp.
    pub kind: String,
    pub is_active: bool,
    pub description: String,
}

impl Source {
    pub fn new(code: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: Identity::Pending,
            code: code.into(),
            name: name.into(),
            kind: kind.into(),
            is_active: true,
            description: String::new(),
        }
    }
}

/// Unprocessed record captured from a source during one harvesting run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub id: Identity<RawItemId>,
    /// Providers may leave this unset; the orchestrator fills it in before persisting.
    pub source_id: Option<SourceId>,
    pub external_id: Option<String>,
    /// Original content (html / json / text), stored as-is.
    pub payload: String,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the content was fetched from the origin.
    pub received_at: DateTime<Utc>,
}

impl RawItem {
    pub fn new(payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Identity::Pending,
            source_id: None,
            external_id: None,
            payload: payload.into(),
            url: None,
            created_at: now,
            received_at: now,
        }
    }
}

/// Normalized business record derived from a raw item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub id: Identity<BidId>,
    pub source_id: SourceId,
    /// Weak link: cleared when the raw item is deleted.
    pub raw_item_id: Option<RawItemId>,
    pub external_id: Option<String>,
    pub title: String,
    pub description: String,
    pub cargo_type: Option<String>,
    pub transport_type: Option<String>,
    pub load_point: Option<String>,
    pub unload_point: Option<String>,
    pub weight_tons: Option<f64>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub contact: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Bid {
    pub fn new(source_id: SourceId, title: impl Into<String>) -> Self {
        Self {
            id: Identity::Pending,
            source_id,
            raw_item_id: None,
            external_id: None,
            title: title.into(),
            description: String::new(),
            cargo_type: None,
            transport_type: None,
            load_point: None,
            unload_point: None,
            weight_tons: None,
            price: None,
            currency: None,
            contact: None,
            url: None,
            published_at: None,
            created_at: Utc::now(),
        }
    }
}
