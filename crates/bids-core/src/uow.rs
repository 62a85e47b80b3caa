//! Single-use transactional scope over the three repositories.

use async_trait::async_trait;
use serde::Serialize;

use crate::ports::{BidRepository, RawItemRepository, SourceRepository};
use crate::StorageError;

/// Lifecycle of one acquired scope: `Active -> Committed | Aborted`.
///
/// Both terminal states end the storage transaction; a new scope is needed
/// for further work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Rollback,
    Keep,
}

/// Decision applied when a scope exits. Commit is opt-in: anything other
/// than a committed, non-failing scope is rolled back.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitPolicy;

impl ExitPolicy {
    pub fn decide(failed: bool, state: ScopeState) -> ExitAction {
        if failed {
            return ExitAction::Rollback;
        }
        match state {
            ScopeState::Committed => ExitAction::Keep,
            ScopeState::Active | ScopeState::Aborted => ExitAction::Rollback,
        }
    }
}

/// One transactional scope bound to one storage session.
///
/// Repositories borrowed from the scope cannot outlive it; once the scope is
/// committed or rolled back they answer [`StorageError::ScopeClosed`].
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    fn sources(&self) -> &dyn SourceRepository;

    fn raw_items(&self) -> &dyn RawItemRepository;

    fn bids(&self) -> &dyn BidRepository;

    fn state(&self) -> ScopeState;

    /// Durably applies every write issued through this scope.
    async fn commit(&mut self) -> Result<(), StorageError>;

    /// Discards every write issued so far. A no-op once the scope is terminal.
    async fn rollback(&mut self) -> Result<(), StorageError>;

    /// Applies [`ExitPolicy`] and releases the storage session.
    ///
    /// `failed` tells whether the work inside the scope is propagating an
    /// error. Returns the final state.
    async fn exit(self: Box<Self>, failed: bool) -> Result<ScopeState, StorageError>;
}

#[async_trait]
pub trait UnitOfWorkFactory: Send + Sync {
    /// Acquires a fresh scope with its own storage session.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError>;
}
