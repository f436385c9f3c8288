//! Bounded, semaphore-gated connection pool.
//!
//! Every `acquire()` opens a fresh connection once a slot is free. The slot is
//! returned when the [`PooledConnection`] guard is dropped, after the
//! connection itself has been closed, so release happens exactly once on
//! every exit path.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{MigrateError, Result};

/// Opens live connections to one database engine.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection>;

    /// Short engine name used in logs ("mssql", "postgres").
    fn engine(&self) -> &'static str;
}

/// A fixed-capacity pool for one engine and connection string.
pub struct ConnectionPool<M: ConnectionManager> {
    manager: M,
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Create a pool. No connection is opened until the first `acquire()`.
    pub fn new(manager: M, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(MigrateError::Config(format!(
                "{} pool capacity must be at least 1",
                manager.engine()
            )));
        }
        Ok(Self {
            manager,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Wait for a free slot, then open a connection.
    ///
    /// If the connection cannot be opened the slot is freed before the error
    /// is returned.
    pub async fn acquire(&self) -> Result<PooledConnection<M::Connection>> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MigrateError::pool(e, format!("acquiring {} connection", self.engine())))?;

        let conn = self.manager.connect().await?;
        debug!("{} connection acquired ({})", self.engine(), self.busy_state());

        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }

    /// `"<acquired> / <capacity>"` snapshot.
    pub fn busy_state(&self) -> String {
        format!("{} / {}", self.in_use(), self.capacity)
    }

    /// Number of slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn engine(&self) -> &'static str {
        self.manager.engine()
    }
}

/// A live connection holding one pool slot.
///
/// Fields drop in declaration order: the connection is closed first, then
/// the permit is returned.
pub struct PooledConnection<C> {
    conn: C,
    _permit: OwnedSemaphorePermit,
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}
