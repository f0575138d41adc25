//! Seat locks.

use crate::{cache_error, scripts, ttl_millis};
use async_trait::async_trait;
use boxoffice_core::error::StoreError;
use boxoffice_core::ids::{CheckoutId, SeatLabel, SessionId};
use boxoffice_core::locks::SeatLockStore;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;

/// Redis-backed seat locks and checkout cache.
///
/// Cloning is cheap and shares the underlying connection.
#[derive(Clone)]
pub struct RedisSeatLockStore {
    /// Connection manager for connection pooling.
    pub(crate) conn_manager: ConnectionManager,
    acquire_all: Script,
    release_all: Script,
    extend_all: Script,
    pub(crate) extend_one: Script,
}

impl RedisSeatLockStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cache`] if the URL is invalid or Redis is
    /// unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| cache_error("Failed to create Redis client", &e))?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| cache_error("Failed to create Redis connection manager", &e))?;
        Ok(Self::new(conn_manager))
    }

    /// Use an existing connection manager.
    #[must_use]
    pub fn new(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            acquire_all: Script::new(scripts::ACQUIRE_ALL),
            release_all: Script::new(scripts::RELEASE_ALL),
            extend_all: Script::new(scripts::EXTEND_ALL),
            extend_one: Script::new(scripts::EXTEND_ONE),
        }
    }

    /// Key of one seat lock.
    pub(crate) fn lock_key(session_id: SessionId, seat: &SeatLabel) -> String {
        format!("seatlock:{{{session_id}}}:{seat}")
    }

    async fn run_seat_script<T: redis::FromRedisValue>(
        &self,
        script: &Script,
        session_id: SessionId,
        seats: &[SeatLabel],
        owner: CheckoutId,
        ttl: Option<Duration>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn_manager.clone();
        let mut invocation = script.prepare_invoke();
        for seat in seats {
            invocation.key(Self::lock_key(session_id, seat));
        }
        invocation.arg(owner.to_string());
        if let Some(ttl) = ttl {
            invocation.arg(ttl_millis(ttl));
        }
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| cache_error("Seat lock script failed", &e))
    }
}

#[async_trait]
impl SeatLockStore for RedisSeatLockStore {
    async fn acquire_all(
        &self,
        session_id: SessionId,
        seats: &[SeatLabel],
        owner: CheckoutId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        if seats.is_empty() {
            return Ok(true);
        }
        let acquired: i64 = self
            .run_seat_script(&self.acquire_all, session_id, seats, owner, Some(ttl))
            .await?;
        tracing::debug!(
            session_id = %session_id,
            checkout_id = %owner,
            seat_count = seats.len(),
            acquired = acquired == 1,
            "Seat lock acquisition"
        );
        Ok(acquired == 1)
    }

    async fn release_all(
        &self,
        session_id: SessionId,
        seats: &[SeatLabel],
        owner: CheckoutId,
    ) -> Result<usize, StoreError> {
        if seats.is_empty() {
            return Ok(0);
        }
        let released: usize = self
            .run_seat_script(&self.release_all, session_id, seats, owner, None)
            .await?;
        tracing::debug!(
            session_id = %session_id,
            checkout_id = %owner,
            released,
            "Seat locks released"
        );
        Ok(released)
    }

    async fn is_locked(&self, session_id: SessionId, seat: &SeatLabel) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.exists(Self::lock_key(session_id, seat))
            .await
            .map_err(|e| cache_error("Failed to check seat lock", &e))
    }

    async fn lock_owner(
        &self,
        session_id: SessionId,
        seat: &SeatLabel,
    ) -> Result<Option<CheckoutId>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let owner: Option<String> = conn
            .get(Self::lock_key(session_id, seat))
            .await
            .map_err(|e| cache_error("Failed to read seat lock", &e))?;
        owner
            .map(|raw| {
                raw.parse::<CheckoutId>().map_err(|e| {
                    StoreError::Serialization(format!("Corrupt seat lock owner {raw:?}: {e}"))
                })
            })
            .transpose()
    }

    async fn extend_all(
        &self,
        session_id: SessionId,
        seats: &[SeatLabel],
        owner: CheckoutId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        if seats.is_empty() {
            return Ok(true);
        }
        let extended: i64 = self
            .run_seat_script(&self.extend_all, session_id, seats, owner, Some(ttl))
            .await?;
        Ok(extended == 1)
    }
}
