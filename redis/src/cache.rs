//! Checkout summary cache.

use crate::locks::RedisSeatLockStore;
use crate::{cache_error, ttl_millis};
use async_trait::async_trait;
use boxoffice_core::error::StoreError;
use boxoffice_core::ids::CheckoutId;
use boxoffice_core::locks::CheckoutCache;
use boxoffice_core::model::CheckoutSummary;
use redis::AsyncCommands;
use std::time::Duration;

fn summary_key(checkout_id: CheckoutId) -> String {
    format!("checkout:{checkout_id}:summary")
}

#[async_trait]
impl CheckoutCache for RedisSeatLockStore {
    async fn put(&self, summary: &CheckoutSummary, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let bytes = bincode::serialize(summary)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let _: () = redis::cmd("SET")
            .arg(summary_key(summary.checkout_id))
            .arg(bytes)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| cache_error("Failed to cache checkout summary", &e))?;
        Ok(())
    }

    async fn get(&self, checkout_id: CheckoutId) -> Result<Option<CheckoutSummary>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let bytes: Option<Vec<u8>> = conn
            .get(summary_key(checkout_id))
            .await
            .map_err(|e| cache_error("Failed to read checkout summary", &e))?;
        bytes
            .map(|bytes| {
                bincode::deserialize(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .transpose()
    }

    async fn extend(&self, checkout_id: CheckoutId, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let extended: i64 = self
            .extend_one
            .key(summary_key(checkout_id))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| cache_error("Failed to extend checkout summary", &e))?;
        Ok(extended == 1)
    }

    async fn delete(&self, checkout_id: CheckoutId) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(summary_key(checkout_id))
            .await
            .map_err(|e| cache_error("Failed to delete checkout summary", &e))?;
        Ok(())
    }
}
