use redis::AsyncCommands;
use redis::Client;
use std::fmt::Display;

use crate::error::AppError;
use crate::error::AppResult;
use crate::models::WordFrequencyProfile;
use crate::services::repository::ProfileCache;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    WordFrequency(String),
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::WordFrequency(user_id) => write!(f, "wordfreq:{}", user_id),
        }
    }
}

/// Opens a Redis client; connections are multiplexed per call
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}

/// JSON values in Redis, read and written with awaited commands
#[derive(Clone)]
pub struct Cache {
    redis_client: Client,
}

impl Cache {
    pub fn new(redis_client: Client) -> Self {
        Self { redis_client }
    }

    pub async fn get<T: serde::de::DeserializeOwned>(
        &self,
        key: &CacheKey,
    ) -> AppResult<Option<T>> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let cached: Option<String> = conn.get(key.to_string()).await?;

        cached
            .map(|json| {
                serde_json::from_str(&json).map_err(|e| {
                    AppError::Internal(format!("Cached value for {} is unreadable: {}", key, e))
                })
            })
            .transpose()
    }

    /// Overwrites `key` with a TTL; returns once Redis has acknowledged the write
    pub async fn set<T: serde::Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: u64,
    ) -> AppResult<()> {
        let value = serde_json::to_string(value)?;
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let _: () = conn.set_ex(key.to_string(), value, ttl).await?;

        tracing::debug!(key = %key, ttl = ttl, "Cache value written");
        Ok(())
    }
}

/// Word-frequency profiles kept in Redis under `wordfreq:{user_id}`
#[derive(Clone)]
pub struct RedisProfileCache {
    cache: Cache,
    ttl_secs: u64,
}

impl RedisProfileCache {
    pub fn new(cache: Cache, ttl_secs: u64) -> Self {
        Self { cache, ttl_secs }
    }
}

#[async_trait::async_trait]
impl ProfileCache for RedisProfileCache {
    async fn store_profile(&self, user_id: &str, profile: &WordFrequencyProfile) -> AppResult<()> {
        self.cache
            .set(
                &CacheKey::WordFrequency(user_id.to_string()),
                profile,
                self.ttl_secs,
            )
            .await
    }

    async fn load_profile(&self, user_id: &str) -> AppResult<Option<WordFrequencyProfile>> {
        self.cache
            .get(&CacheKey::WordFrequency(user_id.to_string()))
            .await
    }
}
