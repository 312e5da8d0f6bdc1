use crate::models::Rule;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::{timeout, Duration};

/// Rule persistence collaborator.
///
/// The engine saves after every state mutation, before acting on the new
/// state, so a crash never leaves memory and storage diverged by more than
/// one decision.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn load(&self, instrument_id: &str) -> Result<Option<Rule>>;
    async fn save(&self, rule: &Rule) -> Result<()>;
}

/// Redis-backed rule store.
///
/// One JSON value per rule under `rule:{instrument}`.
pub struct RedisRuleStore {
    conn: Mutex<ConnectionManager>,
}

impl RedisRuleStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Invalid Redis URL")?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .context("Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn key(instrument_id: &str) -> String {
        format!("rule:{}", instrument_id)
    }
}

#[async_trait]
impl RuleStore for RedisRuleStore {
    async fn load(&self, instrument_id: &str) -> Result<Option<Rule>> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let raw: Option<String> = conn.get(Self::key(instrument_id)).await?;

        match raw {
            Some(json) => {
                let rule: Rule = serde_json::from_str(&json)?;
                tracing::debug!(instrument = %instrument_id, "loaded rule from Redis");
                Ok(Some(rule))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, rule: &Rule) -> Result<()> {
        let json = serde_json::to_string(rule)?;
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner()).clone();
        conn.set::<_, _, ()>(Self::key(&rule.instrument_id), json)
            .await?;
        Ok(())
    }
}

/// In-memory rule store for tests and paper mode.
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: Mutex<HashMap<String, Rule>>,
    saves: Mutex<u32>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves performed, for asserting persist-before-act.
    pub fn save_count(&self) -> u32 {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn load(&self, instrument_id: &str) -> Result<Option<Rule>> {
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rules.get(instrument_id).cloned())
    }

    async fn save(&self, rule: &Rule) -> Result<()> {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.insert(rule.instrument_id.clone(), rule.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
