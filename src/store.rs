use diesel::SqliteConnection;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::scoring::ScoringPolicy;
use crate::{build_pool, DbPool};

/// Async handle on the shared SQLite store. Every call checks a connection out of the pool on a
/// blocking thread, the same way the server functions do.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
    policy: ScoringPolicy,
}

impl Store {
    pub fn open(config: &Config) -> Result<Self> {
        let pool = build_pool(&config.database_url, config.pool_size, config.scoring_policy)?;
        Ok(Self {
            pool,
            policy: config.scoring_policy,
        })
    }

    /// A private database that lives as long as the store. Used by tests and dry runs.
    pub fn in_memory(policy: ScoringPolicy) -> Result<Self> {
        let pool = build_pool(":memory:", 1, policy)?;
        Ok(Self { pool, policy })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn policy(&self) -> ScoringPolicy {
        self.policy
    }

    /// Runs `f` against a pooled connection off the async runtime.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> std::result::Result<T, diesel::result::Error>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = pool.get()?;
            f(&mut conn).map_err(AppError::from)
        })
        .await?
    }
}
