use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use tracing::info;

use crate::error::{AppError, Result};
use crate::scoring::ScoringPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub pool_size: u32,
    /// File backing the client's durable session (device id, voter id, saved token).
    pub client_state_path: PathBuf,
    pub token_lookup_timeout: Duration,
    /// Pause between connecting and asking the control panel for the live state.
    pub state_request_delay: Duration,
    pub scoring_policy: ScoringPolicy,
    /// Optional JSON reel dataset used instead of the reels table.
    pub reels_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "reel-vote.db".to_string(),
            pool_size: 8,
            client_state_path: PathBuf::from(".reel-vote-client.json"),
            token_lookup_timeout: Duration::from_millis(8000),
            state_request_delay: Duration::from_millis(500),
            scoring_policy: ScoringPolicy::default(),
            reels_file: None,
        }
    }
}

impl Config {
    /// Loads the configuration from the environment (and `.env`), using the defaults above for
    /// anything unset.
    pub fn load() -> Result<Self> {
        Self::load_with(false)
    }

    /// Like [`Config::load`], but `DATABASE_URL` must be set. The server never falls back to the
    /// default database file.
    pub fn load_server() -> Result<Self> {
        Self::load_with(true)
    }

    fn load_with(require_database_url: bool) -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        Ok(Self {
            database_url: database_url(
                env::var("DATABASE_URL").ok(),
                require_database_url,
                &defaults.database_url,
            )?,
            pool_size: try_load("DATABASE_POOL_SIZE", "8")?,
            client_state_path: try_load(
                "CLIENT_STATE_PATH",
                &defaults.client_state_path.to_string_lossy(),
            )?,
            token_lookup_timeout: Duration::from_millis(try_load(
                "TOKEN_LOOKUP_TIMEOUT_MS",
                "8000",
            )?),
            state_request_delay: Duration::from_millis(try_load("STATE_REQUEST_DELAY_MS", "500")?),
            scoring_policy: try_load("SCORING_POLICY", &defaults.scoring_policy.to_string())?,
            reels_file: env::var("REELS_FILE").ok().map(PathBuf::from),
        })
    }
}

fn database_url(raw: Option<String>, required: bool, default: &str) -> Result<String> {
    match raw {
        Some(url) => Ok(url),
        None if required => Err(AppError::Config("DATABASE_URL must be set".to_string())),
        None => {
            info!("DATABASE_URL not set, using default: {default}");
            Ok(default.to_string())
        }
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    raw.parse()
        .map_err(|e| AppError::Config(format!("Invalid {key} value {raw:?}: {e}")))
}
