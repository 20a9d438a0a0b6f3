//! The application context: every client component, built once and handed around explicitly.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::access::{IdentitySignIn, TokenAuth};
use crate::catalog::ReelCatalog;
use crate::config::Config;
use crate::error::Result;
use crate::fabric::{Fabric, PresenceRecord};
use crate::identity::{lock, FileStore, IdentityStore, LocalStore, VoterProfile};
use crate::ledger::VoteLedger;
use crate::live_state::{LiveState, LiveStateReconciler};
use crate::model::{DeviceType, PageRole, Reel, ReelStanding, Vote, VoterType};
use crate::realtime::RealtimeChannel;
use crate::store::Store;

pub struct AppContext {
    config: Config,
    role: PageRole,
    device_id: String,
    store: Store,
    identity: Arc<IdentityStore>,
    channel: RealtimeChannel,
    live: LiveStateReconciler,
    tokens: TokenAuth,
    sign_in: IdentitySignIn,
    ledger: VoteLedger,
    catalog: Mutex<Option<ReelCatalog>>,
}

impl AppContext {
    /// Wires the components together and joins the live channel. Must be called from within a
    /// tokio runtime.
    pub fn new(
        config: Config,
        store: Store,
        storage: Arc<dyn LocalStore>,
        fabric: Arc<dyn Fabric>,
        role: PageRole,
        device_type: DeviceType,
    ) -> Result<Self> {
        let identity = Arc::new(IdentityStore::new(storage, device_type));
        let device_id = identity.get_or_create_device_id()?;

        let channel = RealtimeChannel::connect(fabric);
        channel.track(PresenceRecord::new(device_id.clone(), role));
        let live = LiveStateReconciler::attach(
            channel.clone(),
            role,
            device_id.clone(),
            config.state_request_delay,
            LiveState::default(),
        );

        Ok(Self {
            tokens: TokenAuth::new(store.clone(), identity.clone(), config.token_lookup_timeout),
            sign_in: IdentitySignIn::new(store.clone(), identity.clone()),
            ledger: VoteLedger::new(store.clone(), identity.clone(), Some(channel.clone())),
            config,
            role,
            device_id,
            store,
            identity,
            channel,
            live,
            catalog: Mutex::new(None),
        })
    }

    /// Opens the configured store and client state file.
    pub fn open(
        config: Config,
        fabric: Arc<dyn Fabric>,
        role: PageRole,
        device_type: DeviceType,
    ) -> Result<Self> {
        let store = Store::open(&config)?;
        let storage = Arc::new(FileStore::open(&config.client_state_path)?);
        Self::new(config, store, storage, fabric, role, device_type)
    }

    /// First-connection setup: restores a saved token or identity session and loads the reel
    /// catalog. Without either session the bare device is registered again on every bootstrap, so
    /// a voter id persisted before an admin reset is replaced and `last_seen_at` stays current.
    pub async fn bootstrap(&self) -> Result<()> {
        if self.tokens.restore_session().await {
            info!("Bootstrapped with a token session");
        } else if self.sign_in.restore_identity_session().await.is_some() {
            info!("Bootstrapped with an identity session");
        } else {
            self.identity
                .register(&self.store, VoterProfile::default())
                .await?;
        }

        let catalog = match &self.config.reels_file {
            Some(path) => ReelCatalog::from_file(path)?,
            None => ReelCatalog::load(&self.store).await?,
        };
        if catalog.is_empty() {
            warn!("Reel catalog is empty");
        }
        *lock(&self.catalog) = Some(catalog);
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn role(&self) -> PageRole {
        self.role
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    pub fn live_state(&self) -> &LiveStateReconciler {
        &self.live
    }

    pub fn tokens(&self) -> &TokenAuth {
        &self.tokens
    }

    pub fn sign_in(&self) -> &IdentitySignIn {
        &self.sign_in
    }

    pub fn ledger(&self) -> &VoteLedger {
        &self.ledger
    }

    /// `None` until the device has registered.
    pub fn voter_id(&self) -> Option<i32> {
        self.identity.voter_id()
    }

    /// `None` until `bootstrap` has loaded it.
    pub fn catalog(&self) -> Option<ReelCatalog> {
        lock(&self.catalog).clone()
    }

    /// The reel on screen: the live reel, else the first reel of the catalog, else `None`.
    pub fn current_reel(&self) -> Option<Reel> {
        let live = self.live.state();
        lock(&self.catalog)
            .as_ref()
            .and_then(|catalog| catalog.current_reel(&live).cloned())
    }

    /// Name of the token holder, if signed in with a token.
    pub fn person_name(&self) -> Option<String> {
        self.tokens.person_name()
    }

    /// The token's category, else the category the control panel is showing.
    pub fn category(&self) -> Option<String> {
        self.tokens
            .category()
            .or_else(|| self.live.state().category)
    }

    /// The token type when signed in with a token, otherwise judge pages vote as judges and
    /// everything else as audience.
    pub fn voter_type(&self) -> VoterType {
        match self.tokens.token_type() {
            Some(token_type) => token_type,
            None if self.role == PageRole::Judge => VoterType::Judge,
            None => VoterType::Audience,
        }
    }

    /// Votes on `reel_id` as whoever this client is signed in as.
    pub async fn cast_vote(&self, reel_id: &str, score: i32) -> Result<Vote> {
        let name = self.person_name();
        let category = self.category();
        self.ledger
            .save_vote(
                reel_id,
                score,
                self.voter_type(),
                name.as_deref(),
                category.as_deref(),
            )
            .await
    }

    /// Standings of the catalog's reels, optionally for one category.
    pub async fn standings(&self, category: Option<&str>) -> Vec<ReelStanding> {
        let reels = self
            .catalog()
            .map(|catalog| catalog.reels().to_vec())
            .unwrap_or_default();
        self.ledger.get_all_stats(&reels, category).await
    }
}

#[cfg(all(test, feature = "ssr"))]
mod tests {
    use super::*;
    use crate::create_token;
    use crate::fabric::LocalFabric;
    use crate::identity::MemoryStore;
    use crate::model::ShowStatus;
    use crate::scoring::ScoringPolicy;
    use crate::test_support::wait_until;
    use crate::upsert_reel;
    use std::time::Duration;

    const DATASET: &str = r#"[
        {"id": "r-1", "number": 1, "contestant": "Al", "category": "Drama",
         "duration": 90, "thumbnail": "🎭", "videoUrl": "https://cdn.example/r-1.mp4"},
        {"id": "r-2", "number": 2, "contestant": "Bo", "category": "Drama",
         "duration": 80, "thumbnail": "🎭", "videoUrl": "https://cdn.example/r-2.mp4"}
    ]"#;

    fn config() -> Config {
        Config {
            state_request_delay: Duration::from_millis(10),
            ..Config::default()
        }
    }

    async fn seeded_store() -> Store {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let reels = ReelCatalog::from_json(DATASET).unwrap().reels().to_vec();
        store
            .run(move |conn| {
                for reel in &reels {
                    upsert_reel(conn, reel)?;
                }
                create_token(conn, "JUDGE9", VoterType::Judge, "Ada", Some("Drama"))?;
                Ok(())
            })
            .await
            .unwrap();
        store
    }

    fn client(
        store: &Store,
        storage: Arc<dyn LocalStore>,
        fabric: &Arc<dyn Fabric>,
        role: PageRole,
    ) -> AppContext {
        AppContext::new(
            config(),
            store.clone(),
            storage,
            fabric.clone(),
            role,
            DeviceType::Mobile,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_registers_and_loads_catalog() {
        let store = seeded_store().await;
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let ctx = client(&store, Arc::new(MemoryStore::new()), &fabric, PageRole::Audience);
        assert!(ctx.voter_id().is_none());
        assert!(ctx.catalog().is_none());
        assert!(ctx.current_reel().is_none());

        ctx.bootstrap().await.unwrap();
        assert!(ctx.voter_id().is_some());
        assert_eq!(ctx.catalog().map(|c| c.len()), Some(2));
        assert_eq!(ctx.current_reel().map(|r| r.id), Some("r-1".to_string()));
        assert_eq!(ctx.voter_type(), VoterType::Audience);
        assert!(ctx.person_name().is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_restores_token_session() {
        let store = seeded_store().await;
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let storage: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());

        let first = client(&store, storage.clone(), &fabric, PageRole::Judge);
        let session = first.tokens().validate_token("judge9").await.unwrap();
        drop(first);

        let reloaded = client(&store, storage, &fabric, PageRole::Judge);
        reloaded.bootstrap().await.unwrap();
        assert!(reloaded.tokens().is_authenticated());
        assert_eq!(reloaded.voter_id(), Some(session.voter.id));
        assert_eq!(reloaded.person_name().as_deref(), Some("Ada"));
        assert_eq!(reloaded.category().as_deref(), Some("Drama"));
        assert_eq!(reloaded.voter_type(), VoterType::Judge);
    }

    #[tokio::test]
    async fn test_vote_after_reset_reregisters_device() {
        let store = seeded_store().await;
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let storage: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());

        let first = client(&store, storage.clone(), &fabric, PageRole::Audience);
        first.bootstrap().await.unwrap();
        let stale_id = first.voter_id().unwrap();
        first.cast_vote("r-1", 6).await.unwrap();
        drop(first);

        store.run(crate::reset_database).await.unwrap();

        let reloaded = client(&store, storage, &fabric, PageRole::Audience);
        reloaded.bootstrap().await.unwrap();
        let voter_id = reloaded.voter_id().unwrap();
        assert_ne!(voter_id, stale_id);
        let vote = reloaded.cast_vote("r-1", 7).await.unwrap();
        assert_eq!(vote.voter_id, voter_id);
        assert_eq!(vote.score, 7);
    }

    #[tokio::test]
    async fn test_catalog_from_dataset_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reels.json");
        std::fs::write(&path, DATASET).unwrap();

        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let ctx = AppContext::new(
            Config {
                reels_file: Some(path),
                ..config()
            },
            store,
            Arc::new(MemoryStore::new()),
            fabric,
            PageRole::Results,
            DeviceType::Desktop,
        )
        .unwrap();
        ctx.bootstrap().await.unwrap();
        assert_eq!(ctx.catalog().map(|c| c.categories()), Some(vec!["Drama".to_string()]));
    }

    #[tokio::test]
    async fn test_event_flow_between_clients() {
        let store = seeded_store().await;
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let control = client(&store, Arc::new(MemoryStore::new()), &fabric, PageRole::Control);
        control.bootstrap().await.unwrap();
        control.live_state().show_reel("r-2", 1).unwrap();

        let audience = client(&store, Arc::new(MemoryStore::new()), &fabric, PageRole::Audience);
        audience.bootstrap().await.unwrap();
        wait_until(|| audience.current_reel().map(|r| r.id) == Some("r-2".to_string())).await;
        assert_eq!(audience.live_state().state().status, ShowStatus::Live);
        wait_until(|| control.channel().connected_devices() == 1).await;

        let reel = audience.current_reel().unwrap();
        audience.cast_vote(&reel.id, 9).await.unwrap();
        assert!(audience.ledger().has_voted("r-2").await);

        let standings = control.standings(None).await;
        assert_eq!(standings[0].reel.id, "r-2");
        assert_eq!(standings[0].stats.audience_count, 1);
        assert_eq!(standings[0].stats.final_score, 9.0);
    }
}
