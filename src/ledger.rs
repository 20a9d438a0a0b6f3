//! Vote ledger: one score per (reel, voter), plus the aggregate read paths.
//!
//! Writes surface their errors so a caller can react; reads never fail and fall back to "not
//! voted" or zero stats after logging.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::identity::{lock, IdentityStore};
use crate::model::{rank_reels, Reel, ReelStanding, ReelStats, Vote, VoteSubmission, VoterType};
use crate::realtime::{LiveEvent, RealtimeChannel, VoteEvent};
use crate::store::Store;
use crate::{clear_votes, get_aggregate, get_all_aggregates, get_vote_score, upsert_vote};

pub struct VoteLedger {
    store: Store,
    identity: Arc<IdentityStore>,
    channel: Option<RealtimeChannel>,
    cache: Mutex<HashMap<String, i32>>,
}

fn cache_key(reel_id: &str, voter_id: i32) -> String {
    format!("{reel_id}:{voter_id}")
}

impl VoteLedger {
    /// `channel` is where vote events go; a ledger without one only writes.
    pub fn new(
        store: Store,
        identity: Arc<IdentityStore>,
        channel: Option<RealtimeChannel>,
    ) -> Self {
        Self {
            store,
            identity,
            channel,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Records this voter's score for a reel, replacing any earlier score. The vote event is
    /// broadcast after the write and its delivery does not affect the result.
    pub async fn save_vote(
        &self,
        reel_id: &str,
        score: i32,
        voter_type: VoterType,
        voter_name: Option<&str>,
        category: Option<&str>,
    ) -> Result<Vote> {
        let Some(voter_id) = self.identity.voter_id() else {
            warn!("Vote for {reel_id} rejected: {}", AppError::NotRegistered);
            return Err(AppError::NotRegistered);
        };

        let submission = VoteSubmission {
            reel_id: reel_id.to_string(),
            voter_id,
            score,
            voter_type,
            voter_name: voter_name.map(str::to_string),
            category: category.map(str::to_string),
        };
        let vote = self
            .store
            .run(move |conn| upsert_vote(conn, &submission))
            .await
            .map_err(|e| {
                error!("Failed to save vote of voter {voter_id} for {reel_id}: {e}");
                e
            })?;

        lock(&self.cache).insert(cache_key(reel_id, voter_id), vote.score);
        info!("Voter {voter_id} scored {reel_id} with {}", vote.score);

        if let Some(channel) = &self.channel {
            channel.broadcast(LiveEvent::Vote(VoteEvent {
                reel_id: vote.reel_id.clone(),
                score: vote.score,
                voter_type: vote.voter_type,
                voter_id,
            }));
        }
        Ok(vote)
    }

    /// This voter's score for `reel_id`, if any. Cache first, then the store.
    pub async fn get_my_vote(&self, reel_id: &str) -> Option<i32> {
        let voter_id = self.identity.voter_id()?;
        let key = cache_key(reel_id, voter_id);
        if let Some(score) = lock(&self.cache).get(&key) {
            debug!("Cached vote for {key}");
            return Some(*score);
        }

        let reel = reel_id.to_string();
        match self
            .store
            .run(move |conn| get_vote_score(conn, &reel, voter_id))
            .await
        {
            Ok(Some(score)) => {
                lock(&self.cache).insert(key, score);
                Some(score)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to look up vote of voter {voter_id} for {reel_id}: {e}");
                None
            }
        }
    }

    pub async fn has_voted(&self, reel_id: &str) -> bool {
        self.get_my_vote(reel_id).await.is_some()
    }

    /// Aggregate stats of one reel. Zero when nobody voted or the store is unreachable.
    pub async fn get_reel_stats(&self, reel_id: &str) -> ReelStats {
        let reel = reel_id.to_string();
        match self.store.run(move |conn| get_aggregate(conn, &reel)).await {
            Ok(aggregate) => ReelStats::from_aggregate(aggregate.as_ref()),
            Err(e) => {
                warn!("Failed to read stats of {reel_id}: {e}");
                ReelStats::default()
            }
        }
    }

    /// Standings of `reels` (optionally one category), best final score first. Empty when the
    /// aggregates cannot be read.
    pub async fn get_all_stats(&self, reels: &[Reel], category: Option<&str>) -> Vec<ReelStanding> {
        match self.store.run(get_all_aggregates).await {
            Ok(aggregates) => rank_reels(reels, &aggregates, category),
            Err(e) => {
                warn!("Failed to read aggregates: {e}");
                Vec::new()
            }
        }
    }

    /// Deletes every vote and aggregate. Irreversible; meant for resets before an event.
    pub async fn clear_all(&self) -> Result<usize> {
        let deleted = self.store.run(clear_votes).await.map_err(|e| {
            error!("Failed to clear votes: {e}");
            e
        })?;
        lock(&self.cache).clear();
        info!("Cleared {deleted} votes");
        Ok(deleted)
    }

    pub fn cached_votes(&self) -> usize {
        lock(&self.cache).len()
    }
}

#[cfg(all(test, feature = "ssr"))]
mod tests {
    use super::*;
    use crate::fabric::{Fabric, LocalFabric};
    use crate::identity::{MemoryStore, VoterProfile};
    use crate::model::DeviceType;
    use crate::realtime::EventKind;
    use crate::scoring::ScoringPolicy;
    use crate::test_support::wait_until;

    fn reel(id: &str, number: i32, category: &str) -> Reel {
        Reel {
            id: id.to_string(),
            number,
            contestant: format!("Contestant {number}"),
            category: category.to_string(),
            duration: 60,
            thumbnail: String::new(),
            video_url: String::new(),
        }
    }

    async fn registered(store: &Store) -> Arc<IdentityStore> {
        let identity = Arc::new(IdentityStore::new(
            Arc::new(MemoryStore::new()),
            DeviceType::Mobile,
        ));
        identity
            .register(store, VoterProfile::default())
            .await
            .unwrap();
        identity
    }

    #[tokio::test]
    async fn test_vote_scenario() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let ledger = VoteLedger::new(store.clone(), registered(&store).await, None);

        assert!(!ledger.has_voted("reel-7").await);
        let vote = ledger
            .save_vote("reel-7", 8, VoterType::Audience, None, None)
            .await
            .unwrap();
        assert_eq!(vote.score, 8);
        assert!(ledger.has_voted("reel-7").await);
        assert_eq!(ledger.get_my_vote("reel-7").await, Some(8));
    }

    #[tokio::test]
    async fn test_repeated_votes_keep_last_score() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let identity = registered(&store).await;
        let voter_id = identity.voter_id().unwrap();
        let ledger = VoteLedger::new(store.clone(), identity, None);

        for score in [2, 10, 7] {
            ledger
                .save_vote("reel-1", score, VoterType::Audience, Some("Mo"), Some("Drama"))
                .await
                .unwrap();
        }
        assert_eq!(ledger.get_my_vote("reel-1").await, Some(7));

        let stored = store
            .run(move |conn| get_vote_score(conn, "reel-1", voter_id))
            .await
            .unwrap();
        assert_eq!(stored, Some(7));
        let stats = ledger.get_reel_stats("reel-1").await;
        assert_eq!(stats.total_votes, 1);
        assert_eq!(stats.audience_avg, 7.0);
    }

    #[tokio::test]
    async fn test_changed_vote_updates_reel_stats() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let first = VoteLedger::new(store.clone(), registered(&store).await, None);
        let second = VoteLedger::new(store.clone(), registered(&store).await, None);

        first
            .save_vote("reel-4", 4, VoterType::Audience, None, None)
            .await
            .unwrap();
        second
            .save_vote("reel-4", 8, VoterType::Audience, None, None)
            .await
            .unwrap();
        let stats = first.get_reel_stats("reel-4").await;
        assert_eq!(stats.audience_count, 2);
        assert_eq!(stats.audience_avg, 6.0);

        first
            .save_vote("reel-4", 10, VoterType::Audience, None, None)
            .await
            .unwrap();
        let stats = first.get_reel_stats("reel-4").await;
        assert_eq!(stats.audience_count, 2);
        assert_eq!(stats.total_votes, 2);
        assert_eq!(stats.audience_avg, 9.0);
        assert_eq!(stats.final_score, 9.0);
        assert_eq!(first.get_my_vote("reel-4").await, Some(10));
    }

    #[tokio::test]
    async fn test_unregistered_voter_cannot_vote() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let identity = Arc::new(IdentityStore::new(
            Arc::new(MemoryStore::new()),
            DeviceType::Desktop,
        ));
        let ledger = VoteLedger::new(store, identity, None);

        let result = ledger
            .save_vote("reel-1", 5, VoterType::Audience, None, None)
            .await;
        assert!(matches!(result, Err(AppError::NotRegistered)));
        assert_eq!(ledger.get_my_vote("reel-1").await, None);
    }

    #[tokio::test]
    async fn test_stats_for_unvoted_reel_are_zero() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let ledger = VoteLedger::new(store.clone(), registered(&store).await, None);
        assert_eq!(ledger.get_reel_stats("reel-9").await, ReelStats::default());
    }

    #[tokio::test]
    async fn test_get_my_vote_reads_through_to_store() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let identity = registered(&store).await;
        let writer = VoteLedger::new(store.clone(), identity.clone(), None);
        writer
            .save_vote("reel-2", 4, VoterType::Judge, None, None)
            .await
            .unwrap();

        // A fresh ledger (e.g. after a reload) has an empty cache.
        let reader = VoteLedger::new(store.clone(), identity, None);
        assert_eq!(reader.cached_votes(), 0);
        assert_eq!(reader.get_my_vote("reel-2").await, Some(4));
        assert_eq!(reader.cached_votes(), 1);
    }

    #[tokio::test]
    async fn test_all_stats_and_clear() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let audience = registered(&store).await;
        let judge = registered(&store).await;
        let audience_ledger = VoteLedger::new(store.clone(), audience, None);
        let judge_ledger = VoteLedger::new(store.clone(), judge, None);

        audience_ledger
            .save_vote("reel-1", 6, VoterType::Audience, None, None)
            .await
            .unwrap();
        audience_ledger
            .save_vote("reel-2", 9, VoterType::Audience, None, None)
            .await
            .unwrap();
        judge_ledger
            .save_vote("reel-1", 10, VoterType::Judge, Some("Ada"), None)
            .await
            .unwrap();

        let reels = vec![
            reel("reel-1", 1, "Drama"),
            reel("reel-2", 2, "Drama"),
            reel("reel-3", 1, "Comedy"),
        ];
        let standings = audience_ledger.get_all_stats(&reels, None).await;
        let order: Vec<&str> = standings.iter().map(|s| s.reel.id.as_str()).collect();
        // reel-1: 10 * 0.6 + 6 * 0.4 = 8.4
        assert_eq!(order, vec!["reel-2", "reel-1", "reel-3"]);
        assert!((standings[1].stats.final_score - 8.4).abs() < 1e-9);
        assert_eq!(standings[2].stats, ReelStats::default());

        let comedy = audience_ledger.get_all_stats(&reels, Some("Comedy")).await;
        assert_eq!(comedy.len(), 1);

        assert_eq!(audience_ledger.clear_all().await.unwrap(), 3);
        assert_eq!(audience_ledger.cached_votes(), 0);
        assert!(!audience_ledger.has_voted("reel-1").await);
        assert_eq!(audience_ledger.get_reel_stats("reel-1").await, ReelStats::default());
    }

    #[tokio::test]
    async fn test_save_vote_broadcasts() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let identity = registered(&store).await;
        let voter_id = identity.voter_id().unwrap();
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let channel = RealtimeChannel::connect(fabric.clone());
        let results = RealtimeChannel::connect(fabric.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        results.on(EventKind::Vote, move |event| sink.lock().unwrap().push(event.clone()));

        let ledger = VoteLedger::new(store, identity, Some(channel));
        ledger
            .save_vote("reel-3", 9, VoterType::Audience, None, None)
            .await
            .unwrap();

        wait_until(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(
            seen.lock().unwrap()[0],
            LiveEvent::Vote(VoteEvent {
                reel_id: "reel-3".to_string(),
                score: 9,
                voter_type: VoterType::Audience,
                voter_id,
            })
        );
    }
}
