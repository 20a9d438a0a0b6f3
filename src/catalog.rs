use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::get_active_reels;
use crate::live_state::LiveState;
use crate::model::Reel;
use crate::store::Store;

/// The event's reel list, ordered by category and then by reel number. The same catalog serves
/// every dataset; only where it is loaded from differs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReelCatalog {
    reels: Vec<Reel>,
}

impl ReelCatalog {
    pub fn new(mut reels: Vec<Reel>) -> Self {
        reels.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then_with(|| a.number.cmp(&b.number))
        });
        Self { reels }
    }

    /// Loads the active reels from the store.
    pub async fn load(store: &Store) -> Result<Self> {
        let reels = store.run(get_active_reels).await?;
        info!("Loaded {} reels from the store", reels.len());
        Ok(Self::new(reels))
    }

    /// Parses a JSON array of reels (`id`, `number`, `contestant`, `category`, `duration`,
    /// `thumbnail`, `videoUrl`).
    pub fn from_json(raw: &str) -> Result<Self> {
        let reels: Vec<Reel> = serde_json::from_str(raw)?;
        Ok(Self::new(reels))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let catalog = Self::from_json(&fs::read_to_string(path)?)?;
        info!("Loaded {} reels from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    pub fn reels(&self) -> &[Reel] {
        &self.reels
    }

    pub fn len(&self) -> usize {
        self.reels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reels.is_empty()
    }

    /// Distinct categories in catalog order.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = Vec::new();
        for reel in &self.reels {
            if categories.last() != Some(&reel.category) {
                categories.push(reel.category.clone());
            }
        }
        categories
    }

    pub fn in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a Reel> + 'a {
        self.reels.iter().filter(move |reel| reel.category == category)
    }

    pub fn find(&self, reel_id: &str) -> Option<&Reel> {
        self.reels.iter().find(|reel| reel.id == reel_id)
    }

    pub fn position(&self, reel_id: &str) -> Option<usize> {
        self.reels.iter().position(|reel| reel.id == reel_id)
    }

    pub fn first(&self) -> Option<&Reel> {
        self.reels.first()
    }

    /// The reel the live state points at, or the first reel when it points nowhere we know.
    pub fn current_reel(&self, live: &LiveState) -> Option<&Reel> {
        live.reel_id
            .as_deref()
            .and_then(|id| self.find(id))
            .or_else(|| self.first())
    }
}

#[cfg(all(test, feature = "ssr"))]
mod tests {
    use super::*;
    use crate::scoring::ScoringPolicy;
    use crate::upsert_reel;

    const DATASET: &str = r#"[
        {"id": "d-2", "number": 2, "contestant": "Bo", "category": "Drama",
         "duration": 95, "thumbnail": "🎭", "videoUrl": "https://cdn.example/d-2.mp4"},
        {"id": "c-1", "number": 1, "contestant": "Cy", "category": "Comedy",
         "duration": 60, "thumbnail": "😂", "videoUrl": "https://cdn.example/c-1.mp4"},
        {"id": "d-1", "number": 1, "contestant": "Al", "category": "Drama",
         "duration": 120, "thumbnail": "🎭", "videoUrl": "https://cdn.example/d-1.mp4"}
    ]"#;

    #[test]
    fn test_from_json_orders_and_groups() {
        let catalog = ReelCatalog::from_json(DATASET).unwrap();
        let ids: Vec<&str> = catalog.reels().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c-1", "d-1", "d-2"]);
        assert_eq!(catalog.categories(), vec!["Comedy", "Drama"]);
        assert_eq!(catalog.in_category("Drama").count(), 2);
        assert_eq!(catalog.position("d-2"), Some(2));
        assert_eq!(catalog.find("d-1").map(|r| r.duration), Some(120));
        assert_eq!(
            catalog.find("c-1").map(|r| r.video_url.as_str()),
            Some("https://cdn.example/c-1.mp4")
        );
    }

    #[test]
    fn test_current_reel_falls_back_to_first() {
        let catalog = ReelCatalog::from_json(DATASET).unwrap();
        let mut live = LiveState::default();
        assert_eq!(catalog.current_reel(&live).map(|r| r.id.as_str()), Some("c-1"));

        live.reel_id = Some("d-2".to_string());
        assert_eq!(catalog.current_reel(&live).map(|r| r.id.as_str()), Some("d-2"));

        live.reel_id = Some("missing".to_string());
        assert_eq!(catalog.current_reel(&live).map(|r| r.id.as_str()), Some("c-1"));

        assert!(ReelCatalog::default().current_reel(&live).is_none());
    }

    #[test]
    fn test_from_file_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reels.json");
        fs::write(&path, "[{\"id\": 1}]").unwrap();
        assert!(ReelCatalog::from_file(&path).is_err());
        assert!(ReelCatalog::from_file(dir.path().join("absent.json")).is_err());
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let dataset = ReelCatalog::from_json(DATASET).unwrap();
        let reels = dataset.reels().to_vec();
        store
            .run(move |conn| {
                for reel in &reels {
                    upsert_reel(conn, reel)?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let loaded = ReelCatalog::load(&store).await.unwrap();
        assert_eq!(loaded, dataset);
    }
}
