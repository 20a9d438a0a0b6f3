//! Durable per-client identity.
//!
//! A client owns one device id for its whole life and, once registered, the voter id the store
//! assigned to that device. Both live in a small persisted key/value store so they survive restarts.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::model::{DeviceType, Voter, VoterRegistration};
use crate::store::Store;
use crate::upsert_voter;

/// Keys of the client's durable session.
pub mod keys {
    pub const DEVICE_ID: &str = "reel-vote-device-id";
    pub const VOTER_ID: &str = "reel-vote-voter-id";
    pub const TOKEN: &str = "reel-vote-token";
    pub const TOKEN_DATA: &str = "reel-vote-token-data";
    pub const IDENTITY_SESSION: &str = "reel-vote-identity-session";
}

/// Plain string key/value storage that outlives the process.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A JSON object on disk, rewritten on every change.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            BTreeMap::new()
        };
        debug!("Opened client state at {} ({} keys)", path.display(), entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// Who the device registers as. Everything else in the voter row comes from the device itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoterProfile {
    pub is_judge: bool,
    pub judge_name: Option<String>,
    pub name: Option<String>,
    pub token_id: Option<i32>,
}

pub struct IdentityStore {
    storage: Arc<dyn LocalStore>,
    device_type: DeviceType,
    device_id: Mutex<Option<String>>,
    voter_id: Mutex<Option<i32>>,
}

impl IdentityStore {
    pub fn new(storage: Arc<dyn LocalStore>, device_type: DeviceType) -> Self {
        Self {
            storage,
            device_type,
            device_id: Mutex::new(None),
            voter_id: Mutex::new(None),
        }
    }

    pub fn storage(&self) -> &Arc<dyn LocalStore> {
        &self.storage
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Returns the persisted device id, generating and saving `device-<uuid v4>` the first time.
    pub fn get_or_create_device_id(&self) -> Result<String> {
        let mut cached = lock(&self.device_id);
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let id = match self.storage.get(keys::DEVICE_ID) {
            Some(id) => id,
            None => {
                let id = format!("device-{}", Uuid::new_v4());
                self.storage.set(keys::DEVICE_ID, &id)?;
                info!("Created device id {id}");
                id
            }
        };
        *cached = Some(id.clone());
        Ok(id)
    }

    /// The cached voter id, falling back to the persisted one.
    pub fn voter_id(&self) -> Option<i32> {
        let mut cached = lock(&self.voter_id);
        if cached.is_none() {
            *cached = self
                .storage
                .get(keys::VOTER_ID)
                .and_then(|raw| raw.parse().ok());
        }
        *cached
    }

    pub fn set_voter_id(&self, voter_id: i32) -> Result<()> {
        self.storage.set(keys::VOTER_ID, &voter_id.to_string())?;
        *lock(&self.voter_id) = Some(voter_id);
        Ok(())
    }

    pub fn clear_voter_id(&self) -> Result<()> {
        self.storage.remove(keys::VOTER_ID)?;
        *lock(&self.voter_id) = None;
        Ok(())
    }

    /// Upserts the voter row of this device and remembers its id. Any failure here leaves the
    /// client unable to vote, so it is reported as `RegistrationFailed`.
    pub async fn register(&self, store: &Store, profile: VoterProfile) -> Result<Voter> {
        let device_id = self
            .get_or_create_device_id()
            .map_err(|e| AppError::RegistrationFailed(e.to_string()))?;
        let registration = VoterRegistration {
            device_id: device_id.clone(),
            device_type: self.device_type,
            is_judge: profile.is_judge,
            judge_name: profile.judge_name,
            name: profile.name,
            token_id: profile.token_id,
        };

        let voter = store
            .run(move |conn| upsert_voter(conn, &registration))
            .await
            .map_err(|e| {
                error!("Failed to register device {device_id}: {e}");
                AppError::RegistrationFailed(e.to_string())
            })?;
        self.set_voter_id(voter.id)
            .map_err(|e| AppError::RegistrationFailed(e.to_string()))?;
        info!("Device {} registered as voter {}", voter.device_id, voter.id);
        Ok(voter)
    }
}

#[cfg(all(test, feature = "ssr"))]
mod tests {
    use super::*;
    use crate::scoring::ScoringPolicy;

    #[test]
    fn test_device_id_is_stable() {
        let identity = IdentityStore::new(Arc::new(MemoryStore::new()), DeviceType::Desktop);
        let first = identity.get_or_create_device_id().unwrap();
        let second = identity.get_or_create_device_id().unwrap();
        assert_eq!(first, second);

        let uuid = first.strip_prefix("device-").expect("device- prefix");
        let parsed = Uuid::parse_str(uuid).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn test_device_id_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");

        let first = {
            let storage = Arc::new(FileStore::open(&path).unwrap());
            IdentityStore::new(storage, DeviceType::Mobile)
                .get_or_create_device_id()
                .unwrap()
        };

        let storage = Arc::new(FileStore::open(&path).unwrap());
        let identity = IdentityStore::new(storage, DeviceType::Mobile);
        assert_eq!(identity.get_or_create_device_id().unwrap(), first);
    }

    #[test]
    fn test_voter_id_falls_back_to_storage() {
        let storage: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        assert!(IdentityStore::new(storage.clone(), DeviceType::Desktop)
            .voter_id()
            .is_none());

        IdentityStore::new(storage.clone(), DeviceType::Desktop)
            .set_voter_id(42)
            .unwrap();
        let reloaded = IdentityStore::new(storage.clone(), DeviceType::Desktop);
        assert_eq!(reloaded.voter_id(), Some(42));

        reloaded.clear_voter_id().unwrap();
        assert!(reloaded.voter_id().is_none());
        assert!(storage.get(keys::VOTER_ID).is_none());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(FileStore::open(&path), Err(AppError::Storage(_))));
    }

    #[tokio::test]
    async fn test_register_reuses_voter_row() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let identity = IdentityStore::new(Arc::new(MemoryStore::new()), DeviceType::Tablet);

        let first = identity.register(&store, VoterProfile::default()).await.unwrap();
        assert_eq!(identity.voter_id(), Some(first.id));
        assert_eq!(first.device_type, DeviceType::Tablet);

        let second = identity
            .register(
                &store,
                VoterProfile {
                    name: Some("Mo".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.name.as_deref(), Some("Mo"));
    }
}
