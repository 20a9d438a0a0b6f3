//! Access control. A device earns the right to vote either by redeeming a one-time token or by
//! signing in through an external identity provider; both paths end with a registered voter.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::identity::{keys, lock, IdentityStore, VoterProfile};
use crate::model::{ExternalIdentity, Token, Voter, VoterType};
use crate::store::Store;
use crate::{
    attach_voter_to_token, claim_token, find_token, find_voter_by_email, get_voter,
    link_voter_identity,
};

/// A redeemed token and the voter it registered.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSession {
    pub token: Token,
    pub voter: Voter,
}

pub struct TokenAuth {
    store: Store,
    identity: Arc<IdentityStore>,
    lookup_timeout: Duration,
    session: Mutex<Option<Token>>,
}

impl TokenAuth {
    pub fn new(store: Store, identity: Arc<IdentityStore>, lookup_timeout: Duration) -> Self {
        Self {
            store,
            identity,
            lookup_timeout,
            session: Mutex::new(None),
        }
    }

    /// Tokens are compared trimmed and upper-cased.
    pub fn normalize(token: &str) -> String {
        token.trim().to_uppercase()
    }

    /// Redeems `token` for this device.
    ///
    /// An unbound token is bound with a conditional update that only succeeds while no device owns
    /// it, so of two devices racing for the same token exactly one wins; the other is told the
    /// token is used elsewhere. Redeeming again from the winning device is a plain session
    /// restore.
    pub async fn validate_token(&self, token: &str) -> Result<TokenSession> {
        let code = Self::normalize(token);
        if code.is_empty() {
            return Err(AppError::EmptyToken);
        }
        let device_id = self.identity.get_or_create_device_id()?;

        let lookup = {
            let code = code.clone();
            self.store.run(move |conn| find_token(conn, &code))
        };
        let found = match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(found) => found?,
            Err(_) => {
                warn!("Token lookup for {code} timed out after {:?}", self.lookup_timeout);
                return Err(AppError::TokenLookupTimeout);
            }
        };
        let Some(mut token) = found else {
            info!("Rejected unknown token {code}");
            return Err(AppError::InvalidToken);
        };

        match token.device_id.as_deref() {
            Some(bound) if bound != device_id => {
                info!("Token {code} is bound to another device");
                return Err(AppError::TokenBoundElsewhere);
            }
            Some(_) => debug!("Token {code} already bound to this device"),
            None => {
                let (token_id, device) = (token.id, device_id.clone());
                let claimed = self
                    .store
                    .run(move |conn| claim_token(conn, token_id, &device))
                    .await?;
                let code = code.clone();
                let current = self
                    .store
                    .run(move |conn| find_token(conn, &code))
                    .await?
                    .ok_or(AppError::InvalidToken)?;
                if current.device_id.as_deref() != Some(device_id.as_str()) {
                    info!("Lost the race for token {}", current.token);
                    return Err(AppError::TokenBoundElsewhere);
                }
                if claimed {
                    info!("Bound token {} to {device_id}", current.token);
                }
                token = current;
            }
        }

        let is_judge = token.token_type.is_judge();
        let voter = self
            .identity
            .register(
                &self.store,
                VoterProfile {
                    is_judge,
                    judge_name: is_judge.then(|| token.person_name.clone()),
                    name: Some(token.person_name.clone()),
                    token_id: Some(token.id),
                },
            )
            .await?;

        if token.voter_id != Some(voter.id) {
            let (token_id, voter_id) = (token.id, voter.id);
            match self
                .store
                .run(move |conn| attach_voter_to_token(conn, token_id, voter_id))
                .await
            {
                Ok(_) => token.voter_id = Some(voter.id),
                Err(e) => warn!("Failed to link voter {} to token {}: {e}", voter.id, token.id),
            }
        }

        self.persist(&token);
        *lock(&self.session) = Some(token.clone());
        Ok(TokenSession { token, voter })
    }

    fn persist(&self, token: &Token) {
        let storage = self.identity.storage();
        let saved = serde_json::to_string(token)
            .map_err(AppError::from)
            .and_then(|snapshot| {
                storage.set(keys::TOKEN, &token.token)?;
                storage.set(keys::TOKEN_DATA, &snapshot)
            });
        if let Err(e) = saved {
            warn!("Failed to save token session: {e}");
        }
    }

    /// Silently re-validates a saved token. Returns whether a session is active afterwards. A
    /// saved token that is now invalid or bound elsewhere is forgotten.
    pub async fn restore_session(&self) -> bool {
        let Some(saved) = self.identity.storage().get(keys::TOKEN) else {
            return false;
        };
        match self.validate_token(&saved).await {
            Ok(session) => {
                info!("Restored token session for {}", session.token.person_name);
                true
            }
            Err(e @ (AppError::InvalidToken | AppError::TokenBoundElsewhere)) => {
                warn!("Saved token {saved} is no longer usable: {e}");
                if let Err(e) = self.logout() {
                    warn!("Failed to forget saved token: {e}");
                }
                false
            }
            Err(e) => {
                warn!("Could not restore token session: {e}");
                false
            }
        }
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.session).is_some()
    }

    pub fn token_data(&self) -> Option<Token> {
        lock(&self.session).clone()
    }

    pub fn person_name(&self) -> Option<String> {
        lock(&self.session).as_ref().map(|t| t.person_name.clone())
    }

    pub fn category(&self) -> Option<String> {
        lock(&self.session).as_ref().and_then(|t| t.category.clone())
    }

    pub fn token_type(&self) -> Option<VoterType> {
        lock(&self.session).as_ref().map(|t| t.token_type)
    }

    /// Ends the session and forgets the saved token. The device stays registered.
    pub fn logout(&self) -> Result<()> {
        *lock(&self.session) = None;
        let storage = self.identity.storage();
        storage.remove(keys::TOKEN)?;
        storage.remove(keys::TOKEN_DATA)
    }
}

/// What happened to the email of a signed-in identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailLink {
    Linked,
    AlreadyLinked,
    /// The email belongs to another voter. The sign-in still succeeds.
    Conflict,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignIn {
    pub voter: Voter,
    pub email: EmailLink,
}

pub struct IdentitySignIn {
    store: Store,
    identity: Arc<IdentityStore>,
}

impl IdentitySignIn {
    pub fn new(store: Store, identity: Arc<IdentityStore>) -> Self {
        Self { store, identity }
    }

    /// Accepts a verified external identity: makes sure this device has a voter, then links the
    /// email onto it. Only a failed registration is an error; email linking is best-effort.
    pub async fn sign_in(&self, external: &ExternalIdentity) -> Result<SignIn> {
        let voter = self.ensure_voter().await?;

        let email = if voter.email.as_deref() == Some(external.email.as_str()) {
            debug!("Email {} already linked to voter {}", external.email, voter.id);
            EmailLink::AlreadyLinked
        } else {
            let (voter_id, linked_identity) = (voter.id, external.clone());
            match self
                .store
                .run(move |conn| link_voter_identity(conn, voter_id, &linked_identity))
                .await
            {
                Ok(_) => {
                    info!("Linked {} to voter {}", external.email, voter.id);
                    EmailLink::Linked
                }
                Err(AppError::Store(diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ))) => {
                    warn!(
                        "{}; continuing with voter {}",
                        AppError::LinkConflict(external.email.clone()),
                        voter.id
                    );
                    EmailLink::Conflict
                }
                Err(e) => {
                    error!("Failed to link {} to voter {}: {e}", external.email, voter.id);
                    EmailLink::Failed
                }
            }
        };

        let voter = match email {
            EmailLink::Linked => self.reload(voter).await,
            _ => voter,
        };
        self.persist(external);
        Ok(SignIn { voter, email })
    }

    async fn ensure_voter(&self) -> Result<Voter> {
        if let Some(voter_id) = self.identity.voter_id() {
            match self.store.run(move |conn| get_voter(conn, voter_id)).await {
                Ok(Some(voter)) => return Ok(voter),
                Ok(None) => info!("Voter {voter_id} is gone, registering again"),
                Err(e) => return Err(AppError::RegistrationFailed(e.to_string())),
            }
        }
        self.identity
            .register(&self.store, VoterProfile::default())
            .await
    }

    async fn reload(&self, voter: Voter) -> Voter {
        let voter_id = voter.id;
        match self.store.run(move |conn| get_voter(conn, voter_id)).await {
            Ok(Some(fresh)) => fresh,
            _ => voter,
        }
    }

    fn persist(&self, external: &ExternalIdentity) {
        let saved = serde_json::to_string(external)
            .map_err(AppError::from)
            .and_then(|json| self.identity.storage().set(keys::IDENTITY_SESSION, &json));
        if let Err(e) = saved {
            warn!("Failed to save identity session: {e}");
        }
    }

    /// Replays a saved identity session, if there is one.
    pub async fn restore_identity_session(&self) -> Option<SignIn> {
        let saved = self.identity.storage().get(keys::IDENTITY_SESSION)?;
        let external: ExternalIdentity = match serde_json::from_str(&saved) {
            Ok(external) => external,
            Err(e) => {
                warn!("Ignoring unreadable identity session: {e}");
                return None;
            }
        };
        match self.sign_in(&external).await {
            Ok(signed_in) => Some(signed_in),
            Err(e) => {
                warn!("Could not restore identity session for {}: {e}", external.email);
                None
            }
        }
    }

    /// Adopts the voter already linked to `email`, e.g. on a new browser. Returns `None` when no
    /// voter has that email.
    pub async fn recover_from_email(&self, email: &str) -> Result<Option<Voter>> {
        let address = email.to_string();
        let found = self
            .store
            .run(move |conn| find_voter_by_email(conn, &address))
            .await?;
        match found {
            Some(voter) => {
                self.identity.set_voter_id(voter.id)?;
                info!("Recovered voter {} from {email}", voter.id);
                Ok(Some(voter))
            }
            None => {
                info!("No voter found with email {email}");
                Ok(None)
            }
        }
    }

    pub fn sign_out(&self) -> Result<()> {
        self.identity.storage().remove(keys::IDENTITY_SESSION)
    }
}

#[cfg(all(test, feature = "ssr"))]
mod tests {
    use super::*;
    use crate::identity::{LocalStore, MemoryStore};
    use crate::model::DeviceType;
    use crate::scoring::ScoringPolicy;
    use crate::create_token;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn device() -> Arc<IdentityStore> {
        Arc::new(IdentityStore::new(
            Arc::new(MemoryStore::new()),
            DeviceType::Mobile,
        ))
    }

    async fn issue(store: &Store, code: &str, token_type: VoterType) -> Token {
        let code = code.to_string();
        store
            .run(move |conn| create_token(conn, &code, token_type, "Grace", Some("Drama")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_redeem_judge_token() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        issue(&store, "JUDGE1", VoterType::Judge).await;
        let identity = device();
        let auth = TokenAuth::new(store.clone(), identity.clone(), TIMEOUT);
        assert!(!auth.is_authenticated());

        let session = auth.validate_token("  judge1 ").await.unwrap();
        assert!(session.voter.is_judge);
        assert_eq!(session.voter.judge_name.as_deref(), Some("Grace"));
        assert_eq!(session.voter.token_id, Some(session.token.id));
        assert_eq!(session.token.voter_id, Some(session.voter.id));
        assert!(session.token.is_used);
        assert_eq!(identity.voter_id(), Some(session.voter.id));

        assert!(auth.is_authenticated());
        assert_eq!(auth.person_name().as_deref(), Some("Grace"));
        assert_eq!(auth.category().as_deref(), Some("Drama"));
        assert_eq!(auth.token_type(), Some(VoterType::Judge));
        assert_eq!(identity.storage().get(keys::TOKEN).as_deref(), Some("JUDGE1"));
        assert!(identity.storage().get(keys::TOKEN_DATA).is_some());
    }

    #[tokio::test]
    async fn test_rejects_empty_and_unknown_tokens() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let auth = TokenAuth::new(store, device(), TIMEOUT);
        assert!(matches!(auth.validate_token("   ").await, Err(AppError::EmptyToken)));
        let err = auth.validate_token("NOPE").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken));
        assert_eq!(err.to_string(), "Invalid token");
    }

    #[tokio::test]
    async fn test_same_device_redeems_idempotently() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        issue(&store, "AUD1", VoterType::Audience).await;
        let auth = TokenAuth::new(store, device(), TIMEOUT);

        let first = auth.validate_token("AUD1").await.unwrap();
        let second = auth.validate_token("aud1").await.unwrap();
        assert_eq!(first.voter.id, second.voter.id);
        assert_eq!(first.token.device_id, second.token.device_id);
    }

    #[tokio::test]
    async fn test_other_device_is_rejected() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        issue(&store, "AUD2", VoterType::Audience).await;
        let first = TokenAuth::new(store.clone(), device(), TIMEOUT);
        let second = TokenAuth::new(store.clone(), device(), TIMEOUT);

        first.validate_token("AUD2").await.unwrap();
        let err = second.validate_token("AUD2").await.unwrap_err();
        assert!(matches!(err, AppError::TokenBoundElsewhere));
        assert_eq!(err.to_string(), "Token already used on another device");
        assert!(!second.is_authenticated());
    }

    #[tokio::test]
    async fn test_concurrent_redemption_has_one_winner() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        issue(&store, "RACE", VoterType::Audience).await;
        let d1 = TokenAuth::new(store.clone(), device(), TIMEOUT);
        let d2 = TokenAuth::new(store.clone(), device(), TIMEOUT);

        let (r1, r2) = tokio::join!(d1.validate_token("RACE"), d2.validate_token("RACE"));
        let outcomes = [r1, r2];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(AppError::TokenBoundElsewhere))));
    }

    #[tokio::test]
    async fn test_lookup_times_out() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let auth = TokenAuth::new(store.clone(), device(), Duration::from_millis(50));
        // Hold the only connection so the lookup cannot start.
        let busy = store.pool().get().unwrap();
        let err = auth.validate_token("SLOW").await.unwrap_err();
        assert!(matches!(err, AppError::TokenLookupTimeout));
        assert_eq!(err.to_string(), "Request timed out");
        drop(busy);
    }

    #[tokio::test]
    async fn test_restore_and_logout() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        issue(&store, "KEEP", VoterType::Audience).await;
        let storage: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let identity = Arc::new(IdentityStore::new(storage.clone(), DeviceType::Desktop));
        TokenAuth::new(store.clone(), identity, TIMEOUT)
            .validate_token("KEEP")
            .await
            .unwrap();

        // A reload: same storage, fresh objects.
        let identity = Arc::new(IdentityStore::new(storage.clone(), DeviceType::Desktop));
        let auth = TokenAuth::new(store.clone(), identity, TIMEOUT);
        assert!(!auth.is_authenticated());
        assert!(auth.restore_session().await);
        assert_eq!(auth.person_name().as_deref(), Some("Grace"));

        auth.logout().unwrap();
        assert!(!auth.is_authenticated());
        assert!(storage.get(keys::TOKEN).is_none());
        assert!(!auth.restore_session().await);
    }

    #[tokio::test]
    async fn test_sign_in_links_email_once() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let identity = device();
        let sign_in = IdentitySignIn::new(store.clone(), identity.clone());
        let external = ExternalIdentity {
            user_id: "auth-1".to_string(),
            email: "ada@example.com".to_string(),
            email_verified: true,
        };

        let first = sign_in.sign_in(&external).await.unwrap();
        assert_eq!(first.email, EmailLink::Linked);
        assert_eq!(first.voter.email.as_deref(), Some("ada@example.com"));
        assert_eq!(identity.voter_id(), Some(first.voter.id));

        let second = sign_in.sign_in(&external).await.unwrap();
        assert_eq!(second.email, EmailLink::AlreadyLinked);
        assert_eq!(second.voter.id, first.voter.id);

        let restored = sign_in.restore_identity_session().await.unwrap();
        assert_eq!(restored.voter.id, first.voter.id);
    }

    #[tokio::test]
    async fn test_email_conflict_is_not_fatal() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let external = ExternalIdentity {
            user_id: "auth-2".to_string(),
            email: "lin@example.com".to_string(),
            email_verified: true,
        };
        let first_device = IdentitySignIn::new(store.clone(), device());
        first_device.sign_in(&external).await.unwrap();

        let identity = device();
        let second_device = IdentitySignIn::new(store.clone(), identity.clone());
        let outcome = second_device.sign_in(&external).await.unwrap();
        assert_eq!(outcome.email, EmailLink::Conflict);
        assert!(outcome.voter.email.is_none());
        // The device can still vote.
        assert_eq!(identity.voter_id(), Some(outcome.voter.id));
    }

    #[tokio::test]
    async fn test_recover_from_email() {
        let store = Store::in_memory(ScoringPolicy::default()).unwrap();
        let external = ExternalIdentity {
            user_id: "auth-3".to_string(),
            email: "mo@example.com".to_string(),
            email_verified: false,
        };
        let original = IdentitySignIn::new(store.clone(), device())
            .sign_in(&external)
            .await
            .unwrap();

        let identity = device();
        let recovery = IdentitySignIn::new(store.clone(), identity.clone());
        assert!(recovery
            .recover_from_email("nobody@example.com")
            .await
            .unwrap()
            .is_none());
        let recovered = recovery
            .recover_from_email("mo@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recovered.id, original.voter.id);
        assert_eq!(identity.voter_id(), Some(original.voter.id));

        let voter_id = recovered.id;
        let row = store
            .run(move |conn| get_voter(conn, voter_id))
            .await
            .unwrap()
            .unwrap();
        assert!(!row.email_verified);
    }
}
