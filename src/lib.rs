pub mod app;
pub mod model;
#[cfg(feature = "ssr")]
pub mod schema;

#[cfg(feature = "ssr")]
pub mod access;
#[cfg(feature = "ssr")]
pub mod catalog;
#[cfg(feature = "ssr")]
pub mod config;
#[cfg(feature = "ssr")]
pub mod context;
#[cfg(feature = "ssr")]
pub mod error;
#[cfg(feature = "ssr")]
pub mod fabric;
#[cfg(feature = "ssr")]
pub mod identity;
#[cfg(feature = "ssr")]
pub mod ledger;
#[cfg(feature = "ssr")]
pub mod live_state;
#[cfg(feature = "ssr")]
pub mod realtime;
#[cfg(feature = "ssr")]
pub mod scoring;
#[cfg(feature = "ssr")]
pub mod store;

#[cfg(all(test, feature = "ssr"))]
pub(crate) mod test_support;

#[cfg(feature = "ssr")]
use chrono::Utc;
#[cfg(feature = "ssr")]
use diesel::connection::SimpleConnection;
#[cfg(feature = "ssr")]
use diesel::prelude::*;
#[cfg(feature = "ssr")]
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
#[cfg(feature = "ssr")]
use diesel::SqliteConnection;
#[cfg(feature = "ssr")]
use rand::prelude::*;

#[cfg(feature = "ssr")]
use crate::config::Config;
#[cfg(feature = "ssr")]
use crate::error::AppError;
#[cfg(feature = "ssr")]
use crate::model::{
    ExternalIdentity, NewToken, NewVote, NewVoter, Reel, ReelAggregate, Token, Vote,
    VoteRefresh, VoteSubmission, Voter, VoterRefresh, VoterRegistration, VoterType,
};
#[cfg(feature = "ssr")]
use crate::schema::{reels, tokens, vote_aggregates, voters, votes};
#[cfg(feature = "ssr")]
use crate::scoring::ScoringPolicy;

#[cfg(feature = "ssr")]
pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

#[cfg(feature = "ssr")]
const SCHEMA_SQL: &str = include_str!("../migrations/2026-01-10-000000_create_voting/up.sql");

#[cfg(feature = "hydrate")]
#[wasm_bindgen::prelude::wasm_bindgen]
pub fn hydrate() {
    use crate::app::*;
    console_error_panic_hook::set_once();
    leptos::mount::hydrate_body(App);
}

/// Enables foreign keys, WAL mode to allow concurrent reads during writes, and a timeout to retry
/// locked operations.
#[cfg(feature = "ssr")]
pub fn configure_connection(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    conn.batch_execute(
        "PRAGMA foreign_keys = ON; \
        PRAGMA journal_mode = WAL; \
        PRAGMA synchronous = NORMAL; \
        PRAGMA busy_timeout = 10000;",
    )
}

/// Renders the triggers that keep `vote_aggregates` in step with `votes`. Every change to a reel's
/// votes recomputes that reel's row from scratch; a reel left without votes loses its row.
/// Inside a trigger the outer statement's conflict clause overrides `INSERT OR REPLACE`, so the
/// refresh deletes and re-inserts.
#[cfg(feature = "ssr")]
pub fn aggregate_triggers_sql(policy: &ScoringPolicy) -> String {
    let final_score = policy.final_score_sql();
    let refresh = |row: &str| {
        format!(
            "DELETE FROM vote_aggregates WHERE reel_id = {row}.reel_id; \
             INSERT INTO vote_aggregates \
                (reel_id, audience_count, judge_count, audience_average, judge_average, final_score, updated_at) \
             SELECT reel_id, ac, jc, aa, ja, {final_score}, CURRENT_TIMESTAMP FROM ( \
                SELECT {row}.reel_id AS reel_id, \
                    COUNT(CASE WHEN voter_type = 'audience' THEN 1 END) AS ac, \
                    COUNT(CASE WHEN voter_type = 'judge' THEN 1 END) AS jc, \
                    COALESCE(AVG(CASE WHEN voter_type = 'audience' THEN score END), 0.0) AS aa, \
                    COALESCE(AVG(CASE WHEN voter_type = 'judge' THEN score END), 0.0) AS ja \
                FROM votes WHERE reel_id = {row}.reel_id \
             ) WHERE ac + jc > 0;"
        )
    };

    format!(
        "DROP TRIGGER IF EXISTS votes_aggregate_after_insert; \
         DROP TRIGGER IF EXISTS votes_aggregate_after_update; \
         DROP TRIGGER IF EXISTS votes_aggregate_after_delete; \
         CREATE TRIGGER votes_aggregate_after_insert AFTER INSERT ON votes BEGIN {} END; \
         CREATE TRIGGER votes_aggregate_after_update AFTER UPDATE ON votes BEGIN {} {} END; \
         CREATE TRIGGER votes_aggregate_after_delete AFTER DELETE ON votes BEGIN {} END;",
        refresh("NEW"),
        // A vote moved to another reel must also refresh the reel it left.
        refresh("OLD"),
        refresh("NEW"),
        refresh("OLD"),
    )
}

/// Creates any missing tables and (re)installs the aggregate triggers for `policy`.
#[cfg(feature = "ssr")]
pub fn install_schema(
    conn: &mut SqliteConnection,
    policy: &ScoringPolicy,
) -> Result<(), diesel::result::Error> {
    conn.batch_execute(SCHEMA_SQL)?;
    conn.batch_execute(&aggregate_triggers_sql(policy))
}

#[cfg(feature = "ssr")]
pub fn establish_connection(config: &Config) -> Result<SqliteConnection, AppError> {
    let mut conn = SqliteConnection::establish(&config.database_url)
        .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
    configure_connection(&mut conn)?;
    install_schema(&mut conn, &config.scoring_policy)?;
    Ok(conn)
}

/// Prepares every pooled connection the same way `establish_connection` does.
#[cfg(feature = "ssr")]
#[derive(Debug)]
struct ConnectionSetup {
    policy: ScoringPolicy,
}

#[cfg(feature = "ssr")]
impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionSetup {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        configure_connection(conn)
            .and_then(|_| install_schema(conn, &self.policy))
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

#[cfg(feature = "ssr")]
pub fn build_pool(
    database_url: &str,
    pool_size: u32,
    policy: ScoringPolicy,
) -> Result<DbPool, AppError> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let builder = Pool::builder().connection_customizer(Box::new(ConnectionSetup { policy }));
    // Every in-memory connection is its own database, so keep exactly one alive forever.
    let builder = if database_url == ":memory:" {
        builder.max_size(1).idle_timeout(None).max_lifetime(None)
    } else {
        builder.max_size(pool_size)
    };
    builder.build(manager).map_err(AppError::from)
}

/// Fetches the active reels, ordered by category and then by reel number.
#[cfg(feature = "ssr")]
pub fn get_active_reels(conn: &mut SqliteConnection) -> Result<Vec<Reel>, diesel::result::Error> {
    reels::table
        .filter(reels::is_active.eq(true))
        .order((reels::category.asc(), reels::reel_number.asc()))
        .select(Reel::as_select())
        .load(conn)
}

/// Inserts a reel, or overwrites the reference data of an existing reel with the same id.
#[cfg(feature = "ssr")]
pub fn upsert_reel(conn: &mut SqliteConnection, reel: &Reel) -> Result<(), diesel::result::Error> {
    diesel::insert_into(reels::table)
        .values(reel)
        .on_conflict(reels::id)
        .do_update()
        .set(reel)
        .execute(conn)?;
    Ok(())
}

/// Registers a device as a voter, or refreshes the existing voter row of that device. The
/// device id is the conflict key, so one device never maps to more than one voter.
#[cfg(feature = "ssr")]
pub fn upsert_voter(
    conn: &mut SqliteConnection,
    registration: &VoterRegistration,
) -> Result<Voter, diesel::result::Error> {
    let now = Utc::now().naive_utc();
    let new_voter = NewVoter {
        device_id: &registration.device_id,
        device_type: registration.device_type,
        is_judge: registration.is_judge,
        judge_name: registration.judge_name.as_deref(),
        name: registration.name.as_deref(),
        token_id: registration.token_id,
        last_seen_at: now,
    };
    let refresh = VoterRefresh {
        device_type: registration.device_type,
        is_judge: registration.is_judge,
        judge_name: Some(registration.judge_name.as_deref()),
        name: registration.name.as_deref(),
        token_id: registration.token_id,
        last_seen_at: now,
    };

    diesel::insert_into(voters::table)
        .values(&new_voter)
        .on_conflict(voters::device_id)
        .do_update()
        .set(&refresh)
        .returning(Voter::as_returning())
        .get_result(conn)
}

#[cfg(feature = "ssr")]
pub fn get_voter(
    conn: &mut SqliteConnection,
    voter_id: i32,
) -> Result<Option<Voter>, diesel::result::Error> {
    voters::table
        .filter(voters::id.eq(voter_id))
        .select(Voter::as_select())
        .first(conn)
        .optional()
}

#[cfg(feature = "ssr")]
pub fn find_voter_by_email(
    conn: &mut SqliteConnection,
    email: &str,
) -> Result<Option<Voter>, diesel::result::Error> {
    voters::table
        .filter(voters::email.eq(email))
        .select(Voter::as_select())
        .first(conn)
        .optional()
}

/// Links an external identity onto a voter. Fails with a unique violation when the email already
/// belongs to another voter.
#[cfg(feature = "ssr")]
pub fn link_voter_identity(
    conn: &mut SqliteConnection,
    voter_id: i32,
    identity: &ExternalIdentity,
) -> Result<Voter, diesel::result::Error> {
    diesel::update(voters::table.filter(voters::id.eq(voter_id)))
        .set((
            voters::email.eq(identity.email.as_str()),
            voters::email_verified.eq(identity.email_verified),
            voters::auth_user_id.eq(identity.user_id.as_str()),
            voters::last_seen_at.eq(Utc::now().naive_utc()),
        ))
        .returning(Voter::as_returning())
        .get_result(conn)
}

/// Looks a token up by its normalized (trimmed, upper-case) string.
#[cfg(feature = "ssr")]
pub fn find_token(
    conn: &mut SqliteConnection,
    token: &str,
) -> Result<Option<Token>, diesel::result::Error> {
    tokens::table
        .filter(tokens::token.eq(token))
        .select(Token::as_select())
        .first(conn)
        .optional()
}

/// Binds an unbound token to a device. The update only matches while `device_id` is still NULL,
/// so when two devices race for the same token exactly one of them gets `true`.
#[cfg(feature = "ssr")]
pub fn claim_token(
    conn: &mut SqliteConnection,
    token_id: i32,
    device_id: &str,
) -> Result<bool, diesel::result::Error> {
    let claimed = diesel::update(
        tokens::table
            .filter(tokens::id.eq(token_id))
            .filter(tokens::device_id.is_null()),
    )
    .set((
        tokens::is_used.eq(true),
        tokens::device_id.eq(device_id),
        tokens::used_at.eq(Utc::now().naive_utc()),
    ))
    .execute(conn)?;
    Ok(claimed == 1)
}

#[cfg(feature = "ssr")]
pub fn attach_voter_to_token(
    conn: &mut SqliteConnection,
    token_id: i32,
    voter_id: i32,
) -> Result<usize, diesel::result::Error> {
    diesel::update(tokens::table.filter(tokens::id.eq(token_id)))
        .set(tokens::voter_id.eq(voter_id))
        .execute(conn)
}

/// Issues a new, unused token. The token string is stored normalized.
#[cfg(feature = "ssr")]
pub fn create_token(
    conn: &mut SqliteConnection,
    token: &str,
    token_type: VoterType,
    person_name: &str,
    category: Option<&str>,
) -> Result<Token, diesel::result::Error> {
    let normalized = token.trim().to_uppercase();
    diesel::insert_into(tokens::table)
        .values(&NewToken {
            token: &normalized,
            token_type,
            person_name,
            category,
        })
        .returning(Token::as_returning())
        .get_result(conn)
}

/// Characters of issued token codes. No 0/O or 1/I, so codes survive being read aloud.
#[cfg(feature = "ssr")]
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[cfg(feature = "ssr")]
pub const TOKEN_CODE_LEN: usize = 6;

/// A fresh token code, already in normalized form.
#[cfg(feature = "ssr")]
pub fn generate_token_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..TOKEN_CODE_LEN)
        .map(|_| char::from(*TOKEN_ALPHABET.choose(rng).unwrap_or(&b'X')))
        .collect()
}

/// Writes a voter's score for a reel. A repeat for the same (reel, voter) overwrites the score,
/// last write wins.
#[cfg(feature = "ssr")]
pub fn upsert_vote(
    conn: &mut SqliteConnection,
    submission: &VoteSubmission,
) -> Result<Vote, diesel::result::Error> {
    let now = Utc::now().naive_utc();
    let new_vote = NewVote {
        reel_id: &submission.reel_id,
        voter_id: submission.voter_id,
        score: submission.score,
        voter_type: submission.voter_type,
        voter_name: submission.voter_name.as_deref(),
        category: submission.category.as_deref(),
        updated_at: now,
    };
    let refresh = VoteRefresh {
        score: submission.score,
        voter_type: submission.voter_type,
        voter_name: submission.voter_name.as_deref(),
        category: submission.category.as_deref(),
        updated_at: now,
    };

    diesel::insert_into(votes::table)
        .values(&new_vote)
        .on_conflict((votes::reel_id, votes::voter_id))
        .do_update()
        .set(&refresh)
        .returning(Vote::as_returning())
        .get_result(conn)
}

#[cfg(feature = "ssr")]
pub fn get_vote_score(
    conn: &mut SqliteConnection,
    reel_id: &str,
    voter_id: i32,
) -> Result<Option<i32>, diesel::result::Error> {
    votes::table
        .filter(votes::reel_id.eq(reel_id))
        .filter(votes::voter_id.eq(voter_id))
        .select(votes::score)
        .first(conn)
        .optional()
}

#[cfg(feature = "ssr")]
pub fn get_aggregate(
    conn: &mut SqliteConnection,
    reel_id: &str,
) -> Result<Option<ReelAggregate>, diesel::result::Error> {
    vote_aggregates::table
        .filter(vote_aggregates::reel_id.eq(reel_id))
        .select(ReelAggregate::as_select())
        .first(conn)
        .optional()
}

/// Returns every aggregate row, best final score first.
#[cfg(feature = "ssr")]
pub fn get_all_aggregates(
    conn: &mut SqliteConnection,
) -> Result<Vec<ReelAggregate>, diesel::result::Error> {
    vote_aggregates::table
        .order(vote_aggregates::final_score.desc())
        .select(ReelAggregate::as_select())
        .load(conn)
}

/// Deletes every vote and aggregate row. Returns the number of deleted votes.
#[cfg(feature = "ssr")]
pub fn clear_votes(conn: &mut SqliteConnection) -> Result<usize, diesel::result::Error> {
    conn.transaction(|conn| {
        let deleted = diesel::delete(votes::table).execute(conn)?;
        diesel::delete(vote_aggregates::table).execute(conn)?;
        Ok(deleted)
    })
}

/// Resets the event: clears votes and aggregates, deletes voters and releases every token.
/// Reels are left untouched.
#[cfg(feature = "ssr")]
pub fn reset_database(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    conn.transaction(|conn| {
        clear_votes(conn)?;

        diesel::update(tokens::table)
            .set((
                tokens::is_used.eq(false),
                tokens::device_id.eq(None::<String>),
                tokens::voter_id.eq(None::<i32>),
                tokens::used_at.eq(None::<chrono::NaiveDateTime>),
            ))
            .execute(conn)?;

        diesel::delete(voters::table).execute(conn)?;

        Ok(())
    })
}
