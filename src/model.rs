use chrono::NaiveDateTime;
#[cfg(feature = "ssr")]
use diesel::prelude::*;
#[cfg(feature = "ssr")]
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Returned when a stored or configured string names no known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

// Closed string enums shared by the store, the wire payloads and the view. The text form is
// what lands in SQLite and in JSON, so it must never change for an existing variant.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// Maps a text enum onto a SQLite TEXT column.
macro_rules! sql_text_enum {
    ($name:ident) => {
        #[cfg(feature = "ssr")]
        impl diesel::serialize::ToSql<diesel::sql_types::Text, Sqlite> for $name {
            fn to_sql<'b>(
                &'b self,
                out: &mut diesel::serialize::Output<'b, '_, Sqlite>,
            ) -> diesel::serialize::Result {
                out.set_value(self.as_str());
                Ok(diesel::serialize::IsNull::No)
            }
        }

        #[cfg(feature = "ssr")]
        impl diesel::deserialize::FromSql<diesel::sql_types::Text, Sqlite> for $name {
            fn from_sql(
                bytes: diesel::sqlite::SqliteValue<'_, '_, '_>,
            ) -> diesel::deserialize::Result<Self> {
                let text =
                    <String as diesel::deserialize::FromSql<diesel::sql_types::Text, Sqlite>>::from_sql(
                        bytes,
                    )?;
                Ok(text.parse()?)
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(diesel::AsExpression, diesel::FromSqlRow))]
#[cfg_attr(feature = "ssr", diesel(sql_type = diesel::sql_types::Text))]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

text_enum!(DeviceType {
    Desktop => "desktop",
    Mobile => "mobile",
    Tablet => "tablet",
});
sql_text_enum!(DeviceType);

impl DeviceType {
    /// Classifies a browser user-agent string. Tablets are a subset of the mobile markers.
    pub fn from_user_agent(user_agent: &str) -> Self {
        const MOBILE_MARKERS: &[&str] = &[
            "mobile",
            "android",
            "iphone",
            "ipad",
            "ipod",
            "blackberry",
            "windows phone",
        ];
        let ua = user_agent.to_lowercase();
        if !MOBILE_MARKERS.iter().any(|marker| ua.contains(marker)) {
            return DeviceType::Desktop;
        }
        if ua.contains("tablet") || ua.contains("ipad") {
            DeviceType::Tablet
        } else {
            DeviceType::Mobile
        }
    }
}

/// Cohort of a token holder or of a vote. Tokens and votes share the same two values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(diesel::AsExpression, diesel::FromSqlRow))]
#[cfg_attr(feature = "ssr", diesel(sql_type = diesel::sql_types::Text))]
#[serde(rename_all = "lowercase")]
pub enum VoterType {
    #[default]
    Audience,
    Judge,
}

text_enum!(VoterType {
    Audience => "audience",
    Judge => "judge",
});
sql_text_enum!(VoterType);

impl VoterType {
    pub fn is_judge(&self) -> bool {
        matches!(self, VoterType::Judge)
    }
}

/// Which page a client is running. Only `Control` holds the authoritative live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageRole {
    Control,
    Judge,
    #[default]
    Audience,
    Results,
}

text_enum!(PageRole {
    Control => "control",
    Judge => "judge",
    Audience => "audience",
    Results => "results",
});

impl PageRole {
    /// Derives the role from a page path, e.g. `/control.html` or `/vote`. Unknown pages are
    /// treated as audience pages.
    pub fn from_path(path: &str) -> Self {
        let path = path.to_lowercase();
        if path.contains("control") {
            PageRole::Control
        } else if path.contains("judge") {
            PageRole::Judge
        } else if path.contains("results") {
            PageRole::Results
        } else {
            PageRole::Audience
        }
    }

    /// Control panels are excluded from the connected-device count.
    pub fn counts_as_device(&self) -> bool {
        !matches!(self, PageRole::Control)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowStatus {
    #[default]
    Waiting,
    Live,
    Ended,
}

text_enum!(ShowStatus {
    Waiting => "waiting",
    Live => "live",
    Ended => "ended",
});

/// A contestant's video entry. Reference data, never written by the voting core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable, Insertable, AsChangeset))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::reels))]
#[cfg_attr(feature = "ssr", diesel(check_for_backend(Sqlite)))]
#[serde(rename_all = "camelCase")]
pub struct Reel {
    pub id: String,
    #[cfg_attr(feature = "ssr", diesel(column_name = reel_number))]
    pub number: i32,
    #[cfg_attr(feature = "ssr", diesel(column_name = contestant_name))]
    pub contestant: String,
    pub category: String,
    #[cfg_attr(feature = "ssr", diesel(column_name = duration_seconds))]
    pub duration: i32,
    #[cfg_attr(feature = "ssr", diesel(column_name = thumbnail_icon))]
    pub thumbnail: String,
    pub video_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::voters))]
#[cfg_attr(feature = "ssr", diesel(check_for_backend(Sqlite)))]
pub struct Voter {
    pub id: i32,
    pub device_id: String,
    pub device_type: DeviceType,
    pub email: Option<String>,
    pub email_verified: bool,
    pub auth_user_id: Option<String>,
    pub is_judge: bool,
    pub judge_name: Option<String>,
    pub name: Option<String>,
    pub token_id: Option<i32>,
    pub last_seen_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

/// Input of the voter upsert. `name` and `token_id` are only written when present; `judge_name`
/// is always written so a re-registration as audience clears it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VoterRegistration {
    pub device_id: String,
    pub device_type: DeviceType,
    pub is_judge: bool,
    pub judge_name: Option<String>,
    pub name: Option<String>,
    pub token_id: Option<i32>,
}

#[cfg(feature = "ssr")]
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::voters)]
pub struct NewVoter<'a> {
    pub device_id: &'a str,
    pub device_type: DeviceType,
    pub is_judge: bool,
    pub judge_name: Option<&'a str>,
    pub name: Option<&'a str>,
    pub token_id: Option<i32>,
    pub last_seen_at: NaiveDateTime,
    // id, email fields and created_at use defaults
}

#[cfg(feature = "ssr")]
#[derive(AsChangeset, Debug)]
#[diesel(table_name = crate::schema::voters)]
pub struct VoterRefresh<'a> {
    pub device_type: DeviceType,
    pub is_judge: bool,
    pub judge_name: Option<Option<&'a str>>,
    pub name: Option<&'a str>,
    pub token_id: Option<i32>,
    pub last_seen_at: NaiveDateTime,
}

/// An external identity handed over by the OAuth or magic-link provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub user_id: String,
    pub email: String,
    pub email_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::tokens))]
#[cfg_attr(feature = "ssr", diesel(check_for_backend(Sqlite)))]
pub struct Token {
    pub id: i32,
    pub token: String,
    pub token_type: VoterType,
    pub person_name: String,
    pub category: Option<String>,
    pub is_used: bool,
    pub device_id: Option<String>,
    pub voter_id: Option<i32>,
    pub used_at: Option<NaiveDateTime>,
}

#[cfg(feature = "ssr")]
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::tokens)]
pub struct NewToken<'a> {
    pub token: &'a str,
    pub token_type: VoterType,
    pub person_name: &'a str,
    pub category: Option<&'a str>,
    // is_used, device_id, voter_id and used_at start unset
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::votes))]
#[cfg_attr(feature = "ssr", diesel(check_for_backend(Sqlite)))]
pub struct Vote {
    pub id: i32,
    pub reel_id: String,
    pub voter_id: i32,
    pub score: i32,
    pub voter_type: VoterType,
    pub voter_name: Option<String>,
    pub category: Option<String>,
    pub updated_at: NaiveDateTime,
}

/// One voter's score for one reel, as handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteSubmission {
    pub reel_id: String,
    pub voter_id: i32,
    pub score: i32,
    pub voter_type: VoterType,
    pub voter_name: Option<String>,
    pub category: Option<String>,
}

#[cfg(feature = "ssr")]
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::votes)]
pub struct NewVote<'a> {
    pub reel_id: &'a str,
    pub voter_id: i32,
    pub score: i32,
    pub voter_type: VoterType,
    pub voter_name: Option<&'a str>,
    pub category: Option<&'a str>,
    pub updated_at: NaiveDateTime,
}

/// Columns overwritten when a voter scores the same reel again.
#[cfg(feature = "ssr")]
#[derive(AsChangeset, Debug)]
#[diesel(table_name = crate::schema::votes)]
pub struct VoteRefresh<'a> {
    pub score: i32,
    pub voter_type: VoterType,
    pub voter_name: Option<&'a str>,
    pub category: Option<&'a str>,
    pub updated_at: NaiveDateTime,
}

/// Trigger-maintained per-reel summary. Read-only from the voting core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ssr", derive(Queryable, Selectable))]
#[cfg_attr(feature = "ssr", diesel(table_name = crate::schema::vote_aggregates))]
#[cfg_attr(feature = "ssr", diesel(check_for_backend(Sqlite)))]
pub struct ReelAggregate {
    pub reel_id: String,
    pub audience_count: i32,
    pub judge_count: i32,
    pub audience_average: f64,
    pub judge_average: f64,
    pub final_score: f64,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReelStats {
    pub audience_count: i32,
    pub judge_count: i32,
    pub audience_avg: f64,
    pub judge_avg: f64,
    pub final_score: f64,
    pub total_votes: i32,
}

impl ReelStats {
    /// A reel without an aggregate row has simply not been voted on yet.
    pub fn from_aggregate(aggregate: Option<&ReelAggregate>) -> Self {
        match aggregate {
            Some(agg) => ReelStats {
                audience_count: agg.audience_count,
                judge_count: agg.judge_count,
                audience_avg: agg.audience_average,
                judge_avg: agg.judge_average,
                final_score: agg.final_score,
                total_votes: agg.audience_count + agg.judge_count,
            },
            None => ReelStats::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReelStanding {
    #[serde(flatten)]
    pub reel: Reel,
    pub stats: ReelStats,
}

/// Merges aggregates onto the reel list (optionally one category) and orders the result by final
/// score, highest first. Ties keep catalog order.
pub fn rank_reels(
    reels: &[Reel],
    aggregates: &[ReelAggregate],
    category: Option<&str>,
) -> Vec<ReelStanding> {
    let by_reel: HashMap<&str, &ReelAggregate> = aggregates
        .iter()
        .map(|agg| (agg.reel_id.as_str(), agg))
        .collect();

    let mut standings: Vec<ReelStanding> = reels
        .iter()
        .filter(|reel| category.map_or(true, |c| reel.category == c))
        .map(|reel| ReelStanding {
            reel: reel.clone(),
            stats: ReelStats::from_aggregate(by_reel.get(reel.id.as_str()).copied()),
        })
        .collect();
    standings.sort_by(|a, b| b.stats.final_score.total_cmp(&a.stats.final_score));
    standings
}
