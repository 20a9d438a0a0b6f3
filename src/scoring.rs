//! Final-score policy.
//!
//! The store computes `final_score` inside the aggregate triggers, so a policy has two faces: the
//! plain Rust computation and the SQL expression rendered into the trigger bodies. Both must
//! agree; the tests in `lib.rs` check the trigger output against [`ScoringPolicy::compute_final_score`].

use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoringPolicy {
    /// Always `judge_avg * w + audience_avg * (1 - w)`. A cohort without votes contributes zero.
    Blend { judge_weight: f64 },
    /// Blend when both cohorts voted, otherwise pass through whichever cohort did.
    Fallback { judge_weight: f64 },
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        ScoringPolicy::Fallback { judge_weight: 0.6 }
    }
}

impl ScoringPolicy {
    pub fn judge_weight(&self) -> f64 {
        match *self {
            ScoringPolicy::Blend { judge_weight } | ScoringPolicy::Fallback { judge_weight } => {
                judge_weight
            }
        }
    }

    pub fn compute_final_score(
        &self,
        audience_avg: f64,
        judge_avg: f64,
        audience_count: i32,
        judge_count: i32,
    ) -> f64 {
        let w = self.judge_weight();
        let blended = judge_avg * w + audience_avg * (1.0 - w);
        match self {
            ScoringPolicy::Blend { .. } => blended,
            ScoringPolicy::Fallback { .. } => match (audience_count > 0, judge_count > 0) {
                (true, true) => blended,
                (false, true) => judge_avg,
                (true, false) => audience_avg,
                (false, false) => 0.0,
            },
        }
    }

    /// SQL expression over the columns `ac`, `jc`, `aa` and `ja` (audience/judge count and
    /// average) used by the aggregate triggers.
    pub fn final_score_sql(&self) -> String {
        let w = self.judge_weight();
        let blended = format!("(ja * {:?} + aa * {:?})", w, 1.0 - w);
        match self {
            ScoringPolicy::Blend { .. } => blended,
            ScoringPolicy::Fallback { .. } => format!(
                "CASE WHEN jc > 0 AND ac > 0 THEN {} WHEN jc > 0 THEN ja WHEN ac > 0 THEN aa ELSE 0.0 END",
                blended
            ),
        }
    }
}

impl fmt::Display for ScoringPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoringPolicy::Blend { judge_weight } => write!(f, "blend:{}", judge_weight),
            ScoringPolicy::Fallback { judge_weight } => write!(f, "fallback:{}", judge_weight),
        }
    }
}

/// Parses `blend`, `blend:0.5`, `fallback` or `fallback:0.6`. Without a weight, `blend` is the
/// straight 50/50 split and `fallback` is judge-weighted 60/40.
impl FromStr for ScoringPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, weight) = match s.trim().split_once(':') {
            Some((kind, weight)) => (kind, Some(weight)),
            None => (s.trim(), None),
        };
        let weight = weight
            .map(|w| {
                w.trim()
                    .parse::<f64>()
                    .map_err(|e| AppError::Config(format!("invalid judge weight {w:?}: {e}")))
            })
            .transpose()?;
        if let Some(w) = weight {
            if !(0.0..=1.0).contains(&w) {
                return Err(AppError::Config(format!(
                    "judge weight must be between 0 and 1, got {w}"
                )));
            }
        }

        match kind.to_lowercase().as_str() {
            "blend" => Ok(ScoringPolicy::Blend {
                judge_weight: weight.unwrap_or(0.5),
            }),
            "fallback" => Ok(ScoringPolicy::Fallback {
                judge_weight: weight.unwrap_or(0.6),
            }),
            other => Err(AppError::Config(format!("unknown scoring policy {other:?}"))),
        }
    }
}
