use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::model::base_out::BaseState;
use crate::model::game_state::{GameRules, Half};

/// One published, immutable set of win-probability and leverage tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSetRecord {
    pub id: Option<i64>,
    /// Caller-chosen label, unique across the store
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub regulation_innings: i64,
    pub max_run_diff: i64,
    pub home_extra_inning_win_rate: f64,
    pub extra_inning_runner_on_second: bool,
    /// Mean raw leverage of the reference sample
    pub leverage_scale: f64,
}

impl ArtifactSetRecord {
    pub fn rules(&self) -> GameRules {
        GameRules {
            regulation_innings: self.regulation_innings as usize,
            max_run_diff: self.max_run_diff as i32,
            home_extra_inning_win_rate: self.home_extra_inning_win_rate,
            extra_inning_runner_on_second: self.extra_inning_runner_on_second,
        }
    }
}

/// Stored expected-win-probability result for one batted ball
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayEvaluationRecord {
    pub id: Option<i64>,
    pub play_id: String,
    /// Inning bucket, 0-based
    pub inning: i64,
    pub half: Half,
    pub bases: BaseState,
    pub outs: i64,
    pub run_diff: i64,
    pub wp: f64,
    pub xwp: f64,
    /// Filled only when the realized outcome was known
    pub next_wp: Option<f64>,
    pub li: Option<f64>,
    pub wpa: Option<f64>,
    pub xwpa: Option<f64>,
    pub wpoe: Option<f64>,
    pub wpa_li: Option<f64>,
    pub wpoe_li: Option<f64>,
    pub out_over_expected: Option<f64>,
    pub evaluated_at: DateTime<Utc>,
}

// ── Column conversions ───────────────────────────────────────────────────────

impl ToSql for Half {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Half {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "top" => Ok(Half::Top),
            "bottom" => Ok(Half::Bottom),
            other => Err(FromSqlError::Other(format!("unknown half {other:?}").into())),
        }
    }
}

impl ToSql for BaseState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.bits())))
    }
}

impl FromSql for BaseState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let bits = u8::column_result(value)?;
        BaseState::new(bits).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}
