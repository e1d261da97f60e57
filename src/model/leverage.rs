//! Leverage index: how much one plate appearance can swing the game.
//!
//! Raw leverage is E|wp(next) − wp(state)| over the one-step transition
//! tensor. The raw table is divided by its mean over a reference sample of
//! real plate appearances, so an average plate appearance has leverage 1.
//! The constant depends on the sample and is stored with the table.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::game_state::{GameRules, GameState, Successor};
use super::transition_matrix::TransitionTensor;
use super::win_probability::{all_states, WinProbabilityTable};
use crate::error::{ModelError, ModelResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeverageIndexTable {
    rules: GameRules,
    /// Mean raw leverage over the reference sample.
    scale: f64,
    values: Vec<f64>,
}

impl LeverageIndexTable {
    pub fn from_values(rules: GameRules, scale: f64, values: Vec<f64>) -> ModelResult<Self> {
        let table = LeverageIndexTable { rules, scale, values };
        table.validate()?;
        Ok(table)
    }

    pub fn rules(&self) -> &GameRules {
        &self.rules
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, state: &GameState) -> ModelResult<f64> {
        Ok(self.values[state.table_index(&self.rules)?])
    }

    pub fn iter(&self) -> impl Iterator<Item = (GameState, f64)> + '_ {
        all_states(&self.rules).zip(self.values.iter().copied())
    }

    pub fn validate(&self) -> ModelResult<()> {
        let expected = all_states(&self.rules).count();
        if self.values.len() != expected {
            return Err(ModelError::ShapeMismatch {
                what: "leverage index table".into(),
                expected,
                got: self.values.len(),
            });
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(ModelError::DegenerateScale(self.scale));
        }
        if let Some(&bad) = self.values.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(ModelError::InvalidProbability {
                what: "leverage index".into(),
                value: bad,
            });
        }
        Ok(())
    }
}

/// Win probability after a play, 1 or 0 once the game is decided.
pub(crate) fn successor_wp(wp: &WinProbabilityTable, next: Successor) -> ModelResult<f64> {
    match next {
        Successor::Live(state) => wp.get(&state),
        Successor::Final { home_wins } => Ok(if home_wins { 1.0 } else { 0.0 }),
    }
}

/// Unscaled expected absolute win-probability swing for one state.
pub fn raw_leverage(
    wp: &WinProbabilityTable,
    tensor: &TransitionTensor,
    state: &GameState,
) -> ModelResult<f64> {
    let rules = wp.rules();
    let here = wp.get(state)?;
    tensor
        .transitions(state.bases, state.outs)?
        .map(|(play, p)| -> ModelResult<f64> {
            let next = successor_wp(wp, rules.successor(state, &play))?;
            Ok(p * (next - here).abs())
        })
        .sum()
}

/// Raw leverage for every state, in table order.
pub fn raw_leverage_table(
    wp: &WinProbabilityTable,
    tensor: &TransitionTensor,
) -> ModelResult<Vec<f64>> {
    let states: Vec<GameState> = all_states(wp.rules()).collect();
    states
        .par_iter()
        .map(|s| raw_leverage(wp, tensor, s))
        .collect()
}

/// Divide raw leverage by its mean over `reference` (one entry per plate
/// appearance). A zero or undefined mean is an error.
pub fn scale_leverage(
    rules: GameRules,
    raw: Vec<f64>,
    reference: &[GameState],
) -> ModelResult<LeverageIndexTable> {
    let mut total = 0.0;
    for state in reference {
        total += raw[state.table_index(&rules)?];
    }
    let mean = if reference.is_empty() {
        f64::NAN
    } else {
        total / reference.len() as f64
    };
    if !(mean.is_finite() && mean > 0.0) {
        return Err(ModelError::DegenerateScale(mean));
    }
    let values = raw.into_iter().map(|v| v / mean).collect();
    LeverageIndexTable::from_values(rules, mean, values)
}

/// Raw leverage followed by reference scaling.
pub fn build_leverage_index(
    wp: &WinProbabilityTable,
    tensor: &TransitionTensor,
    reference: &[GameState],
) -> ModelResult<LeverageIndexTable> {
    let raw = raw_leverage_table(wp, tensor)?;
    let table = scale_leverage(*wp.rules(), raw, reference)?;
    info!(
        reference_plate_appearances = reference.len(),
        scale = table.scale,
        "Leverage index table built"
    );
    Ok(table)
}
