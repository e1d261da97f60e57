//! Home-team win probability for every game state, by backward induction.
//!
//! Run distributions already describe the *rest* of a half-inning, so each
//! half-inning is solved as one step: a state's win probability is the
//! run-weighted average of the win probability at the start of the next
//! half-inning. Halves are solved from the last to the first; within one
//! half every (bases, outs) cell only reads the already-solved next half, so
//! cells are computed in parallel.
//!
//! Base cases are the walk-off halves (bottom of the final regulation inning
//! and of the extra-inning bucket): a home lead is a win, otherwise the home
//! team wins by outscoring the deficit and ties go to extras at a fixed
//! empirical rate.

use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::base_out::{BaseState, BASE_STATES, OUT_STATES};
use super::game_state::{GameRules, GameState, Half};
use super::run_distribution::{RunDistributionTable, RunDistributions, RunRegime, RUN_BUCKETS};
use crate::error::{check_probability, ModelError, ModelResult};

/// Dense table, axes [inning bucket, half, bases, outs, run diff + R].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinProbabilityTable {
    rules: GameRules,
    values: Vec<f64>,
}

impl WinProbabilityTable {
    pub fn from_values(rules: GameRules, values: Vec<f64>) -> ModelResult<Self> {
        let table = WinProbabilityTable { rules, values };
        table.validate()?;
        Ok(table)
    }

    fn zeros(rules: GameRules) -> Self {
        let len = table_len(&rules);
        WinProbabilityTable {
            rules,
            values: vec![0.0; len],
        }
    }

    pub fn rules(&self) -> &GameRules {
        &self.rules
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, state: &GameState) -> ModelResult<f64> {
        Ok(self.values[state.table_index(&self.rules)?])
    }

    /// Every state in table order, paired with its value.
    pub fn iter(&self) -> impl Iterator<Item = (GameState, f64)> + '_ {
        all_states(&self.rules).zip(self.values.iter().copied())
    }

    /// Shape check and every value a probability.
    pub fn validate(&self) -> ModelResult<()> {
        let expected = table_len(&self.rules);
        if self.values.len() != expected {
            return Err(ModelError::ShapeMismatch {
                what: "win probability table".into(),
                expected,
                got: self.values.len(),
            });
        }
        for &v in &self.values {
            check_probability("win probability", v)?;
        }
        Ok(())
    }

    fn slice_mut(&mut self, inning: usize, half: Half) -> &mut [f64] {
        let len = slice_len(&self.rules);
        let off = (inning * 2 + half.index()) * len;
        &mut self.values[off..off + len]
    }

    /// Win probability over run differentials at the first state of a half.
    fn opening_row(&self, inning: usize, half: Half) -> ModelResult<Vec<f64>> {
        let opening = GameState {
            inning,
            half,
            bases: self.rules.starting_bases(inning),
            outs: 0,
            run_diff: -self.rules.max_run_diff,
        };
        let off = opening.table_index(&self.rules)?;
        Ok(self.values[off..off + self.rules.run_diff_slots()].to_vec())
    }
}

fn slice_len(rules: &GameRules) -> usize {
    BASE_STATES * OUT_STATES * rules.run_diff_slots()
}

fn table_len(rules: &GameRules) -> usize {
    rules.inning_buckets() * 2 * slice_len(rules)
}

/// All game states in table order.
pub fn all_states(rules: &GameRules) -> impl Iterator<Item = GameState> {
    let rules = *rules;
    (0..rules.inning_buckets()).flat_map(move |inning| {
        Half::ALL.into_iter().flat_map(move |half| {
            BaseState::all().flat_map(move |bases| {
                (0..OUT_STATES as u8).flat_map(move |outs| {
                    (-rules.max_run_diff..=rules.max_run_diff).map(move |run_diff| GameState {
                        inning,
                        half,
                        bases,
                        outs,
                        run_diff,
                    })
                })
            })
        })
    })
}

/// Solve the full table.
///
/// Fails without renormalizing if either run distribution has a row that
/// does not sum to one within `tolerance`.
pub fn solve(
    runs: &RunDistributions,
    rules: &GameRules,
    tolerance: f64,
) -> ModelResult<WinProbabilityTable> {
    let start = Instant::now();
    runs.validate(tolerance)?;
    check_probability("home extra-inning win rate", rules.home_extra_inning_win_rate)?;

    let blended = runs.blended();
    let mut table = WinProbabilityTable::zeros(*rules);
    let (final_inning, extra) = (rules.final_inning(), rules.extra_inning());

    for inning in [final_inning, extra] {
        let slice = walk_off_slice(runs, rules)?;
        table.slice_mut(inning, Half::Bottom).copy_from_slice(&slice);
    }

    let next = table.opening_row(extra, Half::Bottom)?;
    let slice = recurse_slice(&runs.normal, Some(&blended), &next, Half::Top, rules)?;
    table.slice_mut(extra, Half::Top).copy_from_slice(&slice);

    for inning in (0..=final_inning).rev() {
        if inning < final_inning {
            let next = table.opening_row(inning + 1, Half::Top)?;
            let slice = recurse_slice(&runs.normal, None, &next, Half::Bottom, rules)?;
            table.slice_mut(inning, Half::Bottom).copy_from_slice(&slice);
        }
        let next = table.opening_row(inning, Half::Bottom)?;
        let boundary = (inning == final_inning).then_some(&blended);
        let slice = recurse_slice(&runs.normal, boundary, &next, Half::Top, rules)?;
        table.slice_mut(inning, Half::Top).copy_from_slice(&slice);
        debug!(inning = inning + 1, "solved inning");
    }

    info!(
        states = table.values.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Win probability table solved"
    );
    Ok(table)
}

/// Solve all 24 (bases, outs) cells of one half in parallel.
fn solve_cells<F>(rules: &GameRules, cell: F) -> ModelResult<Vec<f64>>
where
    F: Fn(BaseState, u8) -> ModelResult<Vec<f64>> + Sync,
{
    let rows = (0..BASE_STATES * OUT_STATES)
        .into_par_iter()
        .map(|i| {
            let bases = BaseState::new((i / OUT_STATES) as u8)?;
            cell(bases, (i % OUT_STATES) as u8)
        })
        .collect::<ModelResult<Vec<_>>>()?;
    let slice: Vec<f64> = rows.into_iter().flatten().collect();
    debug_assert_eq!(slice.len(), slice_len(rules));
    Ok(slice)
}

/// Bottom of the final inning or of extras.
fn walk_off_slice(runs: &RunDistributions, rules: &GameRules) -> ModelResult<Vec<f64>> {
    let extras = rules.home_extra_inning_win_rate;
    solve_cells(rules, |bases, outs| {
        (-rules.max_run_diff..=rules.max_run_diff)
            .map(|run_diff| -> ModelResult<f64> {
                if run_diff > 0 {
                    return Ok(1.0);
                }
                let regime = if run_diff == 0 || run_diff == -1 {
                    RunRegime::NeedOneRun
                } else {
                    RunRegime::Normal
                };
                let pmf = runs.get(regime).pmf(bases, outs)?;
                let deficit = (-run_diff) as usize;
                let walk_off: f64 = pmf.iter().skip(deficit + 1).sum();
                let tie = pmf.get(deficit).copied().unwrap_or(0.0);
                Ok(walk_off + tie * extras)
            })
            .collect()
    })
}

/// Any half that is not a base case: average the next half's opening row
/// over this cell's run distribution. `boundary` replaces the distribution
/// for run differentials -1 and 0.
fn recurse_slice(
    normal: &RunDistributionTable,
    boundary: Option<&RunDistributionTable>,
    next: &[f64],
    half: Half,
    rules: &GameRules,
) -> ModelResult<Vec<f64>> {
    let sign = half.run_sign();
    solve_cells(rules, |bases, outs| {
        let base_pmf = normal.pmf(bases, outs)?;
        let boundary_pmf = boundary.map(|t| t.pmf(bases, outs)).transpose()?;
        Ok((-rules.max_run_diff..=rules.max_run_diff)
            .map(|run_diff| {
                let pmf = match boundary_pmf {
                    Some(p) if run_diff == 0 || run_diff == -1 => p,
                    _ => base_pmf,
                };
                (0..RUN_BUCKETS)
                    .map(|r| {
                        let after = rules.saturate(run_diff + sign * r as i32);
                        pmf[r] * next[(after + rules.max_run_diff) as usize]
                    })
                    .sum()
            })
            .collect())
    })
}
