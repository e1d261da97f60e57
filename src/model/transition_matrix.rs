//! One-plate-appearance transition tensor.
//!
//! `T[bases, outs]` is a joint distribution over (new bases, new outs, runs
//! on the play). It factorizes as
//! p(strikeout | walk | ball in play) · p(outcome | in play) ·
//! Π p(advancement | outcome, role, base, outs),
//! the last factor being the runner-independence assumption shared with the
//! expected-win-probability evaluator.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::advancement::{enumerate_advancements, AdvancementQuery, RunnerAdvancementModel};
use super::base_out::{check_outs, AdvancementCode, BaseState, BASE_STATES, OUT_STATES};
use super::transition::{map_transition, BattedEvent, BipOutcome, Transition};
use crate::error::{check_distribution, ModelError, ModelResult};

/// New-outs axis includes the retired-side sentinel.
pub const NEW_OUT_STATES: usize = 4;
/// Runs on a single play: 0..=4.
pub const PLAY_RUN_BUCKETS: usize = 5;
const ROW_LEN: usize = BASE_STATES * NEW_OUT_STATES * PLAY_RUN_BUCKETS;

/// League event mix for one plate appearance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventFrequencies {
    pub strikeout: f64,
    /// Walks and hit-by-pitches.
    pub walk: f64,
    pub in_play: f64,
    /// P(out, single, double, triple, home run | in play).
    pub in_play_outcomes: [f64; 5],
}

impl EventFrequencies {
    pub fn validate(&self, tolerance: f64) -> ModelResult<()> {
        check_distribution(
            "plate appearance event frequencies",
            &[self.strikeout, self.walk, self.in_play],
            tolerance,
        )?;
        check_distribution("ball-in-play outcome frequencies", &self.in_play_outcomes, tolerance)
    }

    pub fn outcome(&self, outcome: BipOutcome) -> f64 {
        self.in_play_outcomes[outcome.index()]
    }
}

/// Dense tensor, axes [bases(8), outs(3), new bases(8), new outs(4), runs(5)].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionTensor {
    probs: Vec<f64>,
}

impl TransitionTensor {
    pub fn from_probabilities(probs: Vec<f64>, tolerance: f64) -> ModelResult<Self> {
        let tensor = TransitionTensor { probs };
        tensor.validate(tolerance)?;
        Ok(tensor)
    }

    pub fn row(&self, bases: BaseState, outs: u8) -> ModelResult<&[f64]> {
        let off = (bases.index() * OUT_STATES + check_outs(outs)? as usize) * ROW_LEN;
        Ok(&self.probs[off..off + ROW_LEN])
    }

    /// Reachable transitions from a cell with their probabilities.
    pub fn transitions(
        &self,
        bases: BaseState,
        outs: u8,
    ) -> ModelResult<impl Iterator<Item = (Transition, f64)> + '_> {
        let row = self.row(bases, outs)?;
        Ok(row
            .iter()
            .enumerate()
            .filter(|(_, p)| **p > 0.0)
            .map(|(i, &p)| {
                let runs = (i % PLAY_RUN_BUCKETS) as u8;
                let outs = (i / PLAY_RUN_BUCKETS % NEW_OUT_STATES) as u8;
                let bases = BaseState::new((i / (PLAY_RUN_BUCKETS * NEW_OUT_STATES)) as u8)
                    .unwrap_or_default();
                (Transition { outs, bases, runs }, p)
            }))
    }

    pub fn validate(&self, tolerance: f64) -> ModelResult<()> {
        let expected = BASE_STATES * OUT_STATES * ROW_LEN;
        if self.probs.len() != expected {
            return Err(ModelError::ShapeMismatch {
                what: "transition tensor".into(),
                expected,
                got: self.probs.len(),
            });
        }
        for bases in BaseState::all() {
            for outs in 0..OUT_STATES as u8 {
                check_row(bases, outs, self.row(bases, outs)?, tolerance)?;
            }
        }
        Ok(())
    }
}

fn row_offset(t: &Transition) -> usize {
    (t.bases.index() * NEW_OUT_STATES + t.outs as usize) * PLAY_RUN_BUCKETS + t.runs as usize
}

fn check_row(bases: BaseState, outs: u8, row: &[f64], tolerance: f64) -> ModelResult<()> {
    let what = format!("transition row bases={:#05b} outs={}", bases.bits(), outs);
    check_distribution(&what, row, tolerance)
}

fn accumulate(row: &mut [f64], t: &Transition, p: f64) -> ModelResult<()> {
    if t.runs as usize >= PLAY_RUN_BUCKETS {
        return Err(ModelError::RunsOutOfRange(t.runs));
    }
    row[row_offset(t)] += p;
    Ok(())
}

/// Build the tensor. Each (bases, outs) row is built independently and must
/// sum to one within `tolerance`, otherwise the build fails.
pub fn build_transition_tensor(
    freqs: &EventFrequencies,
    model: &dyn RunnerAdvancementModel,
    tolerance: f64,
) -> ModelResult<TransitionTensor> {
    freqs.validate(tolerance)?;
    let rows = (0..BASE_STATES * OUT_STATES)
        .into_par_iter()
        .map(|i| {
            let bases = BaseState::new((i / OUT_STATES) as u8)?;
            build_row(freqs, model, bases, (i % OUT_STATES) as u8, tolerance)
        })
        .collect::<ModelResult<Vec<_>>>()?;

    info!(model = model.name(), "Transition tensor built");
    Ok(TransitionTensor {
        probs: rows.concat(),
    })
}

fn build_row(
    freqs: &EventFrequencies,
    model: &dyn RunnerAdvancementModel,
    bases: BaseState,
    outs: u8,
    tolerance: f64,
) -> ModelResult<Vec<f64>> {
    let mut row = vec![0.0; ROW_LEN];

    // Strikeout: batter out, every runner holds.
    let hold = vec![AdvancementCode::Adv0; bases.bit_count()];
    let t = map_transition(outs, bases, BattedEvent::Out, &hold)?;
    accumulate(&mut row, &t, freqs.strikeout)?;

    let t = map_transition(outs, bases, BattedEvent::Walk, &[])?;
    accumulate(&mut row, &t, freqs.walk)?;

    for outcome in BipOutcome::ALL {
        let p_outcome = freqs.in_play * freqs.outcome(outcome);
        if p_outcome == 0.0 {
            continue;
        }
        let event = BattedEvent::from(outcome);
        let marginals = if event.consults_runners() {
            model.predict_batch(&AdvancementQuery::for_runners(bases, outs, outcome, None))?
        } else {
            Vec::new()
        };
        for (codes, weight) in enumerate_advancements(&marginals) {
            let t = map_transition(outs, bases, event, &codes)?;
            accumulate(&mut row, &t, p_outcome * weight)?;
        }
    }

    check_row(bases, outs, &row, tolerance)?;
    Ok(row)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::advancement::{
        AdvancementDistribution, AdvancementEntry, TabulatedAdvancementModel,
    };
    use crate::model::base_out::RunnerRole;
    use approx::assert_relative_eq;

    fn prob(tensor: &TransitionTensor, bases: BaseState, outs: u8, next: &Transition) -> f64 {
        tensor.row(bases, outs).unwrap()[row_offset(next)]
    }

    pub(crate) fn league_frequencies() -> EventFrequencies {
        EventFrequencies {
            strikeout: 0.22,
            walk: 0.09,
            in_play: 0.69,
            in_play_outcomes: [0.66, 0.22, 0.07, 0.01, 0.04],
        }
    }

    /// Plausible aggregate advancement: runners move up more on extra-base
    /// hits, lead runners score more often, outs sometimes double runners off.
    pub(crate) fn league_model() -> TabulatedAdvancementModel {
        let mut entries = Vec::new();
        for outcome in BipOutcome::ALL {
            for (role, bases) in [
                (RunnerRole::Lead, vec![1u8, 2, 3]),
                (RunnerRole::Trail, vec![1, 2]),
                (RunnerRole::Trail2, vec![1]),
            ] {
                for base in bases {
                    for outs in 0..3u8 {
                        let probs = match outcome {
                            BipOutcome::Out if outs == 2 => [0.0, 1.0, 0.0, 0.0, 0.0],
                            BipOutcome::Out => [0.12, 0.63, 0.2, 0.0, 0.05],
                            BipOutcome::Single => [0.02, 0.0, 0.58, 0.3, 0.1],
                            BipOutcome::Double => [0.01, 0.0, 0.0, 0.54, 0.45],
                            BipOutcome::Triple | BipOutcome::HomeRun => [0.0, 0.0, 0.0, 0.0, 1.0],
                        };
                        entries.push(AdvancementEntry {
                            outcome,
                            role,
                            base,
                            outs,
                            probs: AdvancementDistribution::new(probs, 1e-9).unwrap(),
                        });
                    }
                }
            }
        }
        TabulatedAdvancementModel::from_entries(entries)
    }

    pub(crate) fn league_tensor() -> TransitionTensor {
        build_transition_tensor(&league_frequencies(), &league_model(), 1e-9).unwrap()
    }

    #[test]
    fn every_row_sums_to_one() {
        let tensor = league_tensor();
        tensor.validate(1e-6).unwrap();
        for bases in BaseState::all() {
            for outs in 0..3 {
                let total: f64 = tensor.row(bases, outs).unwrap().iter().sum();
                assert_relative_eq!(total, 1.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn strikeout_and_walk_mass_land_on_deterministic_cells() {
        let tensor = league_tensor();
        let f = league_frequencies();
        let empty = BaseState::EMPTY;

        // Empty bases, nobody out: K -> one out; BB -> runner on first.
        let k = Transition { outs: 1, bases: empty, runs: 0 };
        let bb = Transition { outs: 0, bases: BaseState::new(0b001).unwrap(), runs: 0 };
        // Batted-ball outs with nobody on land on the same cell as a K.
        let bip_out = f.in_play * f.outcome(BipOutcome::Out);
        assert_relative_eq!(prob(&tensor, empty, 0, &k), f.strikeout + bip_out, epsilon = 1e-12);
        let single = f.in_play * f.outcome(BipOutcome::Single);
        assert_relative_eq!(prob(&tensor, empty, 0, &bb), f.walk + single, epsilon = 1e-12);
    }

    #[test]
    fn solo_home_run_mass() {
        let tensor = league_tensor();
        let f = league_frequencies();
        let hr = Transition { outs: 0, bases: BaseState::EMPTY, runs: 1 };
        assert_relative_eq!(
            prob(&tensor, BaseState::EMPTY, 0, &hr),
            f.in_play * f.outcome(BipOutcome::HomeRun),
            epsilon = 1e-12
        );
    }

    #[test]
    fn third_out_rows_only_reach_retired_side_with_empty_bases() {
        let tensor = league_tensor();
        for bases in BaseState::all() {
            for (t, _) in tensor.transitions(bases, 2).unwrap() {
                if t.outs == 3 {
                    assert_eq!(t.bases, BaseState::EMPTY);
                }
            }
        }
    }

    #[test]
    fn retired_side_has_no_row() {
        let tensor = league_tensor();
        for bases in [BaseState::EMPTY, BaseState::LOADED] {
            assert!(matches!(tensor.row(bases, 3), Err(ModelError::OutsOutOfRange(3))));
            assert!(tensor.transitions(bases, 3).is_err());
        }
        assert!(tensor.row(BaseState::LOADED, 2).is_ok());
    }

    #[test]
    fn unnormalized_event_mix_fails() {
        let mut f = league_frequencies();
        f.walk += 0.05;
        let err = build_transition_tensor(&f, &league_model(), 1e-6).unwrap_err();
        assert!(matches!(err, ModelError::NotNormalized { .. }));
    }

    #[test]
    fn missing_advancement_situation_fails_the_build() {
        let model = TabulatedAdvancementModel::default();
        let err = build_transition_tensor(&league_frequencies(), &model, 1e-6).unwrap_err();
        assert!(matches!(err, ModelError::MissingAdvancement { .. }));
    }
}
