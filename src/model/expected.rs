//! Expected win probability of a single batted ball.
//!
//! Instead of league frequencies, the outcome mix comes from live predictor
//! output for this ball: P(out) and P(single, double, triple, home run | hit).
//! Runner advancement is enumerated exactly as in the transition tensor, but
//! the advancement model sees the ball's features.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::advancement::{
    enumerate_advancements, AdvancementQuery, BattedBallFeatures, RunnerAdvancementModel,
};
use super::game_state::{GameState, Half};
use super::leverage::successor_wp;
use super::transition::{map_transition, BattedEvent, BipOutcome, Transition};
use super::win_probability::WinProbabilityTable;
use crate::error::{check_distribution, check_probability, ModelResult};

/// Hit-type probabilities conditional on the ball not being caught.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HitTypeProbabilities {
    pub single: f64,
    pub double: f64,
    pub triple: f64,
    pub home_run: f64,
}

/// Everything the evaluator needs to know about one batted ball.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayContext {
    pub state: GameState,
    pub out_probability: f64,
    pub hit_types: HitTypeProbabilities,
    pub features: Option<BattedBallFeatures>,
}

impl PlayContext {
    /// Unconditional probability of each ball-in-play outcome.
    pub fn outcome_probabilities(&self, tolerance: f64) -> ModelResult<[(BipOutcome, f64); 5]> {
        check_probability("out probability", self.out_probability)?;
        let h = &self.hit_types;
        check_distribution(
            "hit-type probabilities",
            &[h.single, h.double, h.triple, h.home_run],
            tolerance,
        )?;
        let hit = 1.0 - self.out_probability;
        Ok([
            (BipOutcome::Out, self.out_probability),
            (BipOutcome::Single, hit * h.single),
            (BipOutcome::Double, hit * h.double),
            (BipOutcome::Triple, hit * h.triple),
            (BipOutcome::HomeRun, hit * h.home_run),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayEvaluation {
    /// Win probability before the play.
    pub wp: f64,
    /// Expected win probability after the play.
    pub xwp: f64,
}

pub struct ExpectedWinProbability<'a> {
    wp: &'a WinProbabilityTable,
    model: &'a dyn RunnerAdvancementModel,
    tolerance: f64,
}

impl<'a> ExpectedWinProbability<'a> {
    pub fn new(
        wp: &'a WinProbabilityTable,
        model: &'a dyn RunnerAdvancementModel,
        tolerance: f64,
    ) -> Self {
        ExpectedWinProbability {
            wp,
            model,
            tolerance,
        }
    }

    pub fn evaluate(&self, play: &PlayContext) -> ModelResult<PlayEvaluation> {
        let pre = self.wp.get(&play.state)?;
        let mut xwp = 0.0;
        for (outcome, p) in play.outcome_probabilities(self.tolerance)? {
            if p == 0.0 {
                continue;
            }
            xwp += p * self.expected_given_outcome(play, outcome, pre)?;
        }
        Ok(PlayEvaluation { wp: pre, xwp })
    }

    /// Evaluate many plays in parallel. A play that fails is reported in its
    /// slot and does not stop the others.
    pub fn evaluate_batch(&self, plays: &[PlayContext]) -> Vec<ModelResult<PlayEvaluation>> {
        let results: Vec<_> = plays
            .par_iter()
            .enumerate()
            .map(|(i, play)| {
                let res = self.evaluate(play);
                match &res {
                    Ok(e) => debug!(play = i, wp = e.wp, xwp = e.xwp, "evaluated"),
                    Err(err) => warn!(play = i, error = %err, "play evaluation failed"),
                }
                res
            })
            .collect();
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            plays = plays.len(),
            failed,
            model = self.model.name(),
            "Expected win probability batch done"
        );
        results
    }

    /// E[wp after the play | outcome], over every advancement combination.
    fn expected_given_outcome(
        &self,
        play: &PlayContext,
        outcome: BipOutcome,
        pre: f64,
    ) -> ModelResult<f64> {
        let state = &play.state;
        let event = BattedEvent::from(outcome);
        let marginals = if event.consults_runners() {
            let queries =
                AdvancementQuery::for_runners(state.bases, state.outs, outcome, play.features);
            self.model.predict_batch(&queries)?
        } else {
            Vec::new()
        };
        let mut expected = 0.0;
        for (codes, weight) in enumerate_advancements(&marginals) {
            let t = map_transition(state.outs, state.bases, event, &codes)?;
            expected += weight * self.resolve(state, &t, pre)?;
        }
        Ok(expected)
    }

    /// Win probability after one enumerated play.
    ///
    /// The side retired in a walk-off half is outside the table: a home lead
    /// or deficit decides the game, and a tie takes the pre-play value
    /// rounded to 0 or 1.
    fn resolve(&self, state: &GameState, play: &Transition, pre: f64) -> ModelResult<f64> {
        let rules = self.wp.rules();
        if rules.is_walk_off_half(state.inning, state.half) && play.side_retired() {
            let run_diff = rules.saturate(state.run_diff + play.runs as i32);
            return Ok(match run_diff {
                d if d > 0 => 1.0,
                d if d < 0 => 0.0,
                _ => pre.round(),
            });
        }
        successor_wp(self.wp, rules.successor(state, play))
    }
}

/// Observed win probability after a play.
///
/// `next_state` is the state of the following plate appearance, absent when
/// the play ended the game; then the final score decides, and a tied final
/// score falls back to the pre-play value rounded.
pub fn realized_next_wp(
    wp: &WinProbabilityTable,
    pre: f64,
    next_state: Option<&GameState>,
    final_run_diff: i32,
) -> ModelResult<f64> {
    match next_state {
        Some(state) => wp.get(state),
        None if final_run_diff > 0 => Ok(1.0),
        None if final_run_diff < 0 => Ok(0.0),
        None => Ok(pre.round()),
    }
}

/// Win-probability credit for the fielding team on one play.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayValuation {
    pub wp: f64,
    pub xwp: f64,
    pub next_wp: f64,
    pub li: f64,
    /// Win probability added.
    pub wpa: f64,
    /// Expected win probability added.
    pub xwpa: f64,
    /// Win probability over expected.
    pub wpoe: f64,
    pub wpa_li: f64,
    pub wpoe_li: f64,
    /// 1 for a recorded out minus the predicted out probability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_over_expected: Option<f64>,
}

impl PlayValuation {
    /// Credit is signed toward the fielding team: home fields in the top.
    pub fn new(half: Half, eval: &PlayEvaluation, next_wp: f64, li: f64) -> Self {
        let dir = -(half.run_sign() as f64);
        let wpa = (next_wp - eval.wp) * dir;
        let xwpa = (eval.xwp - eval.wp) * dir;
        let wpoe = (next_wp - eval.xwp) * dir;
        let per_li = |v: f64| if li == 0.0 { 0.0 } else { v / li };
        PlayValuation {
            wp: eval.wp,
            xwp: eval.xwp,
            next_wp,
            li,
            wpa,
            xwpa,
            wpoe,
            wpa_li: per_li(wpa),
            wpoe_li: per_li(wpoe),
            out_over_expected: None,
        }
    }

    pub fn with_recorded_out(mut self, is_out: bool, out_probability: f64) -> Self {
        let observed = if is_out { 1.0 } else { 0.0 };
        self.out_over_expected = Some(observed - out_probability);
        self
    }
}
