//! Rest-of-half-inning run distributions.
//!
//! For every (bases, outs) cell the table holds P(runs scored from this point
//! until the side is retired). The top bucket collects 14 or more runs.
//!
//! Two regimes are estimated separately:
//! - **Normal**: every half-inning before the final scheduled inning.
//! - **NeedOneRun**: the final scheduled inning or later with the batting team
//!   tied or one run down, where offenses play for a single run.
//!
//! [`RunDistributionTable::blend`] averages the two; the solver uses the
//! blend only at the entrance to a walk-off half-inning.

use serde::{Deserialize, Serialize};

use super::base_out::{check_outs, BaseState, BASE_STATES, OUT_STATES};
use crate::error::{check_distribution, ModelError, ModelResult};

/// Run buckets 0..=14; the last one means "14 or more".
pub const RUN_BUCKETS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunRegime {
    Normal,
    NeedOneRun,
}

impl RunRegime {
    /// Which table a plate appearance counts toward, if any.
    ///
    /// `inning` is 1-based; `batting_margin` is the batting team's score
    /// minus the fielding team's.
    pub fn classify(inning: u32, regulation_innings: u32, batting_margin: i32) -> Option<Self> {
        if inning < regulation_innings {
            Some(RunRegime::Normal)
        } else if batting_margin == 0 || batting_margin == -1 {
            Some(RunRegime::NeedOneRun)
        } else {
            None
        }
    }
}

/// Per-cell tallies of rest-of-inning runs, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCounts {
    counts: Vec<u64>,
}

impl Default for RunCounts {
    fn default() -> Self {
        RunCounts {
            counts: vec![0; BASE_STATES * OUT_STATES * RUN_BUCKETS],
        }
    }
}

impl RunCounts {
    pub fn record(&mut self, bases: BaseState, outs: u8, runs: u32) -> ModelResult<()> {
        let outs = check_outs(outs)?;
        let bucket = (runs as usize).min(RUN_BUCKETS - 1);
        self.counts[cell_offset(bases, outs) + bucket] += 1;
        Ok(())
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Row-stochastic table, axes [bases(8), outs(3), runs(15)], row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDistributionTable {
    regime: RunRegime,
    probs: Vec<f64>,
}

impl RunDistributionTable {
    /// Normalize tallies per cell. A cell with no observations fails.
    pub fn from_counts(regime: RunRegime, counts: &RunCounts) -> ModelResult<Self> {
        let mut probs = vec![0.0; counts.counts.len()];
        for bases in BaseState::all() {
            for outs in 0..OUT_STATES as u8 {
                let off = cell_offset(bases, outs);
                let row = &counts.counts[off..off + RUN_BUCKETS];
                let n: u64 = row.iter().sum();
                if n == 0 {
                    return Err(ModelError::EmptyCell {
                        bases: bases.bits(),
                        outs,
                    });
                }
                for (dst, &c) in probs[off..off + RUN_BUCKETS].iter_mut().zip(row) {
                    *dst = c as f64 / n as f64;
                }
            }
        }
        Ok(RunDistributionTable { regime, probs })
    }

    /// Wrap precomputed probabilities, checking shape and row sums.
    pub fn from_probabilities(regime: RunRegime, probs: Vec<f64>, tolerance: f64) -> ModelResult<Self> {
        let table = RunDistributionTable { regime, probs };
        table.validate(tolerance)?;
        Ok(table)
    }

    /// Elementwise average of the two regimes.
    pub fn blend(a: &RunDistributionTable, b: &RunDistributionTable) -> RunDistributionTable {
        let probs = a
            .probs
            .iter()
            .zip(&b.probs)
            .map(|(x, y)| (x + y) / 2.0)
            .collect();
        RunDistributionTable {
            regime: a.regime,
            probs,
        }
    }

    pub fn regime(&self) -> RunRegime {
        self.regime
    }

    /// P(runs | bases, outs) for runs 0..=14.
    pub fn pmf(&self, bases: BaseState, outs: u8) -> ModelResult<&[f64]> {
        let off = cell_offset(bases, check_outs(outs)?);
        Ok(&self.probs[off..off + RUN_BUCKETS])
    }

    /// Mean rest-of-inning runs for a cell (run expectancy).
    pub fn expected_runs(&self, bases: BaseState, outs: u8) -> ModelResult<f64> {
        Ok(self
            .pmf(bases, outs)?
            .iter()
            .enumerate()
            .map(|(r, p)| r as f64 * p)
            .sum())
    }

    /// Every row must be a distribution; never renormalizes.
    pub fn validate(&self, tolerance: f64) -> ModelResult<()> {
        let expected = BASE_STATES * OUT_STATES * RUN_BUCKETS;
        if self.probs.len() != expected {
            return Err(ModelError::ShapeMismatch {
                what: format!("{:?} run distribution", self.regime),
                expected,
                got: self.probs.len(),
            });
        }
        for bases in BaseState::all() {
            for outs in 0..OUT_STATES as u8 {
                let what = format!(
                    "{:?} run distribution bases={:#05b} outs={}",
                    self.regime,
                    bases.bits(),
                    outs
                );
                check_distribution(&what, self.pmf(bases, outs)?, tolerance)?;
            }
        }
        Ok(())
    }
}

fn cell_offset(bases: BaseState, outs: u8) -> usize {
    (bases.index() * OUT_STATES + outs as usize) * RUN_BUCKETS
}

/// The two estimated regimes.
#[derive(Debug, Clone)]
pub struct RunDistributions {
    pub normal: RunDistributionTable,
    pub need_one_run: RunDistributionTable,
}

impl RunDistributions {
    pub fn validate(&self, tolerance: f64) -> ModelResult<()> {
        self.normal.validate(tolerance)?;
        self.need_one_run.validate(tolerance)
    }

    pub fn get(&self, regime: RunRegime) -> &RunDistributionTable {
        match regime {
            RunRegime::Normal => &self.normal,
            RunRegime::NeedOneRun => &self.need_one_run,
        }
    }

    pub fn blended(&self) -> RunDistributionTable {
        RunDistributionTable::blend(&self.normal, &self.need_one_run)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Geometric-ish rest-of-inning runs: more runners and fewer outs score more.
    pub(crate) fn synthetic_table(regime: RunRegime, boost: f64) -> RunDistributionTable {
        let mut probs = Vec::with_capacity(BASE_STATES * OUT_STATES * RUN_BUCKETS);
        for bases in BaseState::all() {
            for outs in 0..OUT_STATES {
                let mean = (0.3 + 0.35 * bases.bit_count() as f64) * (3 - outs) as f64 / 3.0 + boost;
                let q = mean / (1.0 + mean);
                let mut row: Vec<f64> = (0..RUN_BUCKETS).map(|r| (1.0 - q) * q.powi(r as i32)).collect();
                let tail: f64 = 1.0 - row[..RUN_BUCKETS - 1].iter().sum::<f64>();
                row[RUN_BUCKETS - 1] = tail;
                probs.extend(row);
            }
        }
        RunDistributionTable::from_probabilities(regime, probs, 1e-9).unwrap()
    }

    #[test]
    fn counts_normalize_per_cell() {
        let mut counts = RunCounts::default();
        for bases in BaseState::all() {
            for outs in 0..3 {
                counts.record(bases, outs, 0).unwrap();
                counts.record(bases, outs, 0).unwrap();
                counts.record(bases, outs, 1).unwrap();
                counts.record(bases, outs, 20).unwrap();
            }
        }
        let table = RunDistributionTable::from_counts(RunRegime::Normal, &counts).unwrap();
        table.validate(1e-6).unwrap();
        let row = table.pmf(BaseState::LOADED, 2).unwrap();
        assert_relative_eq!(row[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(row[1], 0.25, epsilon = 1e-12);
        assert_relative_eq!(row[RUN_BUCKETS - 1], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn empty_cell_fails_the_build() {
        let mut counts = RunCounts::default();
        counts.record(BaseState::EMPTY, 0, 1).unwrap();
        let err = RunDistributionTable::from_counts(RunRegime::Normal, &counts).unwrap_err();
        assert!(matches!(err, ModelError::EmptyCell { .. }));
    }

    #[test]
    fn unnormalized_row_is_rejected_not_renormalized() {
        let mut probs = synthetic_table(RunRegime::Normal, 0.0).probs;
        probs[3] += 0.01;
        let err = RunDistributionTable::from_probabilities(RunRegime::Normal, probs, 1e-6).unwrap_err();
        assert!(matches!(err, ModelError::NotNormalized { .. }));
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let err = RunDistributionTable::from_probabilities(RunRegime::Normal, vec![1.0], 1e-6).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));
    }

    #[test]
    fn both_regimes_and_blend_sum_to_one() {
        let dists = RunDistributions {
            normal: synthetic_table(RunRegime::Normal, 0.0),
            need_one_run: synthetic_table(RunRegime::NeedOneRun, 0.1),
        };
        dists.validate(1e-6).unwrap();
        dists.blended().validate(1e-6).unwrap();
    }

    #[test]
    fn blend_is_elementwise_mean() {
        let a = synthetic_table(RunRegime::Normal, 0.0);
        let b = synthetic_table(RunRegime::NeedOneRun, 0.2);
        let m = RunDistributionTable::blend(&a, &b);
        let (pa, pb, pm) = (
            a.pmf(BaseState::EMPTY, 1).unwrap(),
            b.pmf(BaseState::EMPTY, 1).unwrap(),
            m.pmf(BaseState::EMPTY, 1).unwrap(),
        );
        for r in 0..RUN_BUCKETS {
            assert_relative_eq!(pm[r], (pa[r] + pb[r]) / 2.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn regime_classification() {
        assert_eq!(RunRegime::classify(3, 9, 5), Some(RunRegime::Normal));
        assert_eq!(RunRegime::classify(9, 9, 0), Some(RunRegime::NeedOneRun));
        assert_eq!(RunRegime::classify(11, 9, -1), Some(RunRegime::NeedOneRun));
        assert_eq!(RunRegime::classify(9, 9, -2), None);
        assert_eq!(RunRegime::classify(9, 9, 1), None);
    }

    #[test]
    fn run_expectancy_grows_with_runners() {
        let t = synthetic_table(RunRegime::Normal, 0.0);
        let empty = t.expected_runs(BaseState::EMPTY, 0).unwrap();
        let loaded = t.expected_runs(BaseState::LOADED, 0).unwrap();
        assert!(loaded > empty);
    }
}
