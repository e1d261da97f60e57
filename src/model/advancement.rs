//! Runner advancement predictions and their combinatorial enumeration.
//!
//! The predictor only supplies *marginal* distributions, one per present
//! runner. A joint outcome is weighted by the product of the marginals; this
//! independence assumption is part of the model and is used identically by
//! the transition-matrix builder and the expected-win-probability evaluator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::base_out::{AdvancementCode, BaseState, RunnerRole};
use super::transition::BipOutcome;
use crate::error::{check_distribution, ModelError, ModelResult};

/// Live batted-ball measurements a feature-aware predictor can condition on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BattedBallFeatures {
    /// Spray angle in radians, 0 = straightaway center.
    pub theta: f64,
    pub launch_speed: f64,
    pub launch_angle: f64,
}

/// One runner's question to the predictor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdvancementQuery {
    pub outcome: BipOutcome,
    pub role: RunnerRole,
    pub base: u8,
    pub outs: u8,
    pub features: Option<BattedBallFeatures>,
}

impl AdvancementQuery {
    /// Queries for every runner on `bases`, lead first.
    pub fn for_runners(
        bases: BaseState,
        outs: u8,
        outcome: BipOutcome,
        features: Option<BattedBallFeatures>,
    ) -> Vec<AdvancementQuery> {
        bases
            .runners()
            .map(|(role, base)| AdvancementQuery {
                outcome,
                role,
                base,
                outs,
                features,
            })
            .collect()
    }
}

/// Categorical distribution over [`AdvancementCode`], indexed by code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 5]", into = "[f64; 5]")]
pub struct AdvancementDistribution([f64; 5]);

impl AdvancementDistribution {
    /// Tolerance applied when a distribution is deserialized.
    pub const LOAD_TOLERANCE: f64 = 1e-6;

    pub fn new(probs: [f64; 5], tolerance: f64) -> ModelResult<Self> {
        check_distribution("advancement distribution", &probs, tolerance)?;
        Ok(AdvancementDistribution(probs))
    }

    /// All mass on one code.
    pub fn certain(code: AdvancementCode) -> Self {
        let mut probs = [0.0; 5];
        probs[code.index()] = 1.0;
        AdvancementDistribution(probs)
    }

    pub fn prob(&self, code: AdvancementCode) -> f64 {
        self.0[code.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (AdvancementCode, f64)> + '_ {
        AdvancementCode::ALL.iter().map(move |&c| (c, self.0[c.index()]))
    }
}

impl TryFrom<[f64; 5]> for AdvancementDistribution {
    type Error = ModelError;

    fn try_from(probs: [f64; 5]) -> ModelResult<Self> {
        AdvancementDistribution::new(probs, Self::LOAD_TOLERANCE)
    }
}

impl From<AdvancementDistribution> for [f64; 5] {
    fn from(d: AdvancementDistribution) -> Self {
        d.0
    }
}

/// Contract for the external runner-advancement predictor.
pub trait RunnerAdvancementModel: Send + Sync {
    fn predict(&self, query: &AdvancementQuery) -> ModelResult<AdvancementDistribution>;

    /// Answer several queries in one call. Implementations backed by a
    /// remote or vectorised predictor should override this.
    fn predict_batch(
        &self,
        queries: &[AdvancementQuery],
    ) -> ModelResult<Vec<AdvancementDistribution>> {
        queries.iter().map(|q| self.predict(q)).collect()
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// One row of a tabulated advancement model file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancementEntry {
    pub outcome: BipOutcome,
    pub role: RunnerRole,
    pub base: u8,
    pub outs: u8,
    /// Probabilities for out, adv0, adv1, adv2, scored.
    pub probs: AdvancementDistribution,
}

/// Aggregate advancement model: a lookup keyed by situation. Batted-ball
/// features are ignored.
#[derive(Debug, Clone, Default)]
pub struct TabulatedAdvancementModel {
    table: HashMap<(BipOutcome, RunnerRole, u8, u8), AdvancementDistribution>,
}

impl TabulatedAdvancementModel {
    pub fn from_entries(entries: impl IntoIterator<Item = AdvancementEntry>) -> Self {
        let table = entries
            .into_iter()
            .map(|e| ((e.outcome, e.role, e.base, e.outs), e.probs))
            .collect();
        TabulatedAdvancementModel { table }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl RunnerAdvancementModel for TabulatedAdvancementModel {
    fn predict(&self, q: &AdvancementQuery) -> ModelResult<AdvancementDistribution> {
        self.table
            .get(&(q.outcome, q.role, q.base, q.outs))
            .copied()
            .ok_or_else(|| ModelError::MissingAdvancement {
                outcome: q.outcome.as_str().to_string(),
                role: q.role.as_str().to_string(),
                base: q.base,
                outs: q.outs,
            })
    }

    fn name(&self) -> &str {
        "tabulated"
    }
}

/// Every joint advancement outcome with non-zero weight.
///
/// `marginals` holds one distribution per present runner, lead first. The
/// empty slice yields a single empty combination with weight 1.
pub fn enumerate_advancements(
    marginals: &[AdvancementDistribution],
) -> Vec<(Vec<AdvancementCode>, f64)> {
    let mut combos: Vec<(Vec<AdvancementCode>, f64)> = vec![(Vec::new(), 1.0)];
    for dist in marginals {
        let mut next = Vec::with_capacity(combos.len() * AdvancementCode::ALL.len());
        for (codes, weight) in &combos {
            for (code, p) in dist.iter() {
                if p == 0.0 {
                    continue;
                }
                let mut extended = codes.clone();
                extended.push(code);
                next.push((extended, weight * p));
            }
        }
        combos = next;
    }
    combos
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use AdvancementCode::*;

    fn dist(p: [f64; 5]) -> AdvancementDistribution {
        AdvancementDistribution::new(p, 1e-9).unwrap()
    }

    #[test]
    fn no_runners_yields_single_empty_combination() {
        let combos = enumerate_advancements(&[]);
        assert_eq!(combos.len(), 1);
        assert!(combos[0].0.is_empty());
        assert_eq!(combos[0].1, 1.0);
    }

    #[test]
    fn combinations_are_product_of_marginals() {
        let lead = dist([0.0, 0.0, 0.5, 0.0, 0.5]);
        let trail = dist([0.1, 0.0, 0.9, 0.0, 0.0]);
        let combos = enumerate_advancements(&[lead, trail]);
        assert_eq!(combos.len(), 4);
        let total: f64 = combos.iter().map(|(_, w)| w).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);

        let (_, w) = combos
            .iter()
            .find(|(c, _)| c.as_slice() == [Scored, Adv1])
            .unwrap();
        assert_relative_eq!(*w, 0.45, epsilon = 1e-12);
    }

    #[test]
    fn bases_loaded_enumeration_is_bounded_by_125() {
        let uniform = dist([0.2; 5]);
        let combos = enumerate_advancements(&[uniform, uniform, uniform]);
        assert_eq!(combos.len(), 125);
        assert!(combos.iter().all(|(codes, _)| codes.len() == 3));
    }

    #[test]
    fn queries_follow_runner_order() {
        let bases = BaseState::new(0b101).unwrap();
        let qs = AdvancementQuery::for_runners(bases, 1, BipOutcome::Single, None);
        assert_eq!(qs.len(), 2);
        assert_eq!((qs[0].role, qs[0].base), (RunnerRole::Lead, 3));
        assert_eq!((qs[1].role, qs[1].base), (RunnerRole::Trail, 1));
    }

    #[test]
    fn tabulated_model_reports_missing_situations() {
        let model = TabulatedAdvancementModel::from_entries(vec![AdvancementEntry {
            outcome: BipOutcome::Single,
            role: RunnerRole::Lead,
            base: 1,
            outs: 0,
            probs: AdvancementDistribution::certain(Adv1),
        }]);
        let q = AdvancementQuery {
            outcome: BipOutcome::Single,
            role: RunnerRole::Lead,
            base: 1,
            outs: 0,
            features: None,
        };
        assert_eq!(model.predict(&q).unwrap().prob(Adv1), 1.0);

        let missing = AdvancementQuery { outs: 2, ..q };
        assert!(matches!(
            model.predict(&missing),
            Err(ModelError::MissingAdvancement { .. })
        ));
    }

    #[test]
    fn unnormalized_distribution_fails_to_deserialize() {
        let json = r#"{"outcome":"out","role":"lead","base":3,"outs":0,"probs":[0.5,0.5,0.5,0,0]}"#;
        assert!(serde_json::from_str::<AdvancementEntry>(json).is_err());
    }
}
