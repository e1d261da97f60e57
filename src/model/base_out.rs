//! Baserunner occupancy and out counts.
//!
//! A [`BaseState`] is a 3-bit mask: bit k set means a runner stands on base
//! k+1. Runners are always enumerated closest-to-scoring first (lead, trail,
//! trail2); every consumer of per-runner advancement codes relies on that
//! order.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Number of base states (0b000..=0b111).
pub const BASE_STATES: usize = 8;
/// Out counts usable as table keys (0, 1, 2).
pub const OUT_STATES: usize = 3;
/// Outs that retire the side. Never a lookup key.
pub const SIDE_RETIRED: u8 = 3;

/// Check that `outs` is a lookup key (0..=2).
pub fn check_outs(outs: u8) -> ModelResult<u8> {
    if (outs as usize) < OUT_STATES {
        Ok(outs)
    } else {
        Err(ModelError::OutsOutOfRange(outs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct BaseState(u8);

impl BaseState {
    pub const EMPTY: BaseState = BaseState(0);
    pub const RUNNER_ON_SECOND: BaseState = BaseState(0b010);
    pub const LOADED: BaseState = BaseState(0b111);

    pub fn new(bits: u8) -> ModelResult<Self> {
        if (bits as usize) < BASE_STATES {
            Ok(BaseState(bits))
        } else {
            Err(ModelError::BaseStateOutOfRange(bits))
        }
    }

    /// All eight base states in mask order.
    pub fn all() -> impl Iterator<Item = BaseState> {
        (0..BASE_STATES as u8).map(BaseState)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether `base` (1..=3) is occupied.
    pub fn is_occupied(self, base: u8) -> bool {
        (1..=3).contains(&base) && self.0 & (1 << (base - 1)) != 0
    }

    pub fn bit_count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Highest occupied base.
    pub fn lead_base(self) -> Option<u8> {
        self.occupied().next()
    }

    /// Second-highest occupied base.
    pub fn trail_base(self) -> Option<u8> {
        self.occupied().nth(1)
    }

    /// Lowest base when all three are occupied.
    pub fn trail2_base(self) -> Option<u8> {
        self.occupied().nth(2)
    }

    /// Present runners with their roles, lead first.
    pub fn runners(self) -> impl Iterator<Item = (RunnerRole, u8)> {
        RunnerRole::ALL.into_iter().zip(self.occupied())
    }

    /// Occupied base numbers, descending.
    fn occupied(self) -> impl Iterator<Item = u8> {
        (1..=3u8).rev().filter(move |&b| self.is_occupied(b))
    }
}

impl TryFrom<u8> for BaseState {
    type Error = ModelError;

    fn try_from(bits: u8) -> ModelResult<Self> {
        BaseState::new(bits)
    }
}

impl From<BaseState> for u8 {
    fn from(b: BaseState) -> u8 {
        b.0
    }
}

/// Position of a runner in the lead-first enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerRole {
    Lead,
    Trail,
    Trail2,
}

impl RunnerRole {
    pub const ALL: [RunnerRole; 3] = [RunnerRole::Lead, RunnerRole::Trail, RunnerRole::Trail2];

    pub fn as_str(self) -> &'static str {
        match self {
            RunnerRole::Lead => "lead",
            RunnerRole::Trail => "trail",
            RunnerRole::Trail2 => "trail2",
        }
    }
}

/// What happened to one baserunner on a play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvancementCode {
    Out,
    Adv0,
    Adv1,
    Adv2,
    Scored,
}

impl AdvancementCode {
    pub const ALL: [AdvancementCode; 5] = [
        AdvancementCode::Out,
        AdvancementCode::Adv0,
        AdvancementCode::Adv1,
        AdvancementCode::Adv2,
        AdvancementCode::Scored,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}
