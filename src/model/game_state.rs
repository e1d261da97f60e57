//! Game states and the rules that move between them.
//!
//! Innings are bucketed: indices `0..regulation_innings` are the regulation
//! innings, and the single index `regulation_innings` stands for every extra
//! inning. Extra innings are treated as stationary except that each half
//! starts with a runner placed on second.

use serde::{Deserialize, Serialize};

use super::base_out::{check_outs, BaseState, OUT_STATES};
use super::transition::Transition;
use crate::error::{ModelError, ModelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Half {
    /// Away team batting.
    Top,
    /// Home team batting.
    Bottom,
}

impl Half {
    pub const ALL: [Half; 2] = [Half::Top, Half::Bottom];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Half::Top => "top",
            Half::Bottom => "bottom",
        }
    }

    /// Sign applied to runs when folding them into home-minus-away.
    pub fn run_sign(self) -> i32 {
        match self {
            Half::Top => -1,
            Half::Bottom => 1,
        }
    }
}

/// Rule constants shared by every table in one artifact set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameRules {
    pub regulation_innings: usize,
    /// Run differential saturates at ±this bound.
    pub max_run_diff: i32,
    /// P(home wins | game reaches extra innings tied).
    pub home_extra_inning_win_rate: f64,
    /// Each extra-inning half starts with a runner on second.
    pub extra_inning_runner_on_second: bool,
}

impl Default for GameRules {
    fn default() -> Self {
        GameRules {
            regulation_innings: 9,
            max_run_diff: 30,
            home_extra_inning_win_rate: 0.5,
            extra_inning_runner_on_second: true,
        }
    }
}

impl GameRules {
    /// Index of the last regulation inning.
    pub fn final_inning(&self) -> usize {
        self.regulation_innings - 1
    }

    /// Index of the shared extra-inning bucket.
    pub fn extra_inning(&self) -> usize {
        self.regulation_innings
    }

    /// Number of inning buckets, including extras.
    pub fn inning_buckets(&self) -> usize {
        self.regulation_innings + 1
    }

    pub fn run_diff_slots(&self) -> usize {
        (2 * self.max_run_diff + 1) as usize
    }

    /// Map a 1-based inning number to its bucket.
    pub fn inning_index(&self, inning: u32) -> usize {
        (inning.max(1) as usize - 1).min(self.extra_inning())
    }

    pub fn saturate(&self, run_diff: i32) -> i32 {
        run_diff.clamp(-self.max_run_diff, self.max_run_diff)
    }

    /// Bases occupied when a half-inning in `inning` begins.
    pub fn starting_bases(&self, inning: usize) -> BaseState {
        if inning == self.extra_inning() && self.extra_inning_runner_on_second {
            BaseState::RUNNER_ON_SECOND
        } else {
            BaseState::EMPTY
        }
    }

    /// Whether the home team bats with the game on the line: a lead ends it.
    pub fn is_walk_off_half(&self, inning: usize, half: Half) -> bool {
        half == Half::Bottom && inning >= self.final_inning()
    }

    /// First state of the half-inning after (`inning`, `half`).
    pub fn next_half_start(&self, inning: usize, half: Half, run_diff: i32) -> GameState {
        let (inning, half) = match half {
            Half::Top => (inning, Half::Bottom),
            Half::Bottom => ((inning + 1).min(self.extra_inning()), Half::Top),
        };
        GameState {
            inning,
            half,
            bases: self.starting_bases(inning),
            outs: 0,
            run_diff: self.saturate(run_diff),
        }
    }

    /// Where a play leaves the game.
    ///
    /// In a walk-off half the game ends as soon as the home team leads, and
    /// ends with the side retired while the home team trails. A tie with the
    /// side retired goes on to the extra-inning bucket.
    pub fn successor(&self, state: &GameState, play: &Transition) -> Successor {
        let run_diff = self.saturate(state.run_diff + state.half.run_sign() * play.runs as i32);
        if self.is_walk_off_half(state.inning, state.half) {
            if run_diff > 0 {
                return Successor::Final { home_wins: true };
            }
            if play.side_retired() && run_diff < 0 {
                return Successor::Final { home_wins: false };
            }
        }
        if play.side_retired() {
            Successor::Live(self.next_half_start(state.inning, state.half, run_diff))
        } else {
            Successor::Live(GameState {
                bases: play.bases,
                outs: play.outs,
                run_diff,
                ..*state
            })
        }
    }
}

/// Key into the win-probability and leverage tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameState {
    pub inning: usize,
    pub half: Half,
    pub bases: BaseState,
    pub outs: u8,
    /// Home minus away.
    pub run_diff: i32,
}

impl GameState {
    /// Validated constructor; the run differential saturates.
    pub fn new(
        rules: &GameRules,
        inning: usize,
        half: Half,
        bases: BaseState,
        outs: u8,
        run_diff: i32,
    ) -> ModelResult<Self> {
        if inning > rules.extra_inning() {
            return Err(ModelError::InningOutOfRange {
                index: inning,
                max: rules.extra_inning(),
            });
        }
        Ok(GameState {
            inning,
            half,
            bases,
            outs: check_outs(outs)?,
            run_diff: rules.saturate(run_diff),
        })
    }

    /// Flat index into a table shaped [inning, half, bases, outs, run diff].
    pub fn table_index(&self, rules: &GameRules) -> ModelResult<usize> {
        if self.inning > rules.extra_inning() {
            return Err(ModelError::InningOutOfRange {
                index: self.inning,
                max: rules.extra_inning(),
            });
        }
        check_outs(self.outs)?;
        if self.run_diff.abs() > rules.max_run_diff {
            return Err(ModelError::RunDiffOutOfRange {
                value: self.run_diff,
                bound: rules.max_run_diff,
            });
        }
        let slot = (self.run_diff + rules.max_run_diff) as usize;
        let cell = ((self.inning * 2 + self.half.index()) * 8 + self.bases.index()) * OUT_STATES
            + self.outs as usize;
        Ok(cell * rules.run_diff_slots() + slot)
    }
}

/// Outcome of applying a play to a game state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Successor {
    Live(GameState),
    Final { home_wins: bool },
}
