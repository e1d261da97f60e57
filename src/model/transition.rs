//! Single-play state transitions.
//!
//! [`map_transition`] is the one place where a play's event type and the
//! per-runner advancement codes turn into a new base/out state and a run
//! count. The transition-matrix builder and the expected-win-probability
//! evaluator both route every enumerated combination through it.

use serde::{Deserialize, Serialize};

use super::base_out::{check_outs, AdvancementCode, BaseState, SIDE_RETIRED};
use crate::error::{ModelError, ModelResult};

/// What the batter did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattedEvent {
    Out,
    Single,
    Double,
    Triple,
    HomeRun,
    Walk,
}

impl BattedEvent {
    /// Whether the runners' advancement codes decide where they end up.
    pub fn consults_runners(self) -> bool {
        !matches!(self, BattedEvent::HomeRun | BattedEvent::Walk)
    }
}

/// Ball-in-play outcome categories, in the order the outcome distributions
/// are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BipOutcome {
    Out,
    Single,
    Double,
    Triple,
    HomeRun,
}

impl BipOutcome {
    pub const ALL: [BipOutcome; 5] = [
        BipOutcome::Out,
        BipOutcome::Single,
        BipOutcome::Double,
        BipOutcome::Triple,
        BipOutcome::HomeRun,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BipOutcome::Out => "out",
            BipOutcome::Single => "single",
            BipOutcome::Double => "double",
            BipOutcome::Triple => "triple",
            BipOutcome::HomeRun => "home_run",
        }
    }
}

impl From<BipOutcome> for BattedEvent {
    fn from(o: BipOutcome) -> Self {
        match o {
            BipOutcome::Out => BattedEvent::Out,
            BipOutcome::Single => BattedEvent::Single,
            BipOutcome::Double => BattedEvent::Double,
            BipOutcome::Triple => BattedEvent::Triple,
            BipOutcome::HomeRun => BattedEvent::HomeRun,
        }
    }
}

/// Result of one play: outs in 0..=3, bases empty whenever outs == 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub outs: u8,
    pub bases: BaseState,
    pub runs: u8,
}

impl Transition {
    pub fn side_retired(&self) -> bool {
        self.outs >= SIDE_RETIRED
    }
}

/// Apply one play to a base/out state.
///
/// `codes` holds one advancement code per occupied base, lead runner first.
/// Home runs and walks ignore `codes`; for every other event the count must
/// match the number of runners.
pub fn map_transition(
    outs: u8,
    bases: BaseState,
    event: BattedEvent,
    codes: &[AdvancementCode],
) -> ModelResult<Transition> {
    let mut outs = check_outs(outs)?;
    let entry = bases.bits();
    let mut runs = 0u8;

    let mut occupied = entry;
    if event.consults_runners() {
        if codes.len() != bases.bit_count() {
            return Err(ModelError::AdvancementCodeCount {
                bases: entry,
                expected: bases.bit_count(),
                got: codes.len(),
            });
        }
        // Sources are vacated and destinations collected separately so a
        // runner moving onto a base another runner is leaving is never lost.
        let mut arrivals = 0u8;
        for ((_, base), &code) in bases.runners().zip(codes) {
            match code {
                AdvancementCode::Out => outs += 1,
                AdvancementCode::Scored => runs += 1,
                AdvancementCode::Adv0 | AdvancementCode::Adv1 | AdvancementCode::Adv2 => {
                    let dest = base + (code.index() - AdvancementCode::Adv0.index()) as u8;
                    if dest >= 4 {
                        runs += 1;
                    } else {
                        arrivals |= 1 << (dest - 1);
                    }
                }
            }
        }
        occupied = arrivals;
    }

    match event {
        BattedEvent::Out => outs += 1,
        BattedEvent::Single => occupied |= 0b001,
        BattedEvent::Double => occupied |= 0b010,
        BattedEvent::Triple => occupied |= 0b100,
        BattedEvent::HomeRun => {
            runs += entry.count_ones() as u8 + 1;
            occupied = 0;
        }
        BattedEvent::Walk => {
            for base in (1..=3u8).rev() {
                let bit = 1 << (base - 1);
                let lower = bit - 1;
                let forced = entry & bit != 0 && entry & lower == lower;
                if forced {
                    occupied &= !bit;
                    if base == 3 {
                        runs += 1;
                    } else {
                        occupied |= bit << 1;
                    }
                }
            }
            occupied |= 0b001;
        }
    }

    if outs >= SIDE_RETIRED {
        outs = SIDE_RETIRED;
        occupied = 0;
    }

    Ok(Transition {
        outs,
        bases: BaseState::new(occupied)?,
        runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use AdvancementCode::*;

    fn b(bits: u8) -> BaseState {
        BaseState::new(bits).unwrap()
    }

    #[test]
    fn single_with_two_runners_advancing_one_base_loads_the_bases() {
        let t = map_transition(0, b(0b011), BattedEvent::Single, &[Adv1, Adv1]).unwrap();
        assert_eq!(t, Transition { outs: 0, bases: b(0b111), runs: 0 });
    }

    #[test]
    fn grand_slam_clears_bases_and_ignores_codes() {
        let t = map_transition(1, b(0b111), BattedEvent::HomeRun, &[]).unwrap();
        assert_eq!(t, Transition { outs: 1, bases: b(0), runs: 4 });

        let with_codes =
            map_transition(1, b(0b111), BattedEvent::HomeRun, &[Out, Out, Adv0]).unwrap();
        assert_eq!(with_codes, t);
    }

    #[test]
    fn walk_with_runner_on_first_forces_him_to_second() {
        let t = map_transition(0, b(0b001), BattedEvent::Walk, &[]).unwrap();
        assert_eq!(t, Transition { outs: 0, bases: b(0b011), runs: 0 });
    }

    #[test]
    fn walk_only_moves_forced_runners() {
        // Runners on 1st and 3rd: 3rd is not forced, 1st goes to 2nd.
        let t = map_transition(2, b(0b101), BattedEvent::Walk, &[]).unwrap();
        assert_eq!(t, Transition { outs: 2, bases: b(0b111), runs: 0 });

        // Runner on 2nd only: nobody forced.
        let t = map_transition(0, b(0b010), BattedEvent::Walk, &[]).unwrap();
        assert_eq!(t.bases, b(0b011));
    }

    #[test]
    fn bases_loaded_walk_forces_in_a_run() {
        let t = map_transition(1, b(0b111), BattedEvent::Walk, &[Out, Out, Out]).unwrap();
        assert_eq!(t, Transition { outs: 1, bases: b(0b111), runs: 1 });
    }

    #[test]
    fn double_play_ends_the_inning_and_clears_the_bases() {
        // Runner on 1st doubled off, batter out, one already down.
        let t = map_transition(1, b(0b001), BattedEvent::Out, &[Out]).unwrap();
        assert_eq!(t, Transition { outs: 3, bases: b(0), runs: 0 });
    }

    #[test]
    fn sacrifice_fly_scores_runner_from_third() {
        let t = map_transition(0, b(0b100), BattedEvent::Out, &[Scored]).unwrap();
        assert_eq!(t, Transition { outs: 1, bases: b(0), runs: 1 });
    }

    #[test]
    fn advancing_past_home_counts_as_a_run() {
        let t = map_transition(0, b(0b010), BattedEvent::Double, &[Adv2]).unwrap();
        assert_eq!(t, Transition { outs: 0, bases: b(0b010), runs: 1 });
    }

    #[test]
    fn trail_runner_may_take_base_the_lead_runner_vacates() {
        // Lead on 2nd scores, trail on 1st moves to 2nd, batter singles.
        let t = map_transition(0, b(0b011), BattedEvent::Single, &[Scored, Adv1]).unwrap();
        assert_eq!(t, Transition { outs: 0, bases: b(0b011), runs: 1 });
    }

    #[test]
    fn wrong_code_count_is_rejected() {
        let err = map_transition(0, b(0b011), BattedEvent::Single, &[Adv1]).unwrap_err();
        assert!(matches!(err, ModelError::AdvancementCodeCount { expected: 2, got: 1, .. }));
    }

    #[test]
    fn three_outs_cannot_be_an_input() {
        assert!(map_transition(3, b(0), BattedEvent::Out, &[]).is_err());
    }

    #[test]
    fn every_combination_stays_in_range() {
        let events = [
            BattedEvent::Out,
            BattedEvent::Single,
            BattedEvent::Double,
            BattedEvent::Triple,
            BattedEvent::HomeRun,
            BattedEvent::Walk,
        ];
        for bases in BaseState::all() {
            let n = bases.bit_count() as u32;
            for outs in 0..3 {
                for event in events {
                    for combo in 0..5usize.pow(n) {
                        let codes: Vec<_> = (0..n)
                            .map(|k| AdvancementCode::ALL[combo / 5usize.pow(k) % 5])
                            .collect();
                        let t = map_transition(outs, bases, event, &codes).unwrap();
                        assert!(t.outs <= 3);
                        assert!(t.runs <= 4);
                        if t.outs == 3 {
                            assert_eq!(t.bases, BaseState::EMPTY);
                        }
                    }
                }
            }
        }
    }
}
