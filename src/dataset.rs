//! Historical plate appearances and batted-ball inputs.
//!
//! The batch job reads two kinds of JSON record: plate appearances, from
//! which every aggregate the tables need is counted, and batted balls with
//! predictor output, which feed the expected win probability evaluator.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ModelError, ModelResult};
use crate::model::advancement::{AdvancementEntry, BattedBallFeatures, TabulatedAdvancementModel};
use crate::model::base_out::BaseState;
use crate::model::expected::{HitTypeProbabilities, PlayContext};
use crate::model::game_state::{GameRules, GameState, Half};
use crate::model::run_distribution::{RunCounts, RunDistributionTable, RunDistributions, RunRegime};
use crate::model::transition::BipOutcome;
use crate::model::transition_matrix::EventFrequencies;

/// Game situation as recorded in play-by-play data, before a play.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordedState {
    /// 1-based inning number, extras included.
    pub inning: u32,
    pub half: Half,
    pub bases: BaseState,
    pub outs: u8,
    pub home_score: i32,
    pub away_score: i32,
}

impl RecordedState {
    pub fn run_diff(&self) -> i32 {
        self.home_score - self.away_score
    }

    /// Batting team's score minus the fielding team's.
    pub fn batting_margin(&self) -> i32 {
        self.run_diff() * self.half.run_sign()
    }

    pub fn game_state(&self, rules: &GameRules) -> ModelResult<GameState> {
        GameState::new(
            rules,
            rules.inning_index(self.inning),
            self.half,
            self.bases,
            self.outs,
            self.run_diff(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateAppearanceEvent {
    Strikeout,
    /// Walks and hit-by-pitches.
    Walk,
    Out,
    Single,
    Double,
    Triple,
    HomeRun,
}

impl PlateAppearanceEvent {
    pub fn in_play_outcome(self) -> Option<BipOutcome> {
        match self {
            PlateAppearanceEvent::Strikeout | PlateAppearanceEvent::Walk => None,
            PlateAppearanceEvent::Out => Some(BipOutcome::Out),
            PlateAppearanceEvent::Single => Some(BipOutcome::Single),
            PlateAppearanceEvent::Double => Some(BipOutcome::Double),
            PlateAppearanceEvent::Triple => Some(BipOutcome::Triple),
            PlateAppearanceEvent::HomeRun => Some(BipOutcome::HomeRun),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateAppearance {
    pub game_id: String,
    #[serde(flatten)]
    pub state: RecordedState,
    pub event: PlateAppearanceEvent,
    /// Runs scored on the play itself.
    pub event_runs: u32,
    /// Runs scored later in the same half-inning.
    pub rest_of_inning_runs: u32,
    /// Last plate appearance of the game.
    #[serde(default)]
    pub game_end: bool,
}

impl PlateAppearance {
    pub fn remainder_runs(&self) -> u32 {
        self.event_runs + self.rest_of_inning_runs
    }

    /// Home minus away once the play's runs are in.
    pub fn run_diff_after(&self) -> i32 {
        self.state.run_diff() + self.state.half.run_sign() * self.event_runs as i32
    }
}

/// Historical plate appearances in game order.
#[derive(Debug, Clone, Default)]
pub struct HistoricalDataset {
    plate_appearances: Vec<PlateAppearance>,
}

impl HistoricalDataset {
    pub fn from_records(plate_appearances: Vec<PlateAppearance>) -> Self {
        HistoricalDataset { plate_appearances }
    }

    /// Read a JSON array of plate appearances.
    pub fn load(path: &Path) -> Result<Self> {
        let records: Vec<PlateAppearance> = read_json(path)?;
        info!(
            path = %path.display(),
            plate_appearances = records.len(),
            "Historical dataset loaded"
        );
        Ok(Self::from_records(records))
    }

    /// Rest-of-inning run tallies per regime, normalized.
    pub fn run_distributions(&self, rules: &GameRules) -> ModelResult<RunDistributions> {
        let mut normal = RunCounts::default();
        let mut need_one_run = RunCounts::default();
        let regulation = rules.regulation_innings as u32;
        for pa in &self.plate_appearances {
            let s = &pa.state;
            let counts = match RunRegime::classify(s.inning, regulation, s.batting_margin()) {
                Some(RunRegime::Normal) => &mut normal,
                Some(RunRegime::NeedOneRun) => &mut need_one_run,
                None => continue,
            };
            counts.record(s.bases, s.outs, pa.remainder_runs())?;
        }
        info!(
            normal = normal.total(),
            need_one_run = need_one_run.total(),
            "Run-count aggregates collected"
        );
        Ok(RunDistributions {
            normal: RunDistributionTable::from_counts(RunRegime::Normal, &normal)?,
            need_one_run: RunDistributionTable::from_counts(RunRegime::NeedOneRun, &need_one_run)?,
        })
    }

    /// League event mix over innings before the final regulation inning.
    pub fn event_frequencies(&self, rules: &GameRules) -> ModelResult<EventFrequencies> {
        let regulation = rules.regulation_innings as u32;
        let (mut strikeouts, mut walks, mut total) = (0u64, 0u64, 0u64);
        let mut outcomes = [0u64; 5];
        for pa in self
            .plate_appearances
            .iter()
            .filter(|pa| pa.state.inning < regulation)
        {
            total += 1;
            match pa.event {
                PlateAppearanceEvent::Strikeout => strikeouts += 1,
                PlateAppearanceEvent::Walk => walks += 1,
                other => {
                    if let Some(outcome) = other.in_play_outcome() {
                        outcomes[outcome.index()] += 1;
                    }
                }
            }
        }
        let in_play: u64 = outcomes.iter().sum();
        if total == 0 {
            return Err(ModelError::NoObservations("regulation plate appearance".into()));
        }
        if in_play == 0 {
            return Err(ModelError::NoObservations("ball in play".into()));
        }
        let n = total as f64;
        let freqs = EventFrequencies {
            strikeout: strikeouts as f64 / n,
            walk: walks as f64 / n,
            in_play: in_play as f64 / n,
            in_play_outcomes: outcomes.map(|c| c as f64 / in_play as f64),
        };
        info!(
            plate_appearances = total,
            strikeout = freqs.strikeout,
            walk = freqs.walk,
            in_play = freqs.in_play,
            "Event frequencies estimated"
        );
        Ok(freqs)
    }

    /// Share of extra-inning games won by the home team, `None` when the
    /// dataset holds no game that ended in extras.
    pub fn extra_inning_home_win_rate(&self, rules: &GameRules) -> Option<f64> {
        let regulation = rules.regulation_innings as u32;
        let (mut games, mut home_wins) = (0u64, 0u64);
        for pa in self
            .plate_appearances
            .iter()
            .filter(|pa| pa.game_end && pa.state.inning > regulation)
        {
            games += 1;
            if pa.run_diff_after() > 0 {
                home_wins += 1;
            }
        }
        (games > 0).then(|| home_wins as f64 / games as f64)
    }

    /// One game state per plate appearance, for leverage scaling.
    pub fn reference_states(&self, rules: &GameRules) -> ModelResult<Vec<GameState>> {
        self.plate_appearances
            .iter()
            .map(|pa| pa.state.game_state(rules))
            .collect()
    }
}

/// What actually followed a batted ball.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RealizedOutcome {
    /// Situation at the next plate appearance; absent when the play ended
    /// the game.
    #[serde(default)]
    pub next: Option<RecordedState>,
    /// Home minus away after the play.
    pub run_diff_after: i32,
    /// Whether the batted ball was converted into an out.
    #[serde(default)]
    pub is_out: Option<bool>,
}

/// One batted ball with live predictor output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattedBallPlay {
    pub play_id: String,
    #[serde(flatten)]
    pub state: RecordedState,
    pub out_probability: f64,
    pub hit_types: HitTypeProbabilities,
    #[serde(default)]
    pub features: Option<BattedBallFeatures>,
    #[serde(default)]
    pub realized: Option<RealizedOutcome>,
}

impl BattedBallPlay {
    pub fn context(&self, rules: &GameRules) -> ModelResult<PlayContext> {
        Ok(PlayContext {
            state: self.state.game_state(rules)?,
            out_probability: self.out_probability,
            hit_types: self.hit_types,
            features: self.features,
        })
    }
}

/// Read a tabulated advancement model: a JSON array of per-situation rows.
pub fn load_advancement_table(path: &Path) -> Result<TabulatedAdvancementModel> {
    let entries: Vec<AdvancementEntry> = read_json(path)?;
    let model = TabulatedAdvancementModel::from_entries(entries);
    if model.is_empty() {
        bail!("{}: advancement table has no rows", path.display());
    }
    info!(path = %path.display(), situations = model.len(), "Advancement table loaded");
    Ok(model)
}

pub fn load_batted_balls(path: &Path) -> Result<Vec<BattedBallPlay>> {
    let plays: Vec<BattedBallPlay> = read_json(path)?;
    info!(path = %path.display(), plays = plays.len(), "Batted balls loaded");
    Ok(plays)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))
}
