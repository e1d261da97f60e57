//! Batch commands: one function per build step, plus the all-in-one build
//! and the per-play expected win probability run.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::artifacts::{ArtifactDir, ArtifactSet};
use crate::config::{Command, Config};
use crate::dataset::{load_advancement_table, load_batted_balls, BattedBallPlay, HistoricalDataset};
use crate::db::models::PlayEvaluationRecord;
use crate::db::ArtifactStore;
use crate::error::ModelResult;
use crate::model::base_out::BaseState;
use crate::model::expected::{realized_next_wp, PlayEvaluation, PlayValuation};
use crate::model::{
    build_leverage_index, build_transition_tensor, solve, ExpectedWinProbability, GameRules,
    GameState, LeverageIndexTable, PlayContext, RunnerAdvancementModel, WinProbabilityTable,
};

pub fn run(config: &Config) -> Result<()> {
    let dir = ArtifactDir::new(&config.artifacts_dir, config.tolerance);
    match &config.command {
        Command::RunDist { plate_appearances } => run_dist(config, &dir, plate_appearances),
        Command::Transition {
            plate_appearances,
            advancement,
        } => transition(config, &dir, plate_appearances, advancement),
        Command::WinProb { plate_appearances } => {
            win_prob(config, &dir, plate_appearances.as_deref())
        }
        Command::Leverage { plate_appearances } => leverage(config, &dir, plate_appearances),
        Command::Build {
            plate_appearances,
            advancement,
            database,
            set_version,
        } => build(
            config,
            &dir,
            plate_appearances,
            advancement,
            database.as_deref(),
            set_version.as_deref(),
        ),
        Command::Xwp {
            plays,
            advancement,
            output,
            database,
            set_version,
        } => xwp(
            config,
            &dir,
            plays,
            advancement,
            output,
            database.as_deref(),
            set_version.as_deref(),
        ),
        Command::Sets {
            database,
            set_version,
            limit,
        } => sets(database, set_version.as_deref(), *limit),
    }
}

/// Explicit setting first, then the dataset estimate, then an even split.
fn extra_inning_win_rate(config: &Config, dataset: Option<&HistoricalDataset>) -> f64 {
    if let Some(rate) = config.extra_inning_home_win_rate {
        return rate;
    }
    match dataset.and_then(|d| d.extra_inning_home_win_rate(&config.base_rules())) {
        Some(rate) => {
            info!(rate, "Extra-inning home win rate estimated from dataset");
            rate
        }
        None => {
            warn!("No extra-inning games to estimate from; assuming 0.5");
            0.5
        }
    }
}

// ── Single steps ─────────────────────────────────────────────────────────────

fn run_dist(config: &Config, dir: &ArtifactDir, plate_appearances: &Path) -> Result<()> {
    let dataset = HistoricalDataset::load(plate_appearances)?;
    let runs = dataset
        .run_distributions(&config.base_rules())
        .context("building run distributions")?;
    runs.validate(config.tolerance)?;
    for table in [&runs.normal, &runs.need_one_run] {
        info!(
            regime = ?table.regime(),
            bases_empty_none_out = table.expected_runs(BaseState::EMPTY, 0)?,
            bases_loaded_none_out = table.expected_runs(BaseState::LOADED, 0)?,
            "Run expectancy"
        );
    }
    dir.save_run_distributions(&runs)
}

fn transition(
    config: &Config,
    dir: &ArtifactDir,
    plate_appearances: &Path,
    advancement: &Path,
) -> Result<()> {
    let dataset = HistoricalDataset::load(plate_appearances)?;
    let model = load_advancement_table(advancement)?;
    let freqs = dataset
        .event_frequencies(&config.base_rules())
        .context("estimating event frequencies")?;
    let tensor = build_transition_tensor(&freqs, &model, config.tolerance)
        .context("building transition tensor")?;
    dir.save_tensor(&tensor)
}

fn win_prob(config: &Config, dir: &ArtifactDir, plate_appearances: Option<&Path>) -> Result<()> {
    let dataset = plate_appearances.map(HistoricalDataset::load).transpose()?;
    let rules = config.rules(extra_inning_win_rate(config, dataset.as_ref()));
    let runs = dir.load_run_distributions()?;
    let wp = solve(&runs, &rules, config.tolerance).context("solving win probability")?;
    dir.save_win_probability(&wp)
}

fn leverage(config: &Config, dir: &ArtifactDir, plate_appearances: &Path) -> Result<()> {
    let dataset = HistoricalDataset::load(plate_appearances)?;
    let wp = dir.load_win_probability(&config.base_rules())?;
    let tensor = dir.load_tensor()?;
    let reference = dataset.reference_states(wp.rules())?;
    let li = build_leverage_index(&wp, &tensor, &reference).context("building leverage index")?;
    dir.save_leverage(&li)
}

// ── Full build ───────────────────────────────────────────────────────────────

/// Every table from one dataset, in memory. Nothing is written here.
pub fn build_all(
    config: &Config,
    dataset: &HistoricalDataset,
    model: &dyn RunnerAdvancementModel,
) -> Result<ArtifactSet> {
    let rules = config.rules(extra_inning_win_rate(config, Some(dataset)));
    let runs = dataset
        .run_distributions(&rules)
        .context("building run distributions")?;
    let freqs = dataset
        .event_frequencies(&rules)
        .context("estimating event frequencies")?;
    let tensor = build_transition_tensor(&freqs, model, config.tolerance)
        .context("building transition tensor")?;
    let win_probability = solve(&runs, &rules, config.tolerance).context("solving win probability")?;
    let reference = dataset.reference_states(&rules)?;
    let leverage = build_leverage_index(&win_probability, &tensor, &reference)
        .context("building leverage index")?;
    Ok(ArtifactSet {
        runs,
        tensor,
        win_probability,
        leverage,
    })
}

fn build(
    config: &Config,
    dir: &ArtifactDir,
    plate_appearances: &Path,
    advancement: &Path,
    database: Option<&str>,
    set_version: Option<&str>,
) -> Result<()> {
    let dataset = HistoricalDataset::load(plate_appearances)?;
    let model = load_advancement_table(advancement)?;

    let publish = match database {
        Some(path) => {
            let store = ArtifactStore::open(path)?;
            let version = set_version
                .map(str::to_string)
                .unwrap_or_else(|| Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
            if store.get_set(&version)?.is_some() {
                bail!("artifact set {version} is already published");
            }
            Some((store, version))
        }
        None => None,
    };

    let set = build_all(config, &dataset, &model)?;
    dir.save_all(&set)?;
    if let Some((store, version)) = publish {
        store.publish(&version, &set.win_probability, &set.leverage)?;
    }
    info!(artifacts = %dir.root().display(), "Build complete");
    Ok(())
}

// ── Expected win probability ─────────────────────────────────────────────────

/// Per-play output: the evaluation, valuation when the realized outcome was
/// given, or the reason the play failed.
#[derive(Debug, Clone, Serialize)]
pub struct PlayResult {
    pub play_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<GameState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<PlayEvaluation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valuation: Option<PlayValuation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlayResult {
    fn failed(play_id: &str, state: Option<GameState>, err: impl ToString) -> Self {
        PlayResult {
            play_id: play_id.to_string(),
            state,
            evaluation: None,
            valuation: None,
            error: Some(err.to_string()),
        }
    }

    fn to_record(&self) -> Option<PlayEvaluationRecord> {
        let (state, eval) = (self.state?, self.evaluation?);
        let v = self.valuation;
        Some(PlayEvaluationRecord {
            id: None,
            play_id: self.play_id.clone(),
            inning: state.inning as i64,
            half: state.half,
            bases: state.bases,
            outs: state.outs as i64,
            run_diff: state.run_diff as i64,
            wp: eval.wp,
            xwp: eval.xwp,
            next_wp: v.map(|v| v.next_wp),
            li: v.map(|v| v.li),
            wpa: v.map(|v| v.wpa),
            xwpa: v.map(|v| v.xwpa),
            wpoe: v.map(|v| v.wpoe),
            wpa_li: v.map(|v| v.wpa_li),
            wpoe_li: v.map(|v| v.wpoe_li),
            out_over_expected: v.and_then(|v| v.out_over_expected),
            evaluated_at: Utc::now(),
        })
    }
}

fn value_play(
    play: &BattedBallPlay,
    state: &GameState,
    eval: &PlayEvaluation,
    wp: &WinProbabilityTable,
    li: &LeverageIndexTable,
) -> ModelResult<Option<PlayValuation>> {
    let Some(realized) = play.realized else {
        return Ok(None);
    };
    let next = realized
        .next
        .map(|s| s.game_state(wp.rules()))
        .transpose()?;
    let next_wp = realized_next_wp(wp, eval.wp, next.as_ref(), realized.run_diff_after)?;
    let leverage = li.get(state)?;
    let valuation = PlayValuation::new(state.half, eval, next_wp, leverage);
    Ok(Some(match realized.is_out {
        Some(is_out) => valuation.with_recorded_out(is_out, play.out_probability),
        None => valuation,
    }))
}

/// Evaluate every play; failures are reported in place.
pub fn evaluate_plays(
    plays: &[BattedBallPlay],
    wp: &WinProbabilityTable,
    li: &LeverageIndexTable,
    model: &dyn RunnerAdvancementModel,
    tolerance: f64,
) -> Vec<PlayResult> {
    let rules = wp.rules();
    let contexts: Vec<ModelResult<PlayContext>> = plays.iter().map(|p| p.context(rules)).collect();

    let mut results: Vec<PlayResult> = Vec::with_capacity(plays.len());
    let mut valid = Vec::new();
    let mut valid_index = Vec::new();
    for (i, (play, ctx)) in plays.iter().zip(&contexts).enumerate() {
        match ctx {
            Ok(ctx) => {
                valid.push(*ctx);
                valid_index.push(i);
                results.push(PlayResult {
                    play_id: play.play_id.clone(),
                    state: Some(ctx.state),
                    evaluation: None,
                    valuation: None,
                    error: None,
                });
            }
            Err(err) => {
                warn!(play = i, play_id = %play.play_id, error = %err, "invalid play state");
                results.push(PlayResult::failed(&play.play_id, None, err));
            }
        }
    }

    let evaluator = ExpectedWinProbability::new(wp, model, tolerance);
    for (i, outcome) in valid_index.into_iter().zip(evaluator.evaluate_batch(&valid)) {
        let result = &mut results[i];
        match outcome {
            Ok(eval) => {
                result.evaluation = Some(eval);
                if let Some(state) = result.state {
                    match value_play(&plays[i], &state, &eval, wp, li) {
                        Ok(valuation) => result.valuation = valuation,
                        Err(err) => {
                            warn!(play = i, error = %err, "play valuation failed");
                            result.error = Some(err.to_string());
                        }
                    }
                }
            }
            Err(err) => result.error = Some(err.to_string()),
        }
    }
    results
}

#[allow(clippy::too_many_arguments)]
fn xwp(
    config: &Config,
    dir: &ArtifactDir,
    plays_path: &Path,
    advancement: &Path,
    output: &Path,
    database: Option<&str>,
    set_version: Option<&str>,
) -> Result<()> {
    let store = database.map(ArtifactStore::open).transpose()?;
    let (wp, li) = match (&store, set_version) {
        (Some(store), Some(version)) => store.load_tables(version)?,
        (Some(_), None) => bail!("recording evaluations needs --set-version"),
        (None, _) => {
            let rules: GameRules = config.base_rules();
            (dir.load_win_probability(&rules)?, dir.load_leverage(&rules)?)
        }
    };
    let model = load_advancement_table(advancement)?;
    let plays = load_batted_balls(plays_path)?;

    let results = evaluate_plays(&plays, &wp, &li, &model, config.tolerance);
    let failed = results.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        warn!(failed, total = results.len(), "Some plays could not be evaluated");
    }

    let mut writer = BufWriter::new(
        File::create(output).with_context(|| format!("creating {}", output.display()))?,
    );
    serde_json::to_writer_pretty(&mut writer, &results)
        .with_context(|| format!("writing {}", output.display()))?;
    writer.flush()?;
    info!(path = %output.display(), plays = results.len(), "Expected win probability written");

    if let (Some(store), Some(version)) = (store, set_version) {
        let records: Vec<PlayEvaluationRecord> =
            results.iter().filter_map(PlayResult::to_record).collect();
        store.record_evaluations(version, &records)?;
    }
    Ok(())
}

// ── Published sets ───────────────────────────────────────────────────────────

fn sets(database: &str, set_version: Option<&str>, limit: i64) -> Result<()> {
    let store = ArtifactStore::open(database)?;
    let listing = listing(&store, set_version, limit)?;
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

/// Every published set, or the recorded evaluations of one.
fn listing(store: &ArtifactStore, set_version: Option<&str>, limit: i64) -> Result<serde_json::Value> {
    let value = match set_version {
        Some(version) => {
            if store.get_set(version)?.is_none() {
                bail!("artifact set {version} not found");
            }
            serde_json::to_value(store.list_evaluations(version, limit)?)?
        }
        None => serde_json::to_value(store.list_sets()?)?,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{PlateAppearance, PlateAppearanceEvent, RealizedOutcome, RecordedState};
    use crate::model::advancement::TabulatedAdvancementModel;
    use crate::model::expected::HitTypeProbabilities;
    use crate::model::game_state::Half;
    use crate::model::transition_matrix::tests::league_model;
    use approx::assert_relative_eq;
    use clap::Parser;
    use tempfile::tempdir;

    fn config(dir: &Path) -> Config {
        Config::try_parse_from([
            "baseball-wp",
            "--artifacts-dir",
            dir.to_str().unwrap(),
            "win-prob",
        ])
        .unwrap()
    }

    fn recorded(inning: u32, half: Half, bases: u8, outs: u8, home: i32, away: i32) -> RecordedState {
        RecordedState {
            inning,
            half,
            bases: BaseState::new(bases).unwrap(),
            outs,
            home_score: home,
            away_score: away,
        }
    }

    /// Every (bases, outs) cell in both regimes, a mix of events, and one
    /// extra-inning walk-off.
    fn dataset() -> HistoricalDataset {
        use PlateAppearanceEvent::*;
        let events = [Strikeout, Walk, Out, Out, Single, Double, Triple, HomeRun];
        let mut records = Vec::new();
        for bases in 0..8u8 {
            for outs in 0..3u8 {
                for (k, event) in events.iter().enumerate() {
                    records.push(PlateAppearance {
                        game_id: format!("g{k}"),
                        state: recorded(2 + k as u32 % 5, Half::Top, bases, outs, 2, 1),
                        event: *event,
                        event_runs: 0,
                        rest_of_inning_runs: (k as u32 + bases as u32) % 4,
                        game_end: false,
                    });
                }
                records.push(PlateAppearance {
                    game_id: "late".into(),
                    state: recorded(9, Half::Bottom, bases, outs, 3, 3),
                    event: Single,
                    event_runs: 0,
                    rest_of_inning_runs: (outs as u32 + bases as u32) % 2,
                    game_end: false,
                });
            }
        }
        records.push(PlateAppearance {
            game_id: "extras".into(),
            state: recorded(10, Half::Bottom, 0b010, 1, 4, 4),
            event: Double,
            event_runs: 1,
            rest_of_inning_runs: 0,
            game_end: true,
        });
        HistoricalDataset::from_records(records)
    }

    fn batted_ball(play_id: &str, state: RecordedState, out_probability: f64) -> BattedBallPlay {
        BattedBallPlay {
            play_id: play_id.into(),
            state,
            out_probability,
            hit_types: HitTypeProbabilities {
                single: 0.65,
                double: 0.2,
                triple: 0.03,
                home_run: 0.12,
            },
            features: None,
            realized: None,
        }
    }

    #[test]
    fn full_build_produces_consistent_tables() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let set = build_all(&config, &dataset(), &league_model()).unwrap();
        assert_eq!(set.win_probability.rules().home_extra_inning_win_rate, 1.0);
        set.tensor.validate(1e-6).unwrap();
        set.leverage.validate().unwrap();
        assert!(set.win_probability.values().iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn failed_build_writes_nothing() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("artifacts");
        let config = config(&root);
        let err = build_all(&config, &dataset(), &TabulatedAdvancementModel::default());
        assert!(err.is_err());
        assert!(!root.exists());
    }

    #[test]
    fn published_sets_and_their_evaluations_are_listed() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let set = build_all(&config, &dataset(), &league_model()).unwrap();
        let store = ArtifactStore::open(dir.path().join("wp.db").to_str().unwrap()).unwrap();
        store.publish("v1", &set.win_probability, &set.leverage).unwrap();

        let plays = [
            batted_ball("a", recorded(4, Half::Top, 0, 0, 1, 1), 0.6),
            batted_ball("b", recorded(6, Half::Bottom, 0b011, 2, 0, 2), 0.8),
        ];
        let results = evaluate_plays(&plays, &set.win_probability, &set.leverage, &league_model(), 1e-6);
        let records: Vec<PlayEvaluationRecord> =
            results.iter().filter_map(PlayResult::to_record).collect();
        store.record_evaluations("v1", &records).unwrap();

        let sets = listing(&store, None, 10).unwrap();
        assert_eq!(sets.as_array().unwrap().len(), 1);
        assert_eq!(sets[0]["version"], "v1");
        let evaluations = listing(&store, Some("v1"), 1).unwrap();
        assert_eq!(evaluations.as_array().unwrap().len(), 1);
        assert_eq!(evaluations[0]["play_id"], "a");
        assert!(listing(&store, Some("v2"), 10).is_err());
    }

    #[test]
    fn plays_are_evaluated_valued_or_reported() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let set = build_all(&config, &dataset(), &league_model()).unwrap();
        let (wp, li) = (&set.win_probability, &set.leverage);

        let mut valued = batted_ball("valued", recorded(5, Half::Top, 0b001, 1, 2, 2), 0.7);
        valued.realized = Some(RealizedOutcome {
            next: Some(recorded(5, Half::Top, 0, 2, 2, 2)),
            run_diff_after: 0,
            is_out: Some(true),
        });
        let plain = batted_ball("plain", recorded(2, Half::Bottom, 0, 0, 0, 1), 0.5);
        let bad_state = batted_ball("bad-state", recorded(3, Half::Top, 0, 3, 0, 0), 0.5);
        let bad_probs = batted_ball("bad-probs", recorded(3, Half::Top, 0, 1, 0, 0), -0.1);

        let results = evaluate_plays(&[valued, plain, bad_state, bad_probs], wp, li, &league_model(), 1e-6);
        assert_eq!(results.len(), 4);

        let v = results[0].valuation.unwrap();
        let e = results[0].evaluation.unwrap();
        assert!(results[0].error.is_none());
        assert_eq!(v.xwp, e.xwp);
        assert!(v.li > 0.0);
        assert_relative_eq!(v.out_over_expected.unwrap(), 0.3, epsilon = 1e-12);
        assert_eq!(results[0].to_record().unwrap().out_over_expected, v.out_over_expected);

        assert!(results[1].evaluation.is_some());
        assert!(results[1].valuation.is_none());
        assert!(results[1].to_record().is_some());

        assert!(results[2].error.is_some() && results[2].state.is_none());
        assert!(results[3].error.is_some() && results[3].evaluation.is_none());
        assert!(results[3].to_record().is_none());
    }
}
