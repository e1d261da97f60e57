//! JSON artifact files.
//!
//! Each table is written as an envelope carrying its axis shape and the time
//! it was built. Loading checks the shape and re-validates the contents, so a
//! hand-edited or truncated file is rejected rather than silently used.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::base_out::{BASE_STATES, OUT_STATES};
use crate::model::game_state::GameRules;
use crate::model::leverage::LeverageIndexTable;
use crate::model::run_distribution::{RunDistributionTable, RunDistributions, RUN_BUCKETS};
use crate::model::transition_matrix::{TransitionTensor, NEW_OUT_STATES, PLAY_RUN_BUCKETS};
use crate::model::win_probability::WinProbabilityTable;

pub const RUN_DIST_NORMAL_FILE: &str = "run_dist_normal.json";
pub const RUN_DIST_NEED_ONE_RUN_FILE: &str = "run_dist_need_one_run.json";
pub const TRANSITION_TENSOR_FILE: &str = "transition_tensor.json";
pub const WIN_PROBABILITY_FILE: &str = "win_probability.json";
pub const LEVERAGE_INDEX_FILE: &str = "leverage_index.json";

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    format_version: u32,
    created_at: DateTime<Utc>,
    shape: Vec<usize>,
    table: T,
}

/// A complete, mutually consistent set of tables.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    pub runs: RunDistributions,
    pub tensor: TransitionTensor,
    pub win_probability: WinProbabilityTable,
    pub leverage: LeverageIndexTable,
}

/// Directory holding one set of artifact files.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: PathBuf,
    tolerance: f64,
}

impl ArtifactDir {
    pub fn new(root: impl Into<PathBuf>, tolerance: f64) -> Self {
        ArtifactDir {
            root: root.into(),
            tolerance,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    // ── Run distributions ────────────────────────────────────────────────────

    pub fn save_run_distributions(&self, runs: &RunDistributions) -> Result<()> {
        let shape = run_distribution_shape();
        self.save(RUN_DIST_NORMAL_FILE, &shape, &runs.normal)?;
        self.save(RUN_DIST_NEED_ONE_RUN_FILE, &shape, &runs.need_one_run)
    }

    pub fn load_run_distributions(&self) -> Result<RunDistributions> {
        let shape = run_distribution_shape();
        let normal: RunDistributionTable = self.load(RUN_DIST_NORMAL_FILE, &shape)?;
        let need_one_run: RunDistributionTable = self.load(RUN_DIST_NEED_ONE_RUN_FILE, &shape)?;
        let runs = RunDistributions {
            normal,
            need_one_run,
        };
        runs.validate(self.tolerance)
            .context("run distribution artifacts are invalid")?;
        Ok(runs)
    }

    // ── Transition tensor ────────────────────────────────────────────────────

    pub fn save_tensor(&self, tensor: &TransitionTensor) -> Result<()> {
        self.save(TRANSITION_TENSOR_FILE, &tensor_shape(), tensor)
    }

    pub fn load_tensor(&self) -> Result<TransitionTensor> {
        let tensor: TransitionTensor = self.load(TRANSITION_TENSOR_FILE, &tensor_shape())?;
        tensor
            .validate(self.tolerance)
            .context("transition tensor artifact is invalid")?;
        Ok(tensor)
    }

    // ── Win probability / leverage ───────────────────────────────────────────

    pub fn save_win_probability(&self, wp: &WinProbabilityTable) -> Result<()> {
        self.save(WIN_PROBABILITY_FILE, &game_state_shape(wp.rules()), wp)
    }

    /// Load the win-probability table built under `rules`.
    pub fn load_win_probability(&self, rules: &GameRules) -> Result<WinProbabilityTable> {
        let wp: WinProbabilityTable = self.load(WIN_PROBABILITY_FILE, &game_state_shape(rules))?;
        check_rules("win probability", wp.rules(), rules)?;
        wp.validate().context("win probability artifact is invalid")?;
        Ok(wp)
    }

    pub fn save_leverage(&self, li: &LeverageIndexTable) -> Result<()> {
        self.save(LEVERAGE_INDEX_FILE, &game_state_shape(li.rules()), li)
    }

    pub fn load_leverage(&self, rules: &GameRules) -> Result<LeverageIndexTable> {
        let li: LeverageIndexTable = self.load(LEVERAGE_INDEX_FILE, &game_state_shape(rules))?;
        check_rules("leverage index", li.rules(), rules)?;
        li.validate().context("leverage index artifact is invalid")?;
        Ok(li)
    }

    /// Write every table of a finished build. All files are staged first and
    /// only renamed into place once every one of them was written, so a failed
    /// write leaves the previous set untouched.
    pub fn save_all(&self, set: &ArtifactSet) -> Result<()> {
        let run_shape = run_distribution_shape();
        let wp_shape = game_state_shape(set.win_probability.rules());
        let li_shape = game_state_shape(set.leverage.rules());
        let mut staged = Vec::with_capacity(5);
        let result = (|| -> Result<()> {
            staged.push(self.stage(RUN_DIST_NORMAL_FILE, &run_shape, &set.runs.normal)?);
            staged.push(self.stage(RUN_DIST_NEED_ONE_RUN_FILE, &run_shape, &set.runs.need_one_run)?);
            staged.push(self.stage(TRANSITION_TENSOR_FILE, &tensor_shape(), &set.tensor)?);
            staged.push(self.stage(WIN_PROBABILITY_FILE, &wp_shape, &set.win_probability)?);
            staged.push(self.stage(LEVERAGE_INDEX_FILE, &li_shape, &set.leverage)?);
            Ok(())
        })();
        if let Err(e) = result {
            for file in &staged {
                let _ = fs::remove_file(&file.tmp);
            }
            return Err(e);
        }
        for file in &staged {
            file.commit()?;
        }
        Ok(())
    }

    // ── Plumbing ─────────────────────────────────────────────────────────────

    /// Serialize to a temporary sibling, then rename over the target.
    fn save<T: Serialize>(&self, file: &str, shape: &[usize], table: &T) -> Result<()> {
        self.stage(file, shape, table)?.commit()
    }

    fn stage<T: Serialize>(&self, file: &str, shape: &[usize], table: &T) -> Result<StagedFile> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;
        let path = self.path(file);
        let tmp = path.with_extension("json.tmp");
        let envelope = Envelope {
            format_version: FORMAT_VERSION,
            created_at: Utc::now(),
            shape: shape.to_vec(),
            table,
        };
        {
            let mut writer = BufWriter::new(
                File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?,
            );
            serde_json::to_writer(&mut writer, &envelope)
                .with_context(|| format!("writing {}", tmp.display()))?;
            writer.flush()?;
        }
        Ok(StagedFile { tmp, path })
    }

    fn load<T: DeserializeOwned>(&self, file: &str, shape: &[usize]) -> Result<T> {
        let path = self.path(file);
        let reader = BufReader::new(
            File::open(&path).with_context(|| format!("opening {}", path.display()))?,
        );
        let envelope: Envelope<T> = serde_json::from_reader(reader)
            .with_context(|| format!("parsing {}", path.display()))?;
        if envelope.format_version != FORMAT_VERSION {
            bail!(
                "{}: unsupported format version {}",
                path.display(),
                envelope.format_version
            );
        }
        if envelope.shape != shape {
            bail!(
                "{}: shape {:?} does not match expected {:?}",
                path.display(),
                envelope.shape,
                shape
            );
        }
        Ok(envelope.table)
    }
}

/// A fully written temporary file waiting to replace its target.
struct StagedFile {
    tmp: PathBuf,
    path: PathBuf,
}

impl StagedFile {
    fn commit(&self) -> Result<()> {
        fs::rename(&self.tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        info!(path = %self.path.display(), "Artifact written");
        Ok(())
    }
}

fn check_rules(what: &str, found: &GameRules, expected: &GameRules) -> Result<()> {
    if found.regulation_innings != expected.regulation_innings
        || found.max_run_diff != expected.max_run_diff
    {
        bail!(
            "{what} artifact was built for {} innings / ±{} runs, configured {} / ±{}",
            found.regulation_innings,
            found.max_run_diff,
            expected.regulation_innings,
            expected.max_run_diff
        );
    }
    Ok(())
}

fn run_distribution_shape() -> Vec<usize> {
    vec![BASE_STATES, OUT_STATES, RUN_BUCKETS]
}

fn tensor_shape() -> Vec<usize> {
    vec![BASE_STATES, OUT_STATES, BASE_STATES, NEW_OUT_STATES, PLAY_RUN_BUCKETS]
}

fn game_state_shape(rules: &GameRules) -> Vec<usize> {
    vec![
        rules.inning_buckets(),
        2,
        BASE_STATES,
        OUT_STATES,
        rules.run_diff_slots(),
    ]
}
