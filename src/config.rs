use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::model::game_state::GameRules;

/// Markov win-probability, leverage index and expected win probability tables for baseball
#[derive(Parser, Debug, Clone)]
#[command(name = "baseball-wp", version, about)]
pub struct Config {
    /// Directory holding the JSON artifact files
    #[arg(long, env = "ARTIFACTS_DIR", default_value = "artifacts", global = true)]
    pub artifacts_dir: PathBuf,

    /// Scheduled innings per game
    #[arg(long, env = "REGULATION_INNINGS", default_value = "9", global = true)]
    pub regulation_innings: usize,

    /// Run differential saturates at ± this many runs
    #[arg(long, env = "MAX_RUN_DIFF", default_value = "30", global = true)]
    pub max_run_diff: i32,

    /// Allowed deviation of a probability row sum from 1
    #[arg(long, env = "PROB_TOLERANCE", default_value = "1e-6", global = true)]
    pub tolerance: f64,

    /// P(home wins | tied after regulation). Estimated from the plate
    /// appearances when omitted, 0.5 when there is nothing to estimate from.
    #[arg(long, env = "EXTRA_INNING_HOME_WIN_RATE", global = true)]
    pub extra_inning_home_win_rate: Option<f64>,

    /// Start extra-inning halves with empty bases instead of a runner on second
    #[arg(long, env = "NO_EXTRA_INNING_RUNNER", default_value = "false", global = true)]
    pub no_extra_inning_runner: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build the NORMAL and NEED_ONE_RUN run distribution tables
    RunDist {
        /// JSON array of historical plate appearances
        #[arg(long, env = "PLATE_APPEARANCES")]
        plate_appearances: PathBuf,
    },

    /// Build the one-plate-appearance transition tensor
    Transition {
        #[arg(long, env = "PLATE_APPEARANCES")]
        plate_appearances: PathBuf,

        /// JSON array of tabulated runner-advancement distributions
        #[arg(long, env = "ADVANCEMENT_TABLE")]
        advancement: PathBuf,
    },

    /// Solve the win-probability table from saved run distributions
    WinProb {
        /// Used only to estimate the extra-inning home win rate
        #[arg(long, env = "PLATE_APPEARANCES")]
        plate_appearances: Option<PathBuf>,
    },

    /// Build the leverage index table from saved WP table and tensor
    Leverage {
        /// Reference sample the index is scaled against
        #[arg(long, env = "PLATE_APPEARANCES")]
        plate_appearances: PathBuf,
    },

    /// Run every build step; write and publish only if all succeed
    Build {
        #[arg(long, env = "PLATE_APPEARANCES")]
        plate_appearances: PathBuf,

        #[arg(long, env = "ADVANCEMENT_TABLE")]
        advancement: PathBuf,

        /// SQLite database to publish the set into
        #[arg(long, env = "DATABASE_PATH")]
        database: Option<String>,

        /// Version label for the published set
        #[arg(long, env = "ARTIFACT_VERSION", requires = "database")]
        set_version: Option<String>,
    },

    /// Expected win probability for a batch of batted balls
    Xwp {
        /// JSON array of batted balls with predictor output
        #[arg(long)]
        plays: PathBuf,

        #[arg(long, env = "ADVANCEMENT_TABLE")]
        advancement: PathBuf,

        /// Where to write per-play results (JSON)
        #[arg(long, default_value = "xwp.json")]
        output: PathBuf,

        /// SQLite database to record evaluations into
        #[arg(long, env = "DATABASE_PATH")]
        database: Option<String>,

        /// Published set the evaluations belong to; its tables are used
        /// instead of the artifact files
        #[arg(long, env = "ARTIFACT_VERSION", requires = "database")]
        set_version: Option<String>,
    },

    /// Print published sets, or the evaluations recorded against one set
    Sets {
        #[arg(long, env = "DATABASE_PATH")]
        database: String,

        #[arg(long, env = "ARTIFACT_VERSION")]
        set_version: Option<String>,

        /// Most evaluations to print
        #[arg(long, default_value = "100")]
        limit: i64,
    },
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.regulation_innings < 1 {
            anyhow::bail!("regulation_innings must be at least 1");
        }
        if self.max_run_diff < 1 {
            anyhow::bail!("max_run_diff must be at least 1");
        }
        if !(self.tolerance > 0.0 && self.tolerance <= 1e-2) {
            anyhow::bail!("tolerance must be in (0, 0.01]");
        }
        if let Some(rate) = self.extra_inning_home_win_rate {
            if !(0.0..=1.0).contains(&rate) {
                anyhow::bail!("extra_inning_home_win_rate must be between 0.0 and 1.0");
            }
        }
        Ok(())
    }

    /// Game rules with the extra-inning win rate still to be resolved.
    pub fn rules(&self, home_extra_inning_win_rate: f64) -> GameRules {
        GameRules {
            regulation_innings: self.regulation_innings,
            max_run_diff: self.max_run_diff,
            home_extra_inning_win_rate,
            extra_inning_runner_on_second: !self.no_extra_inning_runner,
        }
    }

    /// Rules for steps that never read the extra-inning win rate.
    pub fn base_rules(&self) -> GameRules {
        self.rules(self.extra_inning_home_win_rate.unwrap_or(0.5))
    }
}
