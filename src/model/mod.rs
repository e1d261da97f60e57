pub mod advancement;
pub mod base_out;
pub mod expected;
pub mod game_state;
pub mod leverage;
pub mod run_distribution;
pub mod transition;
pub mod transition_matrix;
pub mod win_probability;

pub use advancement::{RunnerAdvancementModel, TabulatedAdvancementModel};
pub use expected::{ExpectedWinProbability, PlayContext, PlayValuation};
pub use game_state::{GameRules, GameState, Half};
pub use leverage::{build_leverage_index, LeverageIndexTable};
pub use run_distribution::{RunDistributionTable, RunDistributions};
pub use transition_matrix::{build_transition_tensor, EventFrequencies, TransitionTensor};
pub use win_probability::{solve, WinProbabilityTable};
