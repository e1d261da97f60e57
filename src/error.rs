use thiserror::Error;

/// Failures raised by the model layer.
///
/// Domain-range and normalization violations are never recovered locally:
/// table builds abort, per-play evaluation reports the error for that play.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("base state {0} outside 0..=7")]
    BaseStateOutOfRange(u8),

    #[error("outs {0} outside 0..=2")]
    OutsOutOfRange(u8),

    #[error("inning index {index} outside 0..={max}")]
    InningOutOfRange { index: usize, max: usize },

    #[error("run differential {value} outside -{bound}..={bound}")]
    RunDiffOutOfRange { value: i32, bound: i32 },

    #[error("expected {expected} advancement codes for base state {bases:#05b}, got {got}")]
    AdvancementCodeCount { bases: u8, expected: usize, got: usize },

    #[error("{what} sums to {sum:.9}, expected 1 (tolerance {tolerance:e})")]
    NotNormalized { what: String, sum: f64, tolerance: f64 },

    #[error("{what} has invalid probability {value}")]
    InvalidProbability { what: String, value: f64 },

    #[error("no observations for bases={bases:#05b} outs={outs}")]
    EmptyCell { bases: u8, outs: u8 },

    #[error("no {0} observations")]
    NoObservations(String),

    #[error("{what}: expected {expected} values, got {got}")]
    ShapeMismatch { what: String, expected: usize, got: usize },

    #[error("play produced {0} runs, outside the tensor's 0..=4 range")]
    RunsOutOfRange(u8),

    #[error("leverage reference mean is {0}; cannot scale")]
    DegenerateScale(f64),

    #[error("no {role} distribution for outcome {outcome} from base {base} with {outs} out(s)")]
    MissingAdvancement {
        outcome: String,
        role: String,
        base: u8,
        outs: u8,
    },
}

pub type ModelResult<T> = Result<T, ModelError>;

/// Check that `values` form a probability distribution within `tolerance`.
pub fn check_distribution(what: &str, values: &[f64], tolerance: f64) -> ModelResult<()> {
    for &p in values {
        if !p.is_finite() || p < 0.0 {
            return Err(ModelError::InvalidProbability {
                what: what.to_string(),
                value: p,
            });
        }
    }
    let sum: f64 = values.iter().sum();
    if (sum - 1.0).abs() > tolerance {
        return Err(ModelError::NotNormalized {
            what: what.to_string(),
            sum,
            tolerance,
        });
    }
    Ok(())
}

/// Check that a single value is a probability.
pub fn check_probability(what: &str, p: f64) -> ModelResult<()> {
    if !p.is_finite() || !(0.0..=1.0).contains(&p) {
        return Err(ModelError::InvalidProbability {
            what: what.to_string(),
            value: p,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_within_tolerance_passes() {
        assert!(check_distribution("row", &[0.25, 0.25, 0.5 + 1e-9], 1e-6).is_ok());
    }

    #[test]
    fn distribution_off_by_more_than_tolerance_fails() {
        let err = check_distribution("row", &[0.25, 0.25, 0.49], 1e-6).unwrap_err();
        assert!(matches!(err, ModelError::NotNormalized { .. }));
    }

    #[test]
    fn negative_mass_is_rejected() {
        let err = check_distribution("row", &[1.2, -0.2], 1e-6).unwrap_err();
        assert!(matches!(err, ModelError::InvalidProbability { .. }));
    }

    #[test]
    fn probability_bounds() {
        assert!(check_probability("p", 0.0).is_ok());
        assert!(check_probability("p", 1.0).is_ok());
        assert!(check_probability("p", 1.01).is_err());
        assert!(check_probability("p", f64::NAN).is_err());
    }
}
