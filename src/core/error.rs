use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: f64,
    },

    #[error("{field}: {reason}")]
    Inconsistent { field: &'static str, reason: String },

    #[error("ETF target weights must sum to 1, got {sum}")]
    WeightSum { sum: f64 },

    #[error("{family} transition matrix is {rows}x{cols}, expected {expected}x{expected}")]
    MatrixShape {
        family: &'static str,
        rows: usize,
        cols: usize,
        expected: usize,
    },

    #[error("{family} transition row {row} sums to {sum}, expected 1")]
    RowSum {
        family: &'static str,
        row: usize,
        sum: f64,
    },

    #[error("{family} transition row {row} has invalid probability {value}")]
    NegativeProbability {
        family: &'static str,
        row: usize,
        value: f64,
    },

    #[error("{family} regime '{from}' references unknown regime '{to}'")]
    UnknownRegime {
        family: &'static str,
        from: String,
        to: String,
    },

    #[error("{family} regime family is empty")]
    EmptyFamily { family: &'static str },

    #[error("unknown economic preset '{0}'")]
    UnknownPreset(String),

    #[error("invalid economic model JSON: {0}")]
    ModelJson(String),
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("simulation cancelled after {completed} of {requested} trials")]
    Cancelled { completed: usize, requested: usize },
}
