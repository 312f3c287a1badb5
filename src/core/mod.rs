mod aggregate;
mod engine;
mod error;
mod glidepath;
mod presets;
mod regime;
mod solver;
mod tax;
mod types;
mod withdrawal;

pub use aggregate::percentile;
pub use engine::{run_simulation, run_simulation_cancellable};
pub use error::{ConfigError, SimulationError};
pub use glidepath::GlidepathConfig;
pub use presets::{PresetInfo, load_preset, parse_model, preset_catalog, preset_ids};
pub use regime::{
    EconomicModel, InflationRegime, InflationTransitions, InitialRegime, MarketRegime,
    MonthlyDraw, RegimePath, ReturnProfile, StartLaw, TransitionMatrix, derive_seed,
};
pub use solver::{SustainableSolveConfig, SustainableWithdrawal, solve_sustainable_withdrawal};
pub use tax::Position;
pub use types::{
    CashPolicy, ContributionSchedule, EtfInstrument, MonthSnapshot, PensionFundConfig,
    PercentileBand, Phase, PublicPension, ScenarioConfig, SimulationResult, SimulationSummary,
    TaxConfig, Trajectory,
};
pub use withdrawal::{GuardrailAction, WithdrawalContext, WithdrawalMemo, WithdrawalPolicy};
