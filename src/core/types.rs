use serde::Serialize;

use super::error::ConfigError;
use super::glidepath::GlidepathConfig;
use super::regime::EconomicModel;
use super::withdrawal::WithdrawalPolicy;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum CashPolicy {
    #[default]
    Capped,
    AllowOverdraft,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EtfInstrument {
    pub name: String,
    pub weight: f64,
    pub expected_return: f64,
    pub volatility: f64,
    pub ter: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ContributionSchedule {
    pub monthly_cash: f64,
    pub monthly_etf: f64,
    pub annual_growth: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PensionFundConfig {
    pub initial_balance: f64,
    pub annual_contribution: f64,
    pub expected_return: f64,
    pub volatility: f64,
    pub ter: f64,
    pub accrual_tax_rate: f64,
    pub payout_tax_rate: f64,
    pub payout_age: u32,
    pub lump_sum_share: f64,
    pub annuity_years: u32,
}

impl Default for PensionFundConfig {
    fn default() -> Self {
        Self {
            initial_balance: 0.0,
            annual_contribution: 0.0,
            expected_return: 0.04,
            volatility: 0.08,
            ter: 0.01,
            accrual_tax_rate: 0.20,
            payout_tax_rate: 0.15,
            payout_age: 67,
            lump_sum_share: 0.5,
            annuity_years: 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaxConfig {
    pub capital_gain_rate: f64,
    pub securities_stamp_duty: f64,
    pub cash_stamp_duty: f64,
    pub cash_stamp_threshold: f64,
    pub monthly_broker_fee: f64,
}

impl TaxConfig {
    pub fn exempt() -> Self {
        Self {
            capital_gain_rate: 0.0,
            securities_stamp_duty: 0.0,
            cash_stamp_duty: 0.0,
            cash_stamp_threshold: 0.0,
            monthly_broker_fee: 0.0,
        }
    }
}

impl Default for TaxConfig {
    fn default() -> Self {
        Self {
            capital_gain_rate: 0.26,
            securities_stamp_duty: 0.002,
            cash_stamp_duty: 34.20,
            cash_stamp_threshold: 5_000.0,
            monthly_broker_fee: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PublicPension {
    pub annual_amount: f64,
    pub start_age: u32,
}

#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub start_age: u32,
    pub horizon_months: u32,
    pub retirement_month: u32,
    pub initial_cash: f64,
    pub initial_etf_value: f64,
    pub initial_etf_cost_basis: f64,
    pub contributions: ContributionSchedule,
    pub instruments: Vec<EtfInstrument>,
    pub pension_fund: Option<PensionFundConfig>,
    pub withdrawal: WithdrawalPolicy,
    pub glidepath: GlidepathConfig,
    pub tax: TaxConfig,
    pub public_pension: PublicPension,
    pub economic_model: EconomicModel,
    pub simulations: u32,
    pub seed: Option<u64>,
    pub cash_policy: CashPolicy,
    pub record_trajectories: bool,
}

impl ScenarioConfig {
    pub fn age_at_month(&self, month: u32) -> f64 {
        self.start_age as f64 + month as f64 / 12.0
    }

    pub fn month_reaching_age(&self, age: u32) -> u32 {
        age.saturating_sub(self.start_age) * 12
    }

    pub fn retirement_age(&self) -> f64 {
        self.age_at_month(self.retirement_month)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.horizon_months == 0 {
            return Err(ConfigError::OutOfRange {
                field: "horizon months",
                expected: "> 0",
                value: 0.0,
            });
        }
        if self.retirement_month > self.horizon_months {
            return Err(ConfigError::Inconsistent {
                field: "retirement month",
                reason: format!(
                    "{} is beyond the {}-month horizon",
                    self.retirement_month, self.horizon_months
                ),
            });
        }
        if self.simulations == 0 {
            return Err(ConfigError::OutOfRange {
                field: "simulations",
                expected: ">= 1",
                value: 0.0,
            });
        }

        check_non_negative("initial cash", self.initial_cash)?;
        check_non_negative("initial ETF value", self.initial_etf_value)?;
        check_non_negative("initial ETF cost basis", self.initial_etf_cost_basis)?;
        check_non_negative("monthly cash contribution", self.contributions.monthly_cash)?;
        check_non_negative("monthly ETF contribution", self.contributions.monthly_etf)?;
        check_finite("contribution growth", self.contributions.annual_growth)?;
        check_non_negative("public pension", self.public_pension.annual_amount)?;

        if self.instruments.is_empty() {
            return Err(ConfigError::Inconsistent {
                field: "instruments",
                reason: "at least one ETF instrument is required".to_string(),
            });
        }
        for instrument in &self.instruments {
            check_unit("instrument weight", instrument.weight)?;
            check_unit("instrument TER", instrument.ter)?;
            check_non_negative("instrument volatility", instrument.volatility)?;
            if !instrument.expected_return.is_finite() || instrument.expected_return <= -1.0 {
                return Err(ConfigError::OutOfRange {
                    field: "instrument expected return",
                    expected: "> -1",
                    value: instrument.expected_return,
                });
            }
        }
        let weight_sum: f64 = self.instruments.iter().map(|i| i.weight).sum();
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::WeightSum { sum: weight_sum });
        }

        if let Some(fund) = &self.pension_fund {
            check_non_negative("pension initial balance", fund.initial_balance)?;
            check_non_negative("pension contribution", fund.annual_contribution)?;
            check_non_negative("pension volatility", fund.volatility)?;
            check_unit("pension TER", fund.ter)?;
            check_unit("pension accrual tax", fund.accrual_tax_rate)?;
            check_unit("pension payout tax", fund.payout_tax_rate)?;
            check_unit("pension lump-sum share", fund.lump_sum_share)?;
            if fund.annuity_years == 0 {
                return Err(ConfigError::OutOfRange {
                    field: "pension annuity years",
                    expected: ">= 1",
                    value: 0.0,
                });
            }
        }

        check_unit("capital gain tax", self.tax.capital_gain_rate)?;
        check_unit("securities stamp duty", self.tax.securities_stamp_duty)?;
        check_non_negative("cash stamp duty", self.tax.cash_stamp_duty)?;
        check_non_negative("cash stamp threshold", self.tax.cash_stamp_threshold)?;
        check_non_negative("broker fee", self.tax.monthly_broker_fee)?;

        self.withdrawal.validate()?;
        if self.glidepath.enabled {
            self.glidepath.validate()?;
        }
        self.economic_model.validate()?;
        Ok(())
    }
}

fn check_finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::OutOfRange {
            field,
            expected: "finite",
            value,
        });
    }
    Ok(())
}

fn check_non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::OutOfRange {
            field,
            expected: ">= 0",
            value,
        });
    }
    Ok(())
}

fn check_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutOfRange {
            field,
            expected: "between 0 and 1",
            value,
        });
    }
    Ok(())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Accumulating,
    Retired,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthSnapshot {
    pub month: u32,
    pub nominal_net_worth: f64,
    pub real_net_worth: f64,
    pub cash: f64,
    pub etf_value: f64,
    pub pension_value: f64,
    pub price_index: f64,
    pub market_regime: usize,
    pub inflation_regime: usize,
    pub withdrawal: f64,
    pub exhausted: bool,
    pub phase: Phase,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trajectory {
    pub trial_id: u64,
    pub seed: u64,
    pub snapshots: Vec<MonthSnapshot>,
    pub exhausted_month: Option<u32>,
    pub retirement_net_worth: f64,
    pub retirement_real_net_worth: f64,
    pub first_year_real_withdrawals: f64,
    pub total_contributions: f64,
    pub total_taxes: f64,
    pub max_drawdown: f64,
}

impl Trajectory {
    pub fn is_exhausted(&self) -> bool {
        self.exhausted_month.is_some()
    }

    pub fn terminal(&self) -> Option<&MonthSnapshot> {
        self.snapshots.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileBand {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub trials: usize,
    pub horizon_months: u32,
    pub retirement_month: u32,
    pub nominal_bands: Vec<PercentileBand>,
    pub real_bands: Vec<PercentileBand>,
    pub terminal_nominal: PercentileBand,
    pub terminal_real: PercentileBand,
    pub success_probability: f64,
    pub failure_probability: f64,
    pub median_terminal_nominal: f64,
    pub median_terminal_real: f64,
    pub sustainable_withdrawal_rate: Option<f64>,
    pub median_retirement_net_worth: f64,
    pub median_retirement_real_net_worth: f64,
    pub worst_drawdown: f64,
    pub median_drawdown: f64,
    pub median_total_taxes: f64,
    pub median_total_contributions: f64,
    pub median_trial_index: usize,
    pub market_regime_share: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub summary: SimulationSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trajectories: Option<Vec<Trajectory>>,
    pub sustainable_withdrawal: Option<f64>,
}
