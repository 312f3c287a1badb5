use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::aggregate::{max_drawdown, summarize};
use super::error::SimulationError;
use super::glidepath::{execute_orders, plan_rebalance};
use super::regime::{MonthlyDraw, ReturnProfile, StartLaw, derive_seed};
use super::solver::{SustainableSolveConfig, solve_sustainable_withdrawal};
use super::tax::{
    MONTHS_PER_YEAR, Position, cash_stamp_duty, monthly_rate, payout_tax, pension_accrual_tax,
    round_cents, securities_stamp_duty,
};
use super::types::{
    CashPolicy, MonthSnapshot, Phase, ScenarioConfig, SimulationResult, Trajectory,
};
use super::withdrawal::{WithdrawalContext, WithdrawalMemo, WithdrawalPolicy};

const HALF_CENT: f64 = 0.005;
const CENT: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
enum PayoutState {
    Pending,
    Annuity {
        monthly_real: f64,
        months_left: u32,
        price_index_at_start: f64,
    },
    Finished,
}

#[derive(Debug, Clone)]
struct PensionAccount {
    balance: f64,
    year_start_balance: f64,
    contributions_this_year: f64,
    payouts_this_year: f64,
    ter_accrued: f64,
    payout: PayoutState,
}

#[derive(Debug, Clone)]
struct TrialState {
    cash: f64,
    positions: Vec<Position>,
    ter_accrued: Vec<f64>,
    broker_fee_accrued: f64,
    pension: Option<PensionAccount>,
    price_index: f64,
    phase: Phase,
    market_regime: usize,
    inflation_regime: usize,
}

impl TrialState {
    fn new(config: &ScenarioConfig) -> Self {
        let positions = config
            .instruments
            .iter()
            .map(|instrument| {
                Position::with_holding(
                    config.initial_etf_value * instrument.weight,
                    config.initial_etf_cost_basis * instrument.weight,
                    1.0,
                )
            })
            .collect();
        let pension = config.pension_fund.as_ref().map(|fund| PensionAccount {
            balance: fund.initial_balance,
            year_start_balance: fund.initial_balance,
            contributions_this_year: 0.0,
            payouts_this_year: 0.0,
            ter_accrued: 0.0,
            payout: PayoutState::Pending,
        });

        Self {
            cash: round_cents(config.initial_cash),
            positions,
            ter_accrued: vec![0.0; config.instruments.len()],
            broker_fee_accrued: 0.0,
            pension,
            price_index: 1.0,
            phase: if config.retirement_month == 0 {
                Phase::Retired
            } else {
                Phase::Accumulating
            },
            market_regime: 0,
            inflation_regime: 0,
        }
    }

    fn etf_value(&self) -> f64 {
        self.positions.iter().map(Position::market_value).sum()
    }

    fn liquid_wealth(&self) -> f64 {
        self.cash + self.etf_value()
    }

    fn pension_value(&self) -> f64 {
        self.pension.as_ref().map_or(0.0, |p| p.balance)
    }

    fn net_worth(&self) -> f64 {
        (self.liquid_wealth() + self.pension_value()).max(0.0)
    }

    fn snapshot(&self, month: u32, withdrawal: f64) -> MonthSnapshot {
        let nominal = self.net_worth();
        MonthSnapshot {
            month,
            nominal_net_worth: nominal,
            real_net_worth: nominal / self.price_index,
            cash: self.cash,
            etf_value: self.etf_value(),
            pension_value: self.pension_value(),
            price_index: self.price_index,
            market_regime: self.market_regime,
            inflation_regime: self.inflation_regime,
            withdrawal,
            exhausted: self.phase == Phase::Exhausted,
            phase: self.phase,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TrialLedger {
    contributions: f64,
    taxes: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct SaleTotals {
    tax: f64,
    net: f64,
}

#[derive(Debug, Clone, Copy)]
struct WithdrawalOutcome {
    paid: f64,
    exhausted: bool,
}

struct TrialPlan<'a> {
    config: &'a ScenarioConfig,
    start_law: StartLaw,
    weights: Vec<f64>,
    profiles: Vec<ReturnProfile>,
    monthly_ter: Vec<f64>,
    pension_profile: ReturnProfile,
    pension_monthly_ter: f64,
    pension_monthly_contribution: f64,
    payout_month: Option<u32>,
    public_pension_month: u32,
    public_pension_monthly: f64,
}

impl<'a> TrialPlan<'a> {
    fn new(config: &'a ScenarioConfig) -> Self {
        let benchmark_return: f64 = config
            .instruments
            .iter()
            .map(|i| i.weight * i.expected_return)
            .sum();
        let benchmark_vol: f64 = config
            .instruments
            .iter()
            .map(|i| i.weight * i.volatility)
            .sum();

        let profiles = config
            .instruments
            .iter()
            .map(|i| {
                ReturnProfile::relative_to(
                    i.expected_return,
                    i.volatility,
                    benchmark_return,
                    benchmark_vol,
                )
            })
            .collect();
        let pension_profile = config.pension_fund.as_ref().map_or(ReturnProfile::MARKET, |f| {
            ReturnProfile::relative_to(
                f.expected_return,
                f.volatility,
                benchmark_return,
                benchmark_vol,
            )
        });

        Self {
            config,
            start_law: config.economic_model.start_law(),
            weights: config.instruments.iter().map(|i| i.weight).collect(),
            profiles,
            monthly_ter: config
                .instruments
                .iter()
                .map(|i| monthly_rate(i.ter))
                .collect(),
            pension_profile,
            pension_monthly_ter: config
                .pension_fund
                .as_ref()
                .map_or(0.0, |f| monthly_rate(f.ter)),
            pension_monthly_contribution: config
                .pension_fund
                .as_ref()
                .map_or(0.0, |f| f.annual_contribution / MONTHS_PER_YEAR as f64),
            payout_month: config
                .pension_fund
                .as_ref()
                .map(|f| config.month_reaching_age(f.payout_age)),
            public_pension_month: config.month_reaching_age(config.public_pension.start_age),
            public_pension_monthly: config.public_pension.annual_amount / MONTHS_PER_YEAR as f64,
        }
    }

    fn run_trial(&self, trial_id: u64, seed: u64) -> Trajectory {
        let config = self.config;
        let horizon = config.horizon_months;
        let mut state = TrialState::new(config);
        let mut ledger = TrialLedger::default();
        let mut memo = WithdrawalMemo::default();
        let mut snapshots = Vec::with_capacity(horizon as usize);
        let mut retirement_price_index = 1.0;
        let mut retirement_worth: Option<(f64, f64)> = None;
        let mut first_year_real_withdrawals = 0.0;
        let mut exhausted_month = None;

        for draw in config
            .economic_model
            .path_with(&self.start_law, seed, horizon)
        {
            let month = draw.month;
            state.market_regime = draw.market_regime;
            state.inflation_regime = draw.inflation_regime;

            if month == config.retirement_month {
                retirement_price_index = state.price_index;
                let nominal = state.net_worth();
                retirement_worth = Some((nominal, nominal / state.price_index));
                state.phase = Phase::Retired;
            }
            let retired = month >= config.retirement_month;

            if !retired {
                self.accumulate(month, &mut state, &mut ledger);
            }
            self.contribute_to_pension(month, retired, &mut state, &mut ledger);
            self.pay_passive_income(month, &mut state, &mut ledger);

            let mut withdrawn = 0.0;
            if retired {
                let ctx = WithdrawalContext {
                    months_since_retirement: month - config.retirement_month,
                    liquid_wealth: state.liquid_wealth(),
                    price_index: state.price_index,
                    retirement_price_index,
                };
                let need = round_cents(config.withdrawal.monthly_withdrawal(&ctx, &mut memo));
                let outcome = self.withdraw(need, &mut state, &mut ledger);
                withdrawn = outcome.paid;
                if month < config.retirement_month + MONTHS_PER_YEAR {
                    first_year_real_withdrawals += withdrawn / state.price_index;
                }

                if outcome.exhausted {
                    debug!(trial_id, month, need, paid = withdrawn, "trial exhausted");
                    state.phase = Phase::Exhausted;
                    exhausted_month = Some(month);
                    let frozen = state.snapshot(month, withdrawn);
                    snapshots.push(frozen.clone());
                    push_frozen_tail(&mut snapshots, &frozen, horizon);
                    break;
                }
            }

            self.apply_market(&draw, &mut state);
            state.price_index *= 1.0 + draw.inflation;

            if month % MONTHS_PER_YEAR == MONTHS_PER_YEAR - 1 {
                self.close_year(month, &mut state, &mut ledger);
            } else if month + 1 == horizon {
                self.close_partial_year(&mut state, &mut ledger);
            }

            snapshots.push(state.snapshot(month, withdrawn));
        }

        let (retirement_net_worth, retirement_real_net_worth) = retirement_worth
            .unwrap_or_else(|| {
                let nominal = state.net_worth();
                (nominal, nominal / state.price_index)
            });

        Trajectory {
            trial_id,
            seed,
            max_drawdown: max_drawdown(snapshots.iter().map(|s| s.real_net_worth)),
            snapshots,
            exhausted_month,
            retirement_net_worth,
            retirement_real_net_worth,
            first_year_real_withdrawals,
            total_contributions: ledger.contributions,
            total_taxes: ledger.taxes,
        }
    }

    fn accumulate(&self, month: u32, state: &mut TrialState, ledger: &mut TrialLedger) {
        let schedule = &self.config.contributions;
        let years_elapsed = (month / MONTHS_PER_YEAR) as i32;
        let multiplier = (1.0 + schedule.annual_growth).powi(years_elapsed).max(0.0);

        let cash_in = round_cents(schedule.monthly_cash * multiplier);
        state.cash = round_cents(state.cash + cash_in);

        let etf_in = round_cents(schedule.monthly_etf * multiplier);
        if etf_in > 0.0 {
            for (position, weight) in state.positions.iter_mut().zip(&self.weights) {
                position.buy(etf_in * weight);
            }
        }

        ledger.contributions += cash_in + etf_in;
    }

    fn contribute_to_pension(
        &self,
        month: u32,
        retired: bool,
        state: &mut TrialState,
        ledger: &mut TrialLedger,
    ) {
        let Some(account) = state.pension.as_mut() else {
            return;
        };
        let before_payout = self.payout_month.is_none_or(|payout| month < payout);
        if retired || !before_payout {
            return;
        }
        let amount = round_cents(self.pension_monthly_contribution);
        account.balance += amount;
        account.contributions_this_year += amount;
        ledger.contributions += amount;
    }

    fn pay_passive_income(&self, month: u32, state: &mut TrialState, ledger: &mut TrialLedger) {
        if self.public_pension_monthly > 0.0 && month >= self.public_pension_month {
            let amount = round_cents(self.public_pension_monthly * state.price_index);
            state.cash = round_cents(state.cash + amount);
        }

        let (Some(fund), Some(payout_month)) = (self.config.pension_fund.as_ref(), self.payout_month)
        else {
            return;
        };
        if month < payout_month {
            return;
        }
        let price_index = state.price_index;
        let Some(account) = state.pension.as_mut() else {
            return;
        };

        let mut gross_paid = 0.0;
        if account.payout == PayoutState::Pending {
            let lump = round_cents(account.balance * fund.lump_sum_share);
            account.balance = (account.balance - lump).max(0.0);
            gross_paid += lump;
            let annuity_months = fund.annuity_years * MONTHS_PER_YEAR;
            account.payout = PayoutState::Annuity {
                monthly_real: account.balance / annuity_months as f64,
                months_left: annuity_months,
                price_index_at_start: price_index,
            };
        }

        if let PayoutState::Annuity {
            monthly_real,
            months_left,
            price_index_at_start,
        } = account.payout
        {
            let indexed = monthly_real * price_index / price_index_at_start;
            let installment = if months_left <= 1 {
                account.balance
            } else {
                indexed.min(account.balance)
            };
            let installment = round_cents(installment).min(account.balance);
            account.balance = (account.balance - installment).max(0.0);
            gross_paid += installment;
            account.payout = if months_left <= 1 || account.balance <= 0.0 {
                PayoutState::Finished
            } else {
                PayoutState::Annuity {
                    monthly_real,
                    months_left: months_left - 1,
                    price_index_at_start,
                }
            };
        }

        if gross_paid > 0.0 {
            let tax = round_cents(payout_tax(gross_paid, fund.payout_tax_rate));
            account.payouts_this_year += gross_paid;
            state.cash = round_cents(state.cash + gross_paid - tax);
            ledger.taxes += tax;
        }
    }

    fn withdraw(
        &self,
        need: f64,
        state: &mut TrialState,
        ledger: &mut TrialLedger,
    ) -> WithdrawalOutcome {
        if need <= 0.0 {
            return WithdrawalOutcome {
                paid: 0.0,
                exhausted: false,
            };
        }

        self.raise_cash(need, state, ledger);

        match self.config.cash_policy {
            CashPolicy::Capped => {
                let paid = need.min(state.cash.max(0.0));
                state.cash = round_cents(state.cash - paid);
                assert!(
                    state.cash >= 0.0,
                    "cash went negative under the capped policy: {}",
                    state.cash
                );
                WithdrawalOutcome {
                    paid,
                    exhausted: need - paid > HALF_CENT,
                }
            }
            CashPolicy::AllowOverdraft => {
                state.cash = round_cents(state.cash - need);
                WithdrawalOutcome {
                    paid: need,
                    exhausted: state.liquid_wealth() < -HALF_CENT,
                }
            }
        }
    }

    fn raise_cash(&self, amount: f64, state: &mut TrialState, ledger: &mut TrialLedger) {
        if state.cash >= amount {
            return;
        }
        let sale = liquidate_pro_rata(
            &mut state.positions,
            amount - state.cash,
            self.config.tax.capital_gain_rate,
        );
        state.cash = round_cents(state.cash + sale.net);
        ledger.taxes += sale.tax;
    }

    /// Returns the part of `amount` actually paid.
    fn pay_charge(&self, amount: f64, state: &mut TrialState, ledger: &mut TrialLedger) -> f64 {
        if amount <= 0.0 {
            return 0.0;
        }
        self.raise_cash(amount, state, ledger);
        let paid = match self.config.cash_policy {
            CashPolicy::Capped => amount.min(state.cash.max(0.0)),
            CashPolicy::AllowOverdraft => amount,
        };
        state.cash = round_cents(state.cash - paid);
        paid
    }

    fn apply_market(&self, draw: &MonthlyDraw, state: &mut TrialState) {
        for (idx, position) in state.positions.iter_mut().enumerate() {
            position.apply_return(draw.asset_return(&self.profiles[idx]));
            state.ter_accrued[idx] += self.monthly_ter[idx];
        }
        if let Some(account) = state.pension.as_mut() {
            let r = draw.asset_return(&self.pension_profile);
            account.balance = (account.balance * (1.0 + r)).max(0.0);
            account.ter_accrued += self.pension_monthly_ter;
        }
        state.broker_fee_accrued += self.config.tax.monthly_broker_fee;
    }

    fn charge_running_costs(&self, state: &mut TrialState) {
        for (position, accrued) in state.positions.iter_mut().zip(state.ter_accrued.iter_mut()) {
            position.charge_fraction(*accrued);
            *accrued = 0.0;
        }
        if let Some(account) = state.pension.as_mut() {
            account.balance *= 1.0 - account.ter_accrued.clamp(0.0, 1.0);
            account.ter_accrued = 0.0;
        }
    }

    fn pay_broker_fee(&self, state: &mut TrialState, ledger: &mut TrialLedger) {
        let fee = round_cents(state.broker_fee_accrued);
        state.broker_fee_accrued = 0.0;
        self.pay_charge(fee, state, ledger);
    }

    fn close_partial_year(&self, state: &mut TrialState, ledger: &mut TrialLedger) {
        self.charge_running_costs(state);
        self.pay_broker_fee(state, ledger);
    }

    fn close_year(&self, month: u32, state: &mut TrialState, ledger: &mut TrialLedger) {
        let tax = &self.config.tax;
        self.charge_running_costs(state);

        if let (Some(account), Some(fund)) =
            (state.pension.as_mut(), self.config.pension_fund.as_ref())
        {
            let accrual_tax = round_cents(pension_accrual_tax(
                account.balance,
                account.year_start_balance,
                account.contributions_this_year,
                account.payouts_this_year,
                fund.accrual_tax_rate,
            ))
            .min(account.balance);
            account.balance -= accrual_tax;
            ledger.taxes += accrual_tax;
            account.year_start_balance = account.balance;
            account.contributions_this_year = 0.0;
            account.payouts_this_year = 0.0;
        }

        self.pay_broker_fee(state, ledger);
        let stamp_duty = round_cents(
            securities_stamp_duty(state.etf_value(), tax.securities_stamp_duty)
                + cash_stamp_duty(state.cash, tax.cash_stamp_duty, tax.cash_stamp_threshold),
        );
        let duty_paid = self.pay_charge(stamp_duty, state, ledger);
        ledger.taxes += duty_paid;

        let glidepath = &self.config.glidepath;
        if glidepath.enabled {
            let target = glidepath.target_etf_share(self.config.age_at_month(month + 1));
            if let Some(orders) = plan_rebalance(
                &state.positions,
                &self.weights,
                state.cash,
                target,
                glidepath.tolerance,
            ) {
                let outcome = execute_orders(
                    &orders,
                    &mut state.positions,
                    &mut state.cash,
                    tax.capital_gain_rate,
                );
                ledger.taxes += outcome.tax_paid;
            }
        }
    }
}

// selling a share s of value V with gains G at rate t nets s * (V - t * G)
fn liquidate_pro_rata(positions: &mut [Position], shortfall: f64, cgt_rate: f64) -> SaleTotals {
    let value: f64 = positions.iter().map(Position::market_value).sum();
    if shortfall <= 0.0 || value <= 0.0 {
        return SaleTotals::default();
    }

    let gains: f64 = positions.iter().map(|p| p.unrealized_gain().max(0.0)).sum();
    let net_capacity = value - cgt_rate * gains;
    // rounding per sale can lose up to a cent each
    let target = shortfall + CENT * (positions.len() as f64 + 1.0);
    let share = if net_capacity <= 0.0 {
        1.0
    } else {
        (target / net_capacity).min(1.0)
    };

    let mut totals = SaleTotals::default();
    for position in positions.iter_mut() {
        let quantity = if share >= 1.0 {
            position.quantity
        } else {
            position.quantity * share
        };
        let sale = position.sell(quantity, cgt_rate);
        totals.tax += sale.tax;
        totals.net += sale.net;
    }
    totals
}

fn push_frozen_tail(snapshots: &mut Vec<MonthSnapshot>, frozen: &MonthSnapshot, horizon: u32) {
    for month in frozen.month + 1..horizon {
        snapshots.push(MonthSnapshot {
            month,
            withdrawal: 0.0,
            ..frozen.clone()
        });
    }
}

pub fn run_simulation(config: &ScenarioConfig) -> Result<SimulationResult, SimulationError> {
    run_simulation_cancellable(config, &AtomicBool::new(false))
}

pub fn run_simulation_cancellable(
    config: &ScenarioConfig,
    cancel: &AtomicBool,
) -> Result<SimulationResult, SimulationError> {
    config.validate()?;
    let started = Instant::now();
    let base_seed = match config.seed {
        Some(seed) => seed,
        None => {
            let seed = rand::random::<u64>();
            warn!(seed, "no seed configured; results will not be reproducible");
            seed
        }
    };

    let mut sustainable_withdrawal = None;
    let mut solved_config = None;
    if let WithdrawalPolicy::Fixed { annual_amount } = config.withdrawal {
        if annual_amount <= 0.0 && config.retirement_month < config.horizon_months {
            let solved = solve_sustainable_withdrawal(
                config,
                base_seed,
                SustainableSolveConfig::default(),
                cancel,
            )?;
            let mut resolved = config.clone();
            resolved.withdrawal = WithdrawalPolicy::Fixed {
                annual_amount: solved.annual_amount,
            };
            sustainable_withdrawal = Some(solved.annual_amount);
            solved_config = Some(resolved);
        }
    }
    let config = solved_config.as_ref().unwrap_or(config);

    info!(
        trials = config.simulations,
        horizon_months = config.horizon_months,
        retirement_month = config.retirement_month,
        model = %config.economic_model.name,
        policy = config.withdrawal.label(),
        seed = base_seed,
        "starting simulation"
    );

    let trajectories = run_trials(config, base_seed, config.simulations, cancel)?;
    let summary = summarize(
        &trajectories,
        config.horizon_months,
        config.retirement_month,
        config.economic_model.market.len(),
    );

    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        success_probability = summary.success_probability,
        median_terminal_real = summary.median_terminal_real,
        "simulation finished"
    );

    Ok(SimulationResult {
        summary,
        trajectories: config.record_trajectories.then_some(trajectories),
        sustainable_withdrawal,
    })
}

pub(crate) fn run_trials(
    config: &ScenarioConfig,
    base_seed: u64,
    trials: u32,
    cancel: &AtomicBool,
) -> Result<Vec<Trajectory>, SimulationError> {
    let plan = TrialPlan::new(config);
    let outcomes: Vec<Option<Trajectory>> = (0..trials as u64)
        .into_par_iter()
        .map(|trial_id| {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            Some(plan.run_trial(trial_id, derive_seed(base_seed, trial_id)))
        })
        .collect();

    let completed = outcomes.iter().filter(|o| o.is_some()).count();
    if completed < outcomes.len() {
        warn!(completed, requested = trials, "simulation cancelled");
        return Err(SimulationError::Cancelled {
            completed,
            requested: trials as usize,
        });
    }
    Ok(outcomes.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::glidepath::GlidepathConfig;
    use crate::core::presets::load_preset;
    use crate::core::regime::EconomicModel;
    use crate::core::types::{
        ContributionSchedule, EtfInstrument, PensionFundConfig, PublicPension, TaxConfig,
    };
    use proptest::prelude::{any, prop_assert, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected} +/- {tol}, got {actual}"
        );
    }

    fn world_etf() -> EtfInstrument {
        EtfInstrument {
            name: "world".to_string(),
            weight: 1.0,
            expected_return: 0.06,
            volatility: 0.15,
            ter: 0.0,
        }
    }

    fn sample_config() -> ScenarioConfig {
        ScenarioConfig {
            start_age: 40,
            horizon_months: 12,
            retirement_month: 12,
            initial_cash: 0.0,
            initial_etf_value: 100_000.0,
            initial_etf_cost_basis: 100_000.0,
            contributions: ContributionSchedule::default(),
            instruments: vec![world_etf()],
            pension_fund: None,
            withdrawal: WithdrawalPolicy::Fixed {
                annual_amount: 20_000.0,
            },
            glidepath: GlidepathConfig::default(),
            tax: TaxConfig::exempt(),
            public_pension: PublicPension::default(),
            economic_model: EconomicModel::constant(0.06, 0.0).unwrap(),
            simulations: 8,
            seed: Some(42),
            cash_policy: CashPolicy::Capped,
            record_trajectories: true,
        }
    }

    fn retirement_config() -> ScenarioConfig {
        let mut config = sample_config();
        config.start_age = 60;
        config.horizon_months = 120;
        config.retirement_month = 0;
        config.initial_cash = 10_000.0;
        config.initial_etf_value = 500_000.0;
        config.initial_etf_cost_basis = 300_000.0;
        config.tax = TaxConfig::default();
        config.economic_model = load_preset("volatile").unwrap();
        config.simulations = 32;
        config
    }

    fn trajectories(result: &SimulationResult) -> &[Trajectory] {
        result.trajectories.as_deref().expect("trajectories recorded")
    }

    #[test]
    fn degenerate_year_compounds_lump_sum_exactly() {
        let config = sample_config();
        let result = run_simulation(&config).unwrap();
        assert_eq!(result.summary.trials, 8);
        for trajectory in trajectories(&result) {
            assert_eq!(trajectory.snapshots.len(), 12);
            let terminal = trajectory.terminal().unwrap();
            assert_approx(terminal.nominal_net_worth, 106_000.0);
            assert_approx(terminal.real_net_worth, 106_000.0);
        }
        assert_approx(result.summary.median_terminal_nominal, 106_000.0);
        assert_approx(result.summary.success_probability, 1.0);
    }

    #[test]
    fn fixed_seed_reruns_are_identical() {
        let config = retirement_config();
        let first = run_simulation(&config).unwrap();
        let second = run_simulation(&config).unwrap();
        assert_eq!(first.summary, second.summary);
        assert_eq!(trajectories(&first), trajectories(&second));

        let mut reseeded = config.clone();
        reseeded.seed = Some(43);
        let third = run_simulation(&reseeded).unwrap();
        assert_ne!(trajectories(&first), trajectories(&third));
    }

    #[test]
    fn fixed_withdrawal_is_indexed_by_realized_inflation() {
        let mut config = sample_config();
        config.horizon_months = 36;
        config.retirement_month = 6;
        config.initial_cash = 1_000_000.0;
        config.initial_etf_value = 0.0;
        config.initial_etf_cost_basis = 0.0;
        config.economic_model = EconomicModel::single_regime(0.05, 0.0, 0.03, 0.02).unwrap();
        config.simulations = 4;

        let result = run_simulation(&config).unwrap();
        for trajectory in trajectories(&result) {
            let snaps = &trajectory.snapshots;
            let pi_at_start = |m: usize| if m == 0 { 1.0 } else { snaps[m - 1].price_index };
            let retirement_index = pi_at_start(6);
            for month in 6..36 {
                let expected = round_cents(20_000.0 / 12.0 * pi_at_start(month) / retirement_index);
                assert_approx(snaps[month].withdrawal, expected);
            }
            for snapshot in &snaps[..6] {
                assert_eq!(snapshot.withdrawal, 0.0);
            }
        }
    }

    #[test]
    fn exhaustion_is_absorbing_and_freezes_net_worth() {
        let mut config = sample_config();
        config.horizon_months = 48;
        config.retirement_month = 0;
        config.initial_cash = 5_000.0;
        config.initial_etf_value = 20_000.0;
        config.initial_etf_cost_basis = 10_000.0;
        config.tax = TaxConfig::default();
        config.withdrawal = WithdrawalPolicy::Fixed {
            annual_amount: 24_000.0,
        };

        let result = run_simulation(&config).unwrap();
        assert_approx(result.summary.success_probability, 0.0);
        for trajectory in trajectories(&result) {
            let month = trajectory.exhausted_month.expect("must exhaust");
            assert!(month < 24);
            assert_eq!(trajectory.snapshots.len(), 48);
            let frozen = &trajectory.snapshots[month as usize];
            for snapshot in &trajectory.snapshots[month as usize..] {
                assert!(snapshot.exhausted);
                assert_eq!(snapshot.phase, Phase::Exhausted);
                assert_eq!(snapshot.nominal_net_worth, frozen.nominal_net_worth);
            }
            for snapshot in &trajectory.snapshots {
                assert!(snapshot.cash >= 0.0);
            }
            assert!(trajectory.total_taxes > 0.0);
        }
    }

    #[test]
    fn overdraft_policy_lets_cash_dip_before_flagging() {
        let mut config = sample_config();
        config.horizon_months = 24;
        config.retirement_month = 0;
        config.initial_cash = 1_000.0;
        config.initial_etf_value = 0.0;
        config.initial_etf_cost_basis = 0.0;
        config.cash_policy = CashPolicy::AllowOverdraft;
        config.withdrawal = WithdrawalPolicy::Fixed {
            annual_amount: 18_000.0,
        };
        config.simulations = 1;

        let result = run_simulation(&config).unwrap();
        let trajectory = &trajectories(&result)[0];
        assert_eq!(trajectory.exhausted_month, Some(0));
        assert!(trajectory.snapshots[0].cash < 0.0);
        assert_eq!(trajectory.snapshots[0].nominal_net_worth, 0.0);
    }

    #[test]
    fn contributions_accumulate_and_grow_each_year() {
        let mut config = sample_config();
        config.horizon_months = 24;
        config.retirement_month = 24;
        config.initial_etf_value = 0.0;
        config.initial_etf_cost_basis = 0.0;
        config.economic_model = EconomicModel::constant(0.0, 0.0).unwrap();
        config.contributions = ContributionSchedule {
            monthly_cash: 100.0,
            monthly_etf: 200.0,
            annual_growth: 0.10,
        };
        config.simulations = 1;

        let result = run_simulation(&config).unwrap();
        let trajectory = &trajectories(&result)[0];
        let terminal = trajectory.terminal().unwrap();
        assert_approx(terminal.cash, 1_200.0 + 1_320.0);
        assert_approx(terminal.etf_value, 2_400.0 + 2_640.0);
        assert_approx(trajectory.total_contributions, 7_560.0);
    }

    #[test]
    fn pension_fund_pays_lump_sum_then_annuity_net_of_tax() {
        let mut config = sample_config();
        config.start_age = 66;
        config.horizon_months = 24;
        config.retirement_month = 0;
        config.initial_etf_value = 0.0;
        config.initial_etf_cost_basis = 0.0;
        config.withdrawal = WithdrawalPolicy::Fixed { annual_amount: 0.0 };
        config.economic_model = EconomicModel::constant(0.0, 0.0).unwrap();
        config.pension_fund = Some(PensionFundConfig {
            initial_balance: 120_000.0,
            annual_contribution: 5_000.0,
            expected_return: 0.0,
            volatility: 0.0,
            ter: 0.0,
            accrual_tax_rate: 0.20,
            payout_tax_rate: 0.15,
            payout_age: 67,
            lump_sum_share: 0.5,
            annuity_years: 10,
        });
        config.instruments[0].expected_return = 0.0;
        config.instruments[0].volatility = 0.0;
        config.simulations = 1;

        let plan = TrialPlan::new(&config);
        let trajectory = plan.run_trial(0, 1);
        let before = &trajectory.snapshots[11];
        assert_approx(before.pension_value, 120_000.0);
        assert_approx(before.cash, 0.0);

        // month 12: lump 60k and the first of 120 installments of 500
        let first = &trajectory.snapshots[12];
        assert_approx(first.cash, (60_000.0 + 500.0) * 0.85);
        assert_approx(first.pension_value, 59_500.0);
        let terminal = trajectory.terminal().unwrap();
        assert_approx(terminal.pension_value, 60_000.0 - 12.0 * 500.0);
        assert_approx(trajectory.total_taxes, (60_000.0 + 12.0 * 500.0) * 0.15);
    }

    #[test]
    fn pension_accrual_is_taxed_on_yearly_growth() {
        let mut config = sample_config();
        config.initial_etf_value = 0.0;
        config.initial_etf_cost_basis = 0.0;
        config.economic_model = EconomicModel::constant(0.12, 0.0).unwrap();
        config.instruments[0].expected_return = 0.12;
        config.instruments[0].volatility = 0.0;
        config.pension_fund = Some(PensionFundConfig {
            initial_balance: 10_000.0,
            annual_contribution: 0.0,
            expected_return: 0.12,
            volatility: 0.0,
            ter: 0.0,
            accrual_tax_rate: 0.20,
            payout_tax_rate: 0.15,
            payout_age: 90,
            lump_sum_share: 0.5,
            annuity_years: 10,
        });

        let plan = TrialPlan::new(&config);
        let trajectory = plan.run_trial(0, 7);
        let year_end = &trajectory.snapshots[11];
        // 1.2k growth, 240 accrual tax
        assert_approx_tol(year_end.pension_value, 10_960.0, 0.01);
        assert_approx_tol(trajectory.total_taxes, 240.0, 0.01);
    }

    #[test]
    fn year_end_charges_stamp_duty_and_ter() {
        let mut config = sample_config();
        config.economic_model = EconomicModel::constant(0.0, 0.0).unwrap();
        config.instruments[0].expected_return = 0.0;
        config.instruments[0].ter = 0.012;
        config.initial_cash = 10_000.0;
        config.tax = TaxConfig {
            capital_gain_rate: 0.26,
            securities_stamp_duty: 0.002,
            cash_stamp_duty: 34.20,
            cash_stamp_threshold: 5_000.0,
            monthly_broker_fee: 1.0,
        };
        config.simulations = 1;

        let result = run_simulation(&config).unwrap();
        let terminal = trajectories(&result)[0].terminal().unwrap();
        let etf_after_ter = 100_000.0 * (1.0 - 0.012);
        assert_approx(terminal.etf_value, etf_after_ter);
        let stamp = round_cents(etf_after_ter * 0.002) + 34.20;
        assert_approx(terminal.cash, 10_000.0 - 12.0 - stamp);
    }

    #[test]
    fn final_partial_year_still_pays_running_costs() {
        let mut config = sample_config();
        config.horizon_months = 18;
        config.retirement_month = 18;
        config.economic_model = EconomicModel::constant(0.0, 0.0).unwrap();
        config.instruments[0].expected_return = 0.0;
        config.instruments[0].volatility = 0.0;
        config.instruments[0].ter = 0.012;
        config.initial_cash = 1_000.0;
        config.tax.monthly_broker_fee = 2.0;
        config.pension_fund = Some(PensionFundConfig {
            initial_balance: 10_000.0,
            annual_contribution: 0.0,
            expected_return: 0.0,
            volatility: 0.0,
            ter: 0.012,
            accrual_tax_rate: 0.0,
            payout_tax_rate: 0.0,
            payout_age: 90,
            lump_sum_share: 0.5,
            annuity_years: 10,
        });

        let trajectory = TrialPlan::new(&config).run_trial(0, 0);
        assert_eq!(trajectory.snapshots.len(), 18);
        let terminal = trajectory.terminal().unwrap();
        assert_approx(terminal.etf_value, 100_000.0 * (1.0 - 0.012) * (1.0 - 0.006));
        assert_approx(terminal.pension_value, 10_000.0 * (1.0 - 0.012) * (1.0 - 0.006));
        assert_approx(terminal.cash, 1_000.0 - 18.0 * 2.0);
    }

    #[test]
    fn unpayable_year_end_duty_books_only_what_was_paid() {
        let mut config = sample_config();
        config.economic_model = EconomicModel::constant(0.0, 0.0).unwrap();
        config.instruments[0].expected_return = 0.0;
        config.instruments[0].volatility = 0.0;
        config.initial_cash = 100.0;
        config.initial_etf_value = 200.0;
        config.initial_etf_cost_basis = 200.0;
        config.tax.cash_stamp_duty = 500.0;
        config.tax.cash_stamp_threshold = 0.0;

        let trajectory = TrialPlan::new(&config).run_trial(0, 0);
        let terminal = trajectory.terminal().unwrap();
        assert_approx(terminal.cash, 0.0);
        assert_approx(terminal.etf_value, 0.0);
        assert_approx(trajectory.total_taxes, 300.0);
    }

    #[test]
    fn guardrail_draws_on_wealth_that_arrives_after_retirement() {
        let mut config = sample_config();
        config.start_age = 60;
        config.horizon_months = 48;
        config.retirement_month = 0;
        config.initial_etf_value = 0.0;
        config.initial_etf_cost_basis = 0.0;
        config.economic_model = EconomicModel::constant(0.0, 0.0).unwrap();
        config.instruments[0].expected_return = 0.0;
        config.instruments[0].volatility = 0.0;
        config.withdrawal = WithdrawalPolicy::Guardrail {
            initial_rate: 0.04,
            upper_rate: 0.05,
            lower_rate: 0.03,
            adjustment: 0.10,
        };
        config.pension_fund = Some(PensionFundConfig {
            initial_balance: 200_000.0,
            annual_contribution: 0.0,
            expected_return: 0.0,
            volatility: 0.0,
            ter: 0.0,
            accrual_tax_rate: 0.0,
            payout_tax_rate: 0.0,
            payout_age: 61,
            lump_sum_share: 1.0,
            annuity_years: 10,
        });

        let trajectory = TrialPlan::new(&config).run_trial(0, 0);
        assert!(!trajectory.is_exhausted());
        for snapshot in &trajectory.snapshots[..12] {
            assert_eq!(snapshot.withdrawal, 0.0);
        }
        let first_paid = &trajectory.snapshots[12];
        assert_approx(first_paid.withdrawal, round_cents(8_000.0 / 12.0));
        assert_approx(first_paid.cash, 200_000.0 - round_cents(8_000.0 / 12.0));
        assert!(trajectory.snapshots[47].withdrawal > 0.0);
    }

    #[test]
    fn shortfall_liquidation_pays_capital_gain_tax() {
        let mut config = sample_config();
        config.horizon_months = 1;
        config.retirement_month = 0;
        config.initial_etf_value = 100_000.0;
        config.initial_etf_cost_basis = 50_000.0;
        config.economic_model = EconomicModel::constant(0.0, 0.0).unwrap();
        config.instruments[0].expected_return = 0.0;
        config.tax.capital_gain_rate = 0.26;
        config.withdrawal = WithdrawalPolicy::Fixed {
            annual_amount: 12_000.0,
        };
        config.simulations = 1;

        let trajectory = TrialPlan::new(&config).run_trial(0, 0);
        let snapshot = &trajectory.snapshots[0];
        assert_approx(snapshot.withdrawal, 1_000.0);
        // net 0.87 per unit sold: 1000/0.87 gross, half of it gain
        let gross_needed = 1_000.0 / 0.87;
        assert_approx_tol(snapshot.etf_value, 100_000.0 - gross_needed, 0.05);
        assert_approx_tol(trajectory.total_taxes, gross_needed * 0.5 * 0.26, 0.05);
        assert!(snapshot.cash >= 0.0 && snapshot.cash < 0.1);
    }

    #[test]
    fn glidepath_rebalances_at_year_end() {
        let mut config = sample_config();
        config.economic_model = EconomicModel::constant(0.0, 0.0).unwrap();
        config.instruments[0].expected_return = 0.0;
        config.glidepath = GlidepathConfig {
            enabled: true,
            start_age: 40.0,
            end_age: 41.0,
            start_etf_share: 0.5,
            end_etf_share: 0.5,
            tolerance: 0.01,
        };
        config.simulations = 1;

        let trajectory = TrialPlan::new(&config).run_trial(0, 0);
        let before = &trajectory.snapshots[10];
        let after = &trajectory.snapshots[11];
        assert_approx(before.etf_value, 100_000.0);
        assert_approx(after.etf_value, 50_000.0);
        assert_approx(after.cash, 50_000.0);
    }

    #[test]
    fn public_pension_is_inflation_indexed_from_start_age() {
        let mut config = sample_config();
        config.start_age = 66;
        config.horizon_months = 24;
        config.retirement_month = 24;
        config.initial_etf_value = 0.0;
        config.initial_etf_cost_basis = 0.0;
        config.economic_model = EconomicModel::constant(0.0, 0.12).unwrap();
        config.public_pension = PublicPension {
            annual_amount: 12_000.0,
            start_age: 67,
        };
        config.simulations = 1;

        let trajectory = TrialPlan::new(&config).run_trial(0, 0);
        assert_eq!(trajectory.snapshots[11].cash, 0.0);
        let pi_at_12 = trajectory.snapshots[11].price_index;
        assert_approx(trajectory.snapshots[12].cash, round_cents(1_000.0 * pi_at_12));
    }

    #[test]
    fn zero_fixed_amount_solves_for_sustainable_withdrawal() {
        let mut config = retirement_config();
        config.withdrawal = WithdrawalPolicy::Fixed { annual_amount: 0.0 };
        config.economic_model = EconomicModel::single_regime(0.04, 0.10, 0.02, 0.0).unwrap();
        config.simulations = 40;

        let result = run_simulation(&config).unwrap();
        let amount = result.sustainable_withdrawal.expect("solver runs for zero amount");
        assert!(amount > 0.0);
        assert!(result.summary.success_probability > 0.0);
    }

    #[test]
    fn cancelled_run_reports_cancellation() {
        let config = retirement_config();
        let cancel = AtomicBool::new(true);
        match run_simulation_cancellable(&config, &cancel) {
            Err(SimulationError::Cancelled {
                completed,
                requested,
            }) => {
                assert_eq!(completed, 0);
                assert_eq!(requested, 32);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn invalid_config_is_rejected_before_running() {
        let mut config = sample_config();
        config.instruments[0].weight = 0.7;
        assert!(matches!(
            run_simulation(&config),
            Err(SimulationError::Config(_))
        ));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(24))]

        #[test]
        fn prop_trajectories_are_finite_and_non_negative(
            seed in any::<u64>(),
            preset in 0usize..4,
            rate in 0.0f64..0.08,
        ) {
            let ids = ["volatile", "stagflation-1970s", "steady-growth", "prolonged-crisis"];
            let mut config = retirement_config();
            config.economic_model = load_preset(ids[preset]).unwrap();
            config.withdrawal = WithdrawalPolicy::PercentOfBalance { annual_rate: rate };
            config.seed = Some(seed);
            config.simulations = 4;

            let result = run_simulation(&config).unwrap();
            for trajectory in trajectories(&result) {
                prop_assert!(trajectory.snapshots.len() == 120);
                for snapshot in &trajectory.snapshots {
                    prop_assert!(snapshot.nominal_net_worth.is_finite());
                    prop_assert!(snapshot.nominal_net_worth >= 0.0);
                    prop_assert!(snapshot.cash >= 0.0);
                    prop_assert!(snapshot.price_index > 0.0);
                }
            }
            prop_assert!(result.summary.success_probability >= 0.0);
            prop_assert!(result.summary.success_probability <= 1.0);
        }

        #[test]
        fn prop_price_index_is_running_product_of_inflation(seed in any::<u64>()) {
            let mut config = retirement_config();
            config.withdrawal = WithdrawalPolicy::Fixed { annual_amount: 0.0 };
            config.retirement_month = config.horizon_months;
            config.seed = Some(seed);
            let plan = TrialPlan::new(&config);
            let trial_seed = derive_seed(seed, 3);
            let trajectory = plan.run_trial(3, trial_seed);

            let mut expected = 1.0;
            for (draw, snapshot) in config
                .economic_model
                .path(trial_seed, config.horizon_months)
                .zip(&trajectory.snapshots)
            {
                expected *= 1.0 + draw.inflation;
                prop_assert!((snapshot.price_index - expected).abs() <= 1e-12 * expected.max(1.0));
                prop_assert!(draw.market_regime == snapshot.market_regime);
            }
        }
    }
}
