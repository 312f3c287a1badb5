use std::sync::atomic::AtomicBool;

use tracing::debug;

use super::aggregate::percentile;
use super::engine::run_trials;
use super::error::SimulationError;
use super::types::{ScenarioConfig, Trajectory};
use super::withdrawal::WithdrawalPolicy;

#[derive(Debug, Clone, Copy)]
pub struct SustainableSolveConfig {
    pub max_iterations: u32,
    pub min_simulations: u32,
    pub simulation_divisor: u32,
    pub target_success: f64,
    pub upper_bound_expansions: u32,
}

impl Default for SustainableSolveConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            min_simulations: 100,
            simulation_divisor: 4,
            target_success: 0.5,
            upper_bound_expansions: 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate: f64,
    pub success_probability: f64,
}

#[derive(Debug, Clone)]
pub struct SustainableWithdrawal {
    pub annual_amount: f64,
    pub success_probability: f64,
    pub simulations_per_iteration: u32,
    pub iterations: Vec<SolveIteration>,
}

/// Every candidate reuses the same trial seeds.
pub fn solve_sustainable_withdrawal(
    config: &ScenarioConfig,
    base_seed: u64,
    settings: SustainableSolveConfig,
    cancel: &AtomicBool,
) -> Result<SustainableWithdrawal, SimulationError> {
    let simulations = (config.simulations / settings.simulation_divisor.max(1))
        .max(settings.min_simulations)
        .max(1);
    let retirement_years =
        (config.horizon_months.saturating_sub(config.retirement_month) as f64 / 12.0).max(1.0 / 12.0);

    let mut baseline = config.clone();
    baseline.withdrawal = WithdrawalPolicy::Fixed { annual_amount: 0.0 };
    let baseline_runs = run_trials(&baseline, base_seed, simulations, cancel)?;
    let mut retirement_wealth: Vec<f64> = baseline_runs
        .iter()
        .map(|t| t.retirement_real_net_worth)
        .collect();
    let median_wealth = percentile(&mut retirement_wealth, 50.0);

    let mut lo = 0.0;
    let mut lo_success = success_share(&baseline_runs);
    let mut hi = (median_wealth / retirement_years).max(1.0);
    let mut iterations = Vec::with_capacity(settings.max_iterations as usize);

    let evaluate = |amount: f64| -> Result<f64, SimulationError> {
        let mut candidate = config.clone();
        candidate.withdrawal = WithdrawalPolicy::Fixed {
            annual_amount: amount,
        };
        Ok(success_share(&run_trials(
            &candidate, base_seed, simulations, cancel,
        )?))
    };

    let mut expansions = 0;
    loop {
        let success = evaluate(hi)?;
        if success < settings.target_success || expansions >= settings.upper_bound_expansions {
            if success >= settings.target_success {
                lo = hi;
                lo_success = success;
            }
            break;
        }
        lo = hi;
        lo_success = success;
        hi *= 2.0;
        expansions += 1;
    }

    for iteration in 1..=settings.max_iterations {
        if lo == hi {
            break;
        }
        let mid = (lo + hi) * 0.5;
        let success = evaluate(mid)?;
        debug!(
            iteration,
            lower = lo,
            upper = hi,
            candidate = mid,
            success,
            "sustainable withdrawal bisection"
        );
        iterations.push(SolveIteration {
            iteration,
            lower_bound: lo,
            upper_bound: hi,
            candidate: mid,
            success_probability: success,
        });

        if success >= settings.target_success {
            lo = mid;
            lo_success = success;
        } else {
            hi = mid;
        }
    }

    Ok(SustainableWithdrawal {
        annual_amount: lo,
        success_probability: lo_success,
        simulations_per_iteration: simulations,
        iterations,
    })
}

fn success_share(trajectories: &[Trajectory]) -> f64 {
    if trajectories.is_empty() {
        return 0.0;
    }
    let survived = trajectories.iter().filter(|t| !t.is_exhausted()).count();
    survived as f64 / trajectories.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::glidepath::GlidepathConfig;
    use crate::core::regime::EconomicModel;
    use crate::core::types::{
        CashPolicy, ContributionSchedule, EtfInstrument, PublicPension, TaxConfig,
    };

    fn retiree(model: EconomicModel) -> ScenarioConfig {
        ScenarioConfig {
            start_age: 65,
            horizon_months: 240,
            retirement_month: 0,
            initial_cash: 0.0,
            initial_etf_value: 400_000.0,
            initial_etf_cost_basis: 400_000.0,
            contributions: ContributionSchedule::default(),
            instruments: vec![EtfInstrument {
                name: "world".to_string(),
                weight: 1.0,
                expected_return: 0.05,
                volatility: 0.0,
                ter: 0.0,
            }],
            pension_fund: None,
            withdrawal: WithdrawalPolicy::Fixed { annual_amount: 0.0 },
            glidepath: GlidepathConfig::default(),
            tax: TaxConfig::exempt(),
            public_pension: PublicPension::default(),
            economic_model: model,
            simulations: 40,
            seed: Some(5),
            cash_policy: CashPolicy::Capped,
            record_trajectories: false,
        }
    }

    #[test]
    fn zero_return_world_solves_to_capital_over_years() {
        let config = retiree(EconomicModel::constant(0.0, 0.0).unwrap());
        let solved = solve_sustainable_withdrawal(
            &config,
            1,
            SustainableSolveConfig {
                max_iterations: 30,
                ..SustainableSolveConfig::default()
            },
            &AtomicBool::new(false),
        )
        .unwrap();
        // 400k spread over 20 years
        assert!((solved.annual_amount - 20_000.0).abs() < 25.0, "{}", solved.annual_amount);
        assert!(solved.success_probability >= 0.5);
        assert_eq!(solved.simulations_per_iteration, 100);
    }

    #[test]
    fn positive_real_returns_allow_more_than_capital_over_years() {
        let config = retiree(EconomicModel::constant(0.05, 0.0).unwrap());
        let solved = solve_sustainable_withdrawal(
            &config,
            1,
            SustainableSolveConfig::default(),
            &AtomicBool::new(false),
        )
        .unwrap();
        assert!(solved.annual_amount > 20_000.0);
        assert!(!solved.iterations.is_empty());
        for pair in solved.iterations.windows(2) {
            assert!(pair[1].upper_bound - pair[1].lower_bound <= pair[0].upper_bound - pair[0].lower_bound);
        }
    }

    #[test]
    fn cancellation_propagates() {
        let config = retiree(EconomicModel::constant(0.0, 0.0).unwrap());
        let err = solve_sustainable_withdrawal(
            &config,
            1,
            SustainableSolveConfig::default(),
            &AtomicBool::new(true),
        )
        .unwrap_err();
        assert!(matches!(err, SimulationError::Cancelled { .. }));
    }
}
