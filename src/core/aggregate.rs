use super::types::{PercentileBand, SimulationSummary, Trajectory};

pub fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}

pub fn band(values: &mut [f64]) -> PercentileBand {
    PercentileBand {
        p10: percentile(values, 10.0),
        p25: percentile(values, 25.0),
        p50: percentile(values, 50.0),
        p75: percentile(values, 75.0),
        p90: percentile(values, 90.0),
    }
}

pub fn max_drawdown(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for value in values {
        peak = peak.max(value);
        if peak > 0.0 {
            worst = worst.max((peak - value.max(0.0)) / peak);
        }
    }
    worst
}

fn median(mut values: Vec<f64>) -> f64 {
    percentile(&mut values, 50.0)
}

pub fn summarize(
    trajectories: &[Trajectory],
    horizon_months: u32,
    retirement_month: u32,
    market_regimes: usize,
) -> SimulationSummary {
    let trials = trajectories.len();
    let months = horizon_months as usize;

    let mut nominal_bands = Vec::with_capacity(months);
    let mut real_bands = Vec::with_capacity(months);
    let mut nominal_column = Vec::with_capacity(trials);
    let mut real_column = Vec::with_capacity(trials);
    for month in 0..months {
        nominal_column.clear();
        real_column.clear();
        for trajectory in trajectories {
            if let Some(snapshot) = trajectory.snapshots.get(month) {
                nominal_column.push(snapshot.nominal_net_worth);
                real_column.push(snapshot.real_net_worth);
            }
        }
        nominal_bands.push(band(&mut nominal_column));
        real_bands.push(band(&mut real_column));
    }

    let terminal_nominal_values: Vec<f64> = trajectories
        .iter()
        .map(|t| t.terminal().map_or(0.0, |s| s.nominal_net_worth))
        .collect();
    let terminal_real_values: Vec<f64> = trajectories
        .iter()
        .map(|t| t.terminal().map_or(0.0, |s| s.real_net_worth))
        .collect();
    let terminal_nominal = band(&mut terminal_nominal_values.clone());
    let terminal_real = band(&mut terminal_real_values.clone());

    let exhausted = trajectories.iter().filter(|t| t.is_exhausted()).count();
    let success_probability = if trials == 0 {
        0.0
    } else {
        (trials - exhausted) as f64 / trials as f64
    };

    let sustainable_rates: Vec<f64> = trajectories
        .iter()
        .filter(|_| retirement_month < horizon_months)
        .filter(|t| !t.is_exhausted() && t.retirement_real_net_worth > 0.0)
        .map(|t| t.first_year_real_withdrawals / t.retirement_real_net_worth)
        .collect();
    let sustainable_withdrawal_rate = if sustainable_rates.is_empty() {
        None
    } else {
        Some(median(sustainable_rates))
    };

    let drawdowns: Vec<f64> = trajectories.iter().map(|t| t.max_drawdown).collect();
    let worst_drawdown = drawdowns.iter().copied().fold(0.0, f64::max);

    let median_trial_index = terminal_real_values
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - terminal_real.p50)
                .abs()
                .total_cmp(&(*b - terminal_real.p50).abs())
        })
        .map_or(0, |(idx, _)| idx);

    let mut regime_counts = vec![0_usize; market_regimes];
    let mut observed = 0_usize;
    for trajectory in trajectories {
        for snapshot in &trajectory.snapshots {
            if let Some(count) = regime_counts.get_mut(snapshot.market_regime) {
                *count += 1;
                observed += 1;
            }
        }
    }
    let market_regime_share = regime_counts
        .into_iter()
        .map(|count| {
            if observed == 0 {
                0.0
            } else {
                count as f64 / observed as f64
            }
        })
        .collect();

    SimulationSummary {
        trials,
        horizon_months,
        retirement_month,
        nominal_bands,
        real_bands,
        terminal_nominal,
        terminal_real,
        success_probability,
        failure_probability: 1.0 - success_probability,
        median_terminal_nominal: terminal_nominal.p50,
        median_terminal_real: terminal_real.p50,
        sustainable_withdrawal_rate,
        median_retirement_net_worth: median(
            trajectories.iter().map(|t| t.retirement_net_worth).collect(),
        ),
        median_retirement_real_net_worth: median(
            trajectories
                .iter()
                .map(|t| t.retirement_real_net_worth)
                .collect(),
        ),
        worst_drawdown,
        median_drawdown: median(drawdowns),
        median_total_taxes: median(trajectories.iter().map(|t| t.total_taxes).collect()),
        median_total_contributions: median(
            trajectories
                .iter()
                .map(|t| t.total_contributions)
                .collect(),
        ),
        median_trial_index,
        market_regime_share,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MonthSnapshot, Phase};

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn trajectory(trial_id: u64, path: &[f64], exhausted_month: Option<u32>) -> Trajectory {
        let snapshots = path
            .iter()
            .enumerate()
            .map(|(month, value)| MonthSnapshot {
                month: month as u32,
                nominal_net_worth: *value,
                real_net_worth: value / 1.01,
                cash: *value,
                etf_value: 0.0,
                pension_value: 0.0,
                price_index: 1.01,
                market_regime: month % 2,
                inflation_regime: 0,
                withdrawal: 0.0,
                exhausted: exhausted_month.is_some_and(|m| month as u32 >= m),
                phase: Phase::Retired,
            })
            .collect();
        Trajectory {
            trial_id,
            seed: trial_id,
            snapshots,
            exhausted_month,
            retirement_net_worth: path[0],
            retirement_real_net_worth: path[0] / 1.01,
            first_year_real_withdrawals: path[0] / 1.01 * 0.04,
            total_contributions: 0.0,
            total_taxes: 10.0 * trial_id as f64,
            max_drawdown: max_drawdown(path.iter().copied()),
        }
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        assert_approx(percentile(&mut values, 50.0), 2.5);
        assert_approx(percentile(&mut values, 0.0), 1.0);
        assert_approx(percentile(&mut values, 100.0), 4.0);
    }

    #[test]
    fn single_trial_bands_collapse_to_its_trajectory() {
        let path = [100.0, 120.0, 90.0, 130.0];
        let summary = summarize(&[trajectory(0, &path, None)], 4, 0, 2);
        for (month, value) in path.iter().enumerate() {
            let b = summary.nominal_bands[month];
            for p in [b.p10, b.p25, b.p50, b.p75, b.p90] {
                assert_approx(p, *value);
            }
            assert_approx(summary.real_bands[month].p90, value / 1.01);
        }
        assert_approx(summary.median_terminal_nominal, 130.0);
        assert_approx(summary.success_probability, 1.0);
        assert_eq!(summary.median_trial_index, 0);
    }

    #[test]
    fn success_probability_counts_exhausted_flags() {
        let trajectories = [
            trajectory(0, &[100.0, 50.0, 0.0], Some(2)),
            trajectory(1, &[100.0, 110.0, 120.0], None),
            trajectory(2, &[100.0, 105.0, 108.0], None),
            trajectory(3, &[100.0, 20.0, 0.0], Some(1)),
        ];
        let summary = summarize(&trajectories, 3, 0, 2);
        assert_approx(summary.success_probability, 0.5);
        assert_approx(summary.failure_probability, 0.5);
        assert_approx(summary.worst_drawdown, 1.0);
        assert_approx(summary.sustainable_withdrawal_rate.unwrap(), 0.04);
        assert_approx(summary.market_regime_share[0], 8.0 / 12.0);
    }

    #[test]
    fn median_trial_is_closest_to_median_terminal_real() {
        let trajectories = [
            trajectory(0, &[100.0, 300.0], None),
            trajectory(1, &[100.0, 150.0], None),
            trajectory(2, &[100.0, 10.0], None),
        ];
        let summary = summarize(&trajectories, 2, 0, 2);
        assert_eq!(summary.median_trial_index, 1);
    }

    #[test]
    fn drawdown_tracks_running_peak() {
        assert_approx(max_drawdown([100.0, 150.0, 75.0, 200.0, 180.0]), 0.5);
        assert_approx(max_drawdown([1.0, 2.0, 3.0]), 0.0);
    }
}
