use std::borrow::Cow;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use super::error::ConfigError;

const ROW_SUM_TOLERANCE: f64 = 1e-9;
const MONTHS_PER_YEAR: f64 = 12.0;
const INFLATION_FLOOR: f64 = -0.99;

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMatrix {
    rows: Vec<Vec<f64>>,
}

impl TransitionMatrix {
    pub fn new(family: &'static str, rows: Vec<Vec<f64>>) -> Result<Self, ConfigError> {
        let size = rows.len();
        if size == 0 {
            return Err(ConfigError::EmptyFamily { family });
        }

        for (row_idx, row) in rows.iter().enumerate() {
            if row.len() != size {
                return Err(ConfigError::MatrixShape {
                    family,
                    rows: size,
                    cols: row.len(),
                    expected: size,
                });
            }
            for &p in row {
                if !p.is_finite() || p < 0.0 {
                    return Err(ConfigError::NegativeProbability {
                        family,
                        row: row_idx,
                        value: p,
                    });
                }
            }
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                return Err(ConfigError::RowSum {
                    family,
                    row: row_idx,
                    sum,
                });
            }
        }

        Ok(Self { rows })
    }

    pub fn identity(size: usize) -> Self {
        let rows = (0..size)
            .map(|i| (0..size).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        Self { rows }
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, state: usize) -> &[f64] {
        &self.rows[state]
    }

    /// Rows with a single reachable successor consume no randomness.
    pub fn next_state<R: Rng + ?Sized>(&self, current: usize, rng: &mut R) -> usize {
        let row = &self.rows[current];
        let mut reachable = row.iter().enumerate().filter(|(_, p)| **p > 0.0);
        let first = reachable.next().map(|(idx, _)| idx).unwrap_or(current);
        if reachable.next().is_none() {
            return first;
        }

        let u: f64 = rng.gen_range(0.0..1.0);
        let mut cumulative = 0.0;
        let mut last_positive = first;
        for (idx, &p) in row.iter().enumerate() {
            if p <= 0.0 {
                continue;
            }
            cumulative += p;
            last_positive = idx;
            if u < cumulative {
                return idx;
            }
        }
        last_positive
    }

    pub fn stationary_distribution(&self) -> Vec<f64> {
        let n = self.size();
        let mut dist = vec![1.0 / n as f64; n];
        for _ in 0..20_000 {
            let mut next = vec![0.0; n];
            for (i, &mass) in dist.iter().enumerate() {
                next[i] += 0.5 * mass;
                for (j, &p) in self.rows[i].iter().enumerate() {
                    next[j] += 0.5 * mass * p;
                }
            }
            let delta: f64 = next
                .iter()
                .zip(dist.iter())
                .map(|(a, b)| (a - b).abs())
                .sum();
            dist = next;
            if delta < 1e-14 {
                break;
            }
        }
        dist
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketRegime {
    pub name: String,
    pub location: f64,
    pub scale: f64,
}

impl MarketRegime {
    pub fn from_annual(
        name: impl Into<String>,
        annual_return: f64,
        annual_volatility: f64,
    ) -> Result<Self, ConfigError> {
        if !annual_return.is_finite() || annual_return <= -1.0 {
            return Err(ConfigError::OutOfRange {
                field: "market regime mean",
                expected: "> -1",
                value: annual_return,
            });
        }
        if !annual_volatility.is_finite() || annual_volatility < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "market regime volatility",
                expected: ">= 0",
                value: annual_volatility,
            });
        }

        let scale = annual_volatility / MONTHS_PER_YEAR.sqrt();
        let location = (1.0 + annual_return).ln() / MONTHS_PER_YEAR - 0.5 * scale * scale;
        Ok(Self {
            name: name.into(),
            location,
            scale,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InflationRegime {
    pub name: String,
    pub location: f64,
    pub scale: f64,
}

impl InflationRegime {
    pub fn from_annual(
        name: impl Into<String>,
        annual_rate: f64,
        annual_volatility: f64,
    ) -> Result<Self, ConfigError> {
        if !annual_rate.is_finite() || annual_rate <= -1.0 {
            return Err(ConfigError::OutOfRange {
                field: "inflation regime mean",
                expected: "> -1",
                value: annual_rate,
            });
        }
        if !annual_volatility.is_finite() || annual_volatility < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "inflation regime volatility",
                expected: ">= 0",
                value: annual_volatility,
            });
        }

        Ok(Self {
            name: name.into(),
            location: annual_rate / MONTHS_PER_YEAR,
            scale: annual_volatility / MONTHS_PER_YEAR.sqrt(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialRegime {
    Fixed(usize),
    Stationary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InflationTransitions {
    Independent(TransitionMatrix),
    CoupledToMarket(Vec<TransitionMatrix>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EconomicModel {
    pub name: String,
    pub market: Vec<MarketRegime>,
    pub market_transitions: TransitionMatrix,
    pub initial_market: InitialRegime,
    pub inflation: Vec<InflationRegime>,
    pub inflation_transitions: InflationTransitions,
    pub initial_inflation: InitialRegime,
}

impl EconomicModel {
    pub fn constant(annual_return: f64, annual_inflation: f64) -> Result<Self, ConfigError> {
        Self::single_regime(annual_return, 0.0, annual_inflation, 0.0)
    }

    pub fn single_regime(
        annual_return: f64,
        annual_volatility: f64,
        annual_inflation: f64,
        inflation_volatility: f64,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: "single-regime".to_string(),
            market: vec![MarketRegime::from_annual(
                "Normal",
                annual_return,
                annual_volatility,
            )?],
            market_transitions: TransitionMatrix::identity(1),
            initial_market: InitialRegime::Fixed(0),
            inflation: vec![InflationRegime::from_annual(
                "Normal",
                annual_inflation,
                inflation_volatility,
            )?],
            inflation_transitions: InflationTransitions::Independent(TransitionMatrix::identity(1)),
            initial_inflation: InitialRegime::Fixed(0),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.market.is_empty() {
            return Err(ConfigError::EmptyFamily { family: "market" });
        }
        if self.inflation.is_empty() {
            return Err(ConfigError::EmptyFamily {
                family: "inflation",
            });
        }

        let market_size = self.market.len();
        if self.market_transitions.size() != market_size {
            return Err(ConfigError::MatrixShape {
                family: "market",
                rows: self.market_transitions.size(),
                cols: self.market_transitions.size(),
                expected: market_size,
            });
        }

        let inflation_size = self.inflation.len();
        match &self.inflation_transitions {
            InflationTransitions::Independent(matrix) => {
                check_size("inflation", matrix, inflation_size)?;
            }
            InflationTransitions::CoupledToMarket(matrices) => {
                if matrices.len() != market_size {
                    return Err(ConfigError::Inconsistent {
                        field: "inflation coupling",
                        reason: format!(
                            "expected one matrix per market regime ({market_size}), got {}",
                            matrices.len()
                        ),
                    });
                }
                for matrix in matrices {
                    check_size("inflation", matrix, inflation_size)?;
                }
            }
        }

        if let InitialRegime::Fixed(idx) = self.initial_market {
            if idx >= market_size {
                return Err(ConfigError::Inconsistent {
                    field: "initial market regime",
                    reason: format!("index {idx} outside {market_size} regimes"),
                });
            }
        }
        if let InitialRegime::Fixed(idx) = self.initial_inflation {
            if idx >= inflation_size {
                return Err(ConfigError::Inconsistent {
                    field: "initial inflation regime",
                    reason: format!("index {idx} outside {inflation_size} regimes"),
                });
            }
        }

        Ok(())
    }

    pub fn market_regime_index(&self, name: &str) -> Option<usize> {
        self.market.iter().position(|r| r.name == name)
    }

    pub fn inflation_regime_index(&self, name: &str) -> Option<usize> {
        self.inflation.iter().position(|r| r.name == name)
    }

    pub fn path(&self, seed: u64, horizon_months: u32) -> RegimePath<'_> {
        RegimePath::new(self, Cow::Owned(self.start_law()), seed, horizon_months)
    }

    pub fn path_with<'a>(
        &'a self,
        start: &'a StartLaw,
        seed: u64,
        horizon_months: u32,
    ) -> RegimePath<'a> {
        RegimePath::new(self, Cow::Borrowed(start), seed, horizon_months)
    }

    pub fn start_law(&self) -> StartLaw {
        let market = (self.initial_market == InitialRegime::Stationary)
            .then(|| self.market_transitions.stationary_distribution());
        let inflation = (self.initial_inflation == InitialRegime::Stationary).then(|| {
            match &self.inflation_transitions {
                InflationTransitions::Independent(matrix) => {
                    vec![matrix.stationary_distribution()]
                }
                InflationTransitions::CoupledToMarket(matrices) => matrices
                    .iter()
                    .map(TransitionMatrix::stationary_distribution)
                    .collect(),
            }
        });
        StartLaw { market, inflation }
    }

    fn inflation_matrix(&self, market_state: usize) -> &TransitionMatrix {
        match &self.inflation_transitions {
            InflationTransitions::Independent(matrix) => matrix,
            InflationTransitions::CoupledToMarket(matrices) => &matrices[market_state],
        }
    }

}

fn check_size(
    family: &'static str,
    matrix: &TransitionMatrix,
    expected: usize,
) -> Result<(), ConfigError> {
    if matrix.size() != expected {
        return Err(ConfigError::MatrixShape {
            family,
            rows: matrix.size(),
            cols: matrix.size(),
            expected,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonthlyDraw {
    pub month: u32,
    pub market_regime: usize,
    pub inflation_regime: usize,
    pub market_return: f64,
    pub inflation: f64,
    market_location: f64,
    market_scale: f64,
    market_shock: f64,
}

impl MonthlyDraw {
    pub fn asset_return(&self, profile: &ReturnProfile) -> f64 {
        log_normal_return(
            self.market_location + profile.log_tilt,
            self.market_scale * profile.vol_ratio,
            self.market_shock,
        )
    }
}

fn log_normal_return(location: f64, scale: f64, shock: f64) -> f64 {
    (location + scale * shock).exp() - 1.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReturnProfile {
    pub vol_ratio: f64,
    pub log_tilt: f64,
}

impl ReturnProfile {
    pub const MARKET: ReturnProfile = ReturnProfile {
        vol_ratio: 1.0,
        log_tilt: 0.0,
    };

    pub fn relative_to(
        expected_return: f64,
        volatility: f64,
        benchmark_return: f64,
        benchmark_volatility: f64,
    ) -> Self {
        let vol_ratio = if benchmark_volatility > 1e-12 {
            (volatility / benchmark_volatility).max(0.0)
        } else {
            1.0
        };
        let log_tilt = ((1.0 + expected_return).max(1e-9).ln()
            - (1.0 + benchmark_return).max(1e-9).ln())
            / MONTHS_PER_YEAR;
        Self {
            vol_ratio,
            log_tilt,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartLaw {
    market: Option<Vec<f64>>,
    inflation: Option<Vec<Vec<f64>>>,
}

impl StartLaw {
    fn inflation_for(&self, market_state: usize) -> Option<&[f64]> {
        let laws = self.inflation.as_ref()?;
        laws.get(market_state)
            .or_else(|| laws.first())
            .map(Vec::as_slice)
    }
}

#[derive(Debug, Clone)]
pub struct RegimePath<'a> {
    model: &'a EconomicModel,
    start: Cow<'a, StartLaw>,
    seed: u64,
    rng: StdRng,
    horizon_months: u32,
    month: u32,
    market_state: usize,
    inflation_state: usize,
}

impl<'a> RegimePath<'a> {
    fn new(
        model: &'a EconomicModel,
        start: Cow<'a, StartLaw>,
        seed: u64,
        horizon_months: u32,
    ) -> Self {
        let mut path = Self {
            model,
            start,
            seed,
            rng: StdRng::seed_from_u64(seed),
            horizon_months,
            month: 0,
            market_state: 0,
            inflation_state: 0,
        };
        path.restart();
        path
    }

    pub fn restart(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.month = 0;
        self.market_state = resolve_initial(
            self.model.initial_market,
            self.start.market.as_deref(),
            &mut self.rng,
        );
        self.inflation_state = resolve_initial(
            self.model.initial_inflation,
            self.start.inflation_for(self.market_state),
            &mut self.rng,
        );
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

fn resolve_initial<R: Rng + ?Sized>(
    initial: InitialRegime,
    stationary: Option<&[f64]>,
    rng: &mut R,
) -> usize {
    match (initial, stationary) {
        (InitialRegime::Fixed(idx), _) => idx,
        (InitialRegime::Stationary, None) => 0,
        (InitialRegime::Stationary, Some(dist)) => {
            let u: f64 = rng.gen_range(0.0..1.0);
            let mut cumulative = 0.0;
            for (idx, p) in dist.iter().enumerate() {
                cumulative += p;
                if u < cumulative {
                    return idx;
                }
            }
            dist.len().saturating_sub(1)
        }
    }
}

impl Iterator for RegimePath<'_> {
    type Item = MonthlyDraw;

    fn next(&mut self) -> Option<MonthlyDraw> {
        if self.month >= self.horizon_months {
            return None;
        }

        if self.month > 0 {
            self.market_state = self
                .model
                .market_transitions
                .next_state(self.market_state, &mut self.rng);
            self.inflation_state = self
                .model
                .inflation_matrix(self.market_state)
                .next_state(self.inflation_state, &mut self.rng);
        }

        let market = &self.model.market[self.market_state];
        let inflation = &self.model.inflation[self.inflation_state];
        let market_shock: f64 = self.rng.sample(StandardNormal);
        let inflation_shock: f64 = self.rng.sample(StandardNormal);

        let draw = MonthlyDraw {
            month: self.month,
            market_regime: self.market_state,
            inflation_regime: self.inflation_state,
            market_return: log_normal_return(market.location, market.scale, market_shock),
            inflation: (inflation.location + inflation.scale * inflation_shock)
                .max(INFLATION_FLOOR),
            market_location: market.location,
            market_scale: market.scale,
            market_shock,
        };
        self.month += 1;
        Some(draw)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.horizon_months.saturating_sub(self.month) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RegimePath<'_> {}

pub fn derive_seed(base_seed: u64, trial_id: u64) -> u64 {
    splitmix64(base_seed ^ splitmix64(trial_id))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
