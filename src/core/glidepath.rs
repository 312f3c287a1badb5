use super::error::ConfigError;
use super::tax::{Position, round_cents};

const MIN_ORDER: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlidepathConfig {
    pub enabled: bool,
    pub start_age: f64,
    pub end_age: f64,
    pub start_etf_share: f64,
    pub end_etf_share: f64,
    pub tolerance: f64,
}

impl Default for GlidepathConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_age: 50.0,
            end_age: 70.0,
            start_etf_share: 0.9,
            end_etf_share: 0.5,
            tolerance: 0.05,
        }
    }
}

impl GlidepathConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("glidepath start share", self.start_etf_share),
            ("glidepath end share", self.end_etf_share),
            ("glidepath tolerance", self.tolerance),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange {
                    field,
                    expected: "between 0 and 1",
                    value,
                });
            }
        }
        if self.end_age < self.start_age {
            return Err(ConfigError::Inconsistent {
                field: "glidepath",
                reason: format!(
                    "end age {} is before start age {}",
                    self.end_age, self.start_age
                ),
            });
        }
        Ok(())
    }

    pub fn target_etf_share(&self, age: f64) -> f64 {
        if age <= self.start_age {
            return self.start_etf_share;
        }
        if age >= self.end_age {
            return self.end_etf_share;
        }
        let span = self.end_age - self.start_age;
        let t = (age - self.start_age) / span;
        self.start_etf_share + (self.end_etf_share - self.start_etf_share) * t
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Order {
    Sell { instrument: usize, quantity: f64 },
    Buy { instrument: usize, amount: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RebalanceOutcome {
    pub sold_gross: f64,
    pub bought: f64,
    pub tax_paid: f64,
}

/// `None` when the ETF share is already within the tolerance band.
pub fn plan_rebalance(
    positions: &[Position],
    weights: &[f64],
    cash: f64,
    target_share: f64,
    tolerance: f64,
) -> Option<Vec<Order>> {
    let etf_value: f64 = positions.iter().map(Position::market_value).sum();
    let liquid = etf_value + cash.max(0.0);
    if liquid <= MIN_ORDER {
        return None;
    }

    let current_share = etf_value / liquid;
    if (current_share - target_share).abs() <= tolerance {
        return None;
    }

    let target_etf = liquid * target_share.clamp(0.0, 1.0);
    let mut sells = Vec::new();
    let mut buys = Vec::new();
    for (idx, (position, weight)) in positions.iter().zip(weights).enumerate() {
        let delta = target_etf * weight - position.market_value();
        if delta < -MIN_ORDER && position.price > 0.0 {
            let quantity = (-delta / position.price).min(position.quantity);
            sells.push(Order::Sell {
                instrument: idx,
                quantity,
            });
        } else if delta > MIN_ORDER {
            buys.push(Order::Buy {
                instrument: idx,
                amount: delta,
            });
        }
    }

    sells.extend(buys);
    if sells.is_empty() { None } else { Some(sells) }
}

pub fn execute_orders(
    orders: &[Order],
    positions: &mut [Position],
    cash: &mut f64,
    cgt_rate: f64,
) -> RebalanceOutcome {
    let mut outcome = RebalanceOutcome::default();

    for order in orders {
        if let Order::Sell {
            instrument,
            quantity,
        } = *order
        {
            let sale = positions[instrument].sell(quantity, cgt_rate);
            *cash = round_cents(*cash + sale.net);
            outcome.sold_gross += sale.gross;
            outcome.tax_paid += sale.tax;
        }
    }

    let requested: f64 = orders
        .iter()
        .map(|order| match order {
            Order::Buy { amount, .. } => *amount,
            Order::Sell { .. } => 0.0,
        })
        .sum();
    if requested <= 0.0 {
        return outcome;
    }

    let budget = cash.max(0.0);
    let scale = (budget / requested).min(1.0);
    for order in orders {
        if let Order::Buy { instrument, amount } = *order {
            let spend = round_cents(amount * scale).min(*cash);
            if spend < MIN_ORDER {
                continue;
            }
            positions[instrument].buy(spend);
            *cash = round_cents(*cash - spend);
            outcome.bought += spend;
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn glidepath() -> GlidepathConfig {
        GlidepathConfig {
            enabled: true,
            start_age: 50.0,
            end_age: 60.0,
            start_etf_share: 0.8,
            end_etf_share: 0.4,
            tolerance: 0.02,
        }
    }

    #[test]
    fn target_share_interpolates_and_clamps() {
        let g = glidepath();
        assert_approx(g.target_etf_share(40.0), 0.8);
        assert_approx(g.target_etf_share(55.0), 0.6);
        assert_approx(g.target_etf_share(75.0), 0.4);
    }

    #[test]
    fn within_tolerance_produces_no_orders() {
        let positions = [Position::with_holding(61_000.0, 61_000.0, 100.0)];
        assert!(plan_rebalance(&positions, &[1.0], 39_000.0, 0.6, 0.02).is_none());
    }

    #[test]
    fn derisking_sells_with_tax_and_moves_proceeds_to_cash() {
        let mut positions = [
            Position::with_holding(60_000.0, 30_000.0, 100.0),
            Position::with_holding(20_000.0, 20_000.0, 50.0),
        ];
        let mut cash = 20_000.0;
        let orders = plan_rebalance(&positions, &[0.75, 0.25], cash, 0.4, 0.02)
            .expect("80% vs 40% target must rebalance");
        assert!(
            orders
                .iter()
                .all(|order| matches!(order, Order::Sell { .. }))
        );

        let outcome = execute_orders(&orders, &mut positions, &mut cash, 0.26);
        assert_approx(positions[0].market_value(), 30_000.0);
        assert_approx(positions[1].market_value(), 10_000.0);
        // first sleeve sells half at 50% gain: 15k gain taxed at 26%
        assert_approx(outcome.tax_paid, 3_900.0);
        assert_approx(cash, 20_000.0 + 40_000.0 - 3_900.0);
    }

    #[test]
    fn buys_are_limited_by_cash() {
        let mut positions = [Position::with_holding(0.0, 0.0, 10.0)];
        let mut cash = 1_000.0;
        let orders = plan_rebalance(&positions, &[1.0], cash, 1.0, 0.0).expect("must buy");
        let outcome = execute_orders(&orders, &mut positions, &mut cash, 0.26);
        assert_approx(outcome.bought, 1_000.0);
        assert_approx(cash, 0.0);
        assert_approx(positions[0].total_cost, 1_000.0);
    }

    #[test]
    fn rebalance_is_deterministic() {
        let positions = [
            Position::with_holding(10_000.0, 9_000.0, 20.0),
            Position::with_holding(70_000.0, 50_000.0, 35.0),
        ];
        let a = plan_rebalance(&positions, &[0.5, 0.5], 5_000.0, 0.7, 0.01);
        let b = plan_rebalance(&positions, &[0.5, 0.5], 5_000.0, 0.7, 0.01);
        assert_eq!(a, b);
    }
}
