pub const MONTHS_PER_YEAR: u32 = 12;

const QUANTITY_EPS: f64 = 1e-9;

pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

pub fn monthly_rate(annual_rate: f64) -> f64 {
    annual_rate / MONTHS_PER_YEAR as f64
}

pub fn capital_gain_tax(realized_gain: f64, rate: f64) -> f64 {
    if realized_gain <= 0.0 {
        return 0.0;
    }
    realized_gain * rate.max(0.0)
}

pub fn proportional_cost_basis(total_cost: f64, quantity_held: f64, quantity_sold: f64) -> f64 {
    if quantity_held <= 0.0 || quantity_sold <= 0.0 {
        return 0.0;
    }
    let share = (quantity_sold / quantity_held).min(1.0);
    (total_cost * share).max(0.0)
}

/// Tax on the pension fund's yearly accrual: growth net of the year's
/// contributions and with payouts added back. Negative years are not taxed.
pub fn pension_accrual_tax(
    balance_end: f64,
    balance_start: f64,
    contributions: f64,
    payouts: f64,
    rate: f64,
) -> f64 {
    let accrual = balance_end - balance_start - contributions + payouts;
    capital_gain_tax(accrual, rate)
}

pub fn securities_stamp_duty(market_value: f64, annual_rate: f64) -> f64 {
    market_value.max(0.0) * annual_rate.max(0.0)
}

pub fn cash_stamp_duty(cash_balance: f64, flat_fee: f64, threshold: f64) -> f64 {
    if cash_balance > threshold {
        flat_fee.max(0.0)
    } else {
        0.0
    }
}

pub fn payout_tax(gross_payout: f64, rate: f64) -> f64 {
    gross_payout.max(0.0) * rate.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaleOutcome {
    pub quantity: f64,
    pub gross: f64,
    pub cost_basis: f64,
    pub gain: f64,
    pub tax: f64,
    pub net: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub quantity: f64,
    pub total_cost: f64,
    pub price: f64,
}

impl Position {
    pub fn empty(price: f64) -> Self {
        Self {
            quantity: 0.0,
            total_cost: 0.0,
            price,
        }
    }

    pub fn with_holding(market_value: f64, cost_basis: f64, price: f64) -> Self {
        assert!(price > 0.0, "instrument price must be positive, got {price}");
        Self {
            quantity: market_value.max(0.0) / price,
            total_cost: cost_basis.max(0.0),
            price,
        }
    }

    pub fn market_value(&self) -> f64 {
        self.quantity * self.price
    }

    pub fn unrealized_gain(&self) -> f64 {
        self.market_value() - self.total_cost
    }

    pub fn average_cost(&self) -> f64 {
        if self.quantity <= QUANTITY_EPS {
            0.0
        } else {
            self.total_cost / self.quantity
        }
    }

    pub fn buy(&mut self, amount: f64) -> f64 {
        if amount <= 0.0 || self.price <= 0.0 {
            return 0.0;
        }
        let units = amount / self.price;
        self.quantity += units;
        self.total_cost += amount;
        units
    }

    pub fn sell(&mut self, quantity: f64, cgt_rate: f64) -> SaleOutcome {
        assert!(
            quantity >= -QUANTITY_EPS && quantity <= self.quantity + QUANTITY_EPS,
            "cannot sell {quantity} units from a position of {}",
            self.quantity
        );
        let quantity = quantity.clamp(0.0, self.quantity);
        if quantity <= 0.0 {
            return SaleOutcome {
                quantity: 0.0,
                gross: 0.0,
                cost_basis: 0.0,
                gain: 0.0,
                tax: 0.0,
                net: 0.0,
            };
        }

        let gross = round_cents(quantity * self.price);
        let cost_basis = proportional_cost_basis(self.total_cost, self.quantity, quantity);
        let gain = gross - cost_basis;
        let tax = round_cents(capital_gain_tax(gain, cgt_rate));

        if self.quantity - quantity <= QUANTITY_EPS {
            self.quantity = 0.0;
            self.total_cost = 0.0;
        } else {
            self.quantity -= quantity;
            self.total_cost = (self.total_cost - cost_basis).max(0.0);
        }
        assert!(
            self.total_cost >= 0.0,
            "negative cost basis after sale: {}",
            self.total_cost
        );

        SaleOutcome {
            quantity,
            gross,
            cost_basis,
            gain,
            tax,
            net: (gross - tax).max(0.0),
        }
    }

    pub fn apply_return(&mut self, monthly_return: f64) {
        self.price = (self.price * (1.0 + monthly_return)).max(0.0);
    }

    pub fn charge_fraction(&mut self, fraction: f64) -> f64 {
        let fraction = fraction.clamp(0.0, 1.0);
        let charged = self.market_value() * fraction;
        self.price *= 1.0 - fraction;
        charged
    }
}
