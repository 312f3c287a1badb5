use super::error::ConfigError;
use super::tax::MONTHS_PER_YEAR;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WithdrawalPolicy {
    /// Real annual amount in retirement-start money, indexed by the simulated price path.
    Fixed { annual_amount: f64 },
    PercentOfBalance { annual_rate: f64 },
    Guardrail {
        initial_rate: f64,
        upper_rate: f64,
        lower_rate: f64,
        adjustment: f64,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct WithdrawalContext {
    pub months_since_retirement: u32,
    pub liquid_wealth: f64,
    pub price_index: f64,
    pub retirement_price_index: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuardrailAction {
    Hold,
    Cut,
    Raise,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WithdrawalMemo {
    monthly_amount: f64,
    annual_amount: Option<f64>,
    last_action: GuardrailAction,
}

impl Default for WithdrawalMemo {
    fn default() -> Self {
        Self {
            monthly_amount: 0.0,
            annual_amount: None,
            last_action: GuardrailAction::Hold,
        }
    }
}

impl WithdrawalMemo {
    pub fn last_action(&self) -> GuardrailAction {
        self.last_action
    }

    pub fn annual_amount(&self) -> Option<f64> {
        self.annual_amount
    }
}

impl WithdrawalPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            WithdrawalPolicy::Fixed { annual_amount } => {
                check_non_negative("withdrawal amount", annual_amount)
            }
            WithdrawalPolicy::PercentOfBalance { annual_rate } => {
                check_rate("withdrawal rate", annual_rate)
            }
            WithdrawalPolicy::Guardrail {
                initial_rate,
                upper_rate,
                lower_rate,
                adjustment,
            } => {
                check_rate("guardrail initial rate", initial_rate)?;
                check_rate("guardrail upper rate", upper_rate)?;
                check_rate("guardrail lower rate", lower_rate)?;
                check_rate("guardrail adjustment", adjustment)?;
                if lower_rate > upper_rate {
                    return Err(ConfigError::Inconsistent {
                        field: "guardrail",
                        reason: format!(
                            "lower rate {lower_rate} exceeds upper rate {upper_rate}"
                        ),
                    });
                }
                Ok(())
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WithdrawalPolicy::Fixed { .. } => "fixed",
            WithdrawalPolicy::PercentOfBalance { .. } => "percent-of-balance",
            WithdrawalPolicy::Guardrail { .. } => "guardrail",
        }
    }

    pub fn monthly_withdrawal(&self, ctx: &WithdrawalContext, memo: &mut WithdrawalMemo) -> f64 {
        let months = MONTHS_PER_YEAR as f64;
        match *self {
            WithdrawalPolicy::Fixed { annual_amount } => {
                let indexation = if ctx.retirement_price_index > 0.0 {
                    ctx.price_index / ctx.retirement_price_index
                } else {
                    1.0
                };
                annual_amount / months * indexation
            }
            WithdrawalPolicy::PercentOfBalance { annual_rate } => {
                if is_anniversary(ctx) || memo.annual_amount.is_none() {
                    let annual = annual_rate * ctx.liquid_wealth.max(0.0);
                    reset_year(memo, annual, GuardrailAction::Hold);
                }
                memo.monthly_amount
            }
            WithdrawalPolicy::Guardrail {
                initial_rate,
                upper_rate,
                lower_rate,
                adjustment,
            } => {
                let wealth = ctx.liquid_wealth.max(0.0);
                if is_anniversary(ctx) || memo.annual_amount.is_none() {
                    reset_year(memo, initial_rate * wealth, GuardrailAction::Hold);
                }
                // one adjustment per year at most
                if memo.last_action == GuardrailAction::Hold {
                    let current = memo.annual_amount.unwrap_or(0.0);
                    let (annual, action) =
                        apply_guardrail(current, wealth, upper_rate, lower_rate, adjustment);
                    if action != GuardrailAction::Hold {
                        reset_year(memo, annual, action);
                    }
                }
                memo.monthly_amount
            }
        }
    }
}

fn apply_guardrail(
    proposal: f64,
    wealth: f64,
    upper_rate: f64,
    lower_rate: f64,
    adjustment: f64,
) -> (f64, GuardrailAction) {
    if wealth <= 0.0 || proposal <= 0.0 {
        return (proposal.max(0.0), GuardrailAction::Hold);
    }
    let step = adjustment.clamp(0.0, 1.0);
    let effective_rate = proposal / wealth;
    if effective_rate > upper_rate {
        (proposal * (1.0 - step), GuardrailAction::Cut)
    } else if effective_rate < lower_rate {
        (proposal * (1.0 + step), GuardrailAction::Raise)
    } else {
        (proposal, GuardrailAction::Hold)
    }
}

fn reset_year(memo: &mut WithdrawalMemo, annual: f64, action: GuardrailAction) {
    memo.annual_amount = Some(annual);
    memo.monthly_amount = annual / MONTHS_PER_YEAR as f64;
    memo.last_action = action;
}

fn is_anniversary(ctx: &WithdrawalContext) -> bool {
    ctx.months_since_retirement % MONTHS_PER_YEAR == 0
}

fn check_rate(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutOfRange {
            field,
            expected: "between 0 and 1",
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
