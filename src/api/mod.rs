use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::core::{
    CashPolicy, ContributionSchedule, EtfInstrument, GlidepathConfig, PensionFundConfig,
    PresetInfo, PublicPension, ScenarioConfig, SimulationError, SimulationResult, TaxConfig,
    WithdrawalPolicy, load_preset, parse_model, preset_catalog, run_simulation,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliWithdrawalStrategy {
    Fixed,
    PercentOfBalance,
    Guardrail,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliPreset {
    Volatile,
    #[value(name = "stagflation-1970s")]
    Stagflation1970s,
    SteadyGrowth,
    ProlongedCrisis,
}

impl CliPreset {
    fn id(self) -> &'static str {
        match self {
            CliPreset::Volatile => "volatile",
            CliPreset::Stagflation1970s => "stagflation-1970s",
            CliPreset::SteadyGrowth => "steady-growth",
            CliPreset::ProlongedCrisis => "prolonged-crisis",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliCashPolicy {
    Capped,
    Overdraft,
}

impl From<CliCashPolicy> for CashPolicy {
    fn from(value: CliCashPolicy) -> Self {
        match value {
            CliCashPolicy::Capped => CashPolicy::Capped,
            CliCashPolicy::Overdraft => CashPolicy::AllowOverdraft,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiWithdrawalStrategy {
    #[serde(alias = "fixed-real", alias = "fixedReal")]
    Fixed,
    #[serde(alias = "percentOfBalance", alias = "percent_of_balance", alias = "percent")]
    PercentOfBalance,
    #[serde(alias = "guardrails")]
    Guardrail,
}

impl From<ApiWithdrawalStrategy> for CliWithdrawalStrategy {
    fn from(value: ApiWithdrawalStrategy) -> Self {
        match value {
            ApiWithdrawalStrategy::Fixed => CliWithdrawalStrategy::Fixed,
            ApiWithdrawalStrategy::PercentOfBalance => CliWithdrawalStrategy::PercentOfBalance,
            ApiWithdrawalStrategy::Guardrail => CliWithdrawalStrategy::Guardrail,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiPreset {
    Volatile,
    #[serde(
        rename = "stagflation-1970s",
        alias = "stagflation",
        alias = "stagflation1970s"
    )]
    Stagflation1970s,
    #[serde(alias = "steadyGrowth", alias = "steady_growth")]
    SteadyGrowth,
    #[serde(alias = "prolongedCrisis", alias = "prolonged_crisis")]
    ProlongedCrisis,
}

impl From<ApiPreset> for CliPreset {
    fn from(value: ApiPreset) -> Self {
        match value {
            ApiPreset::Volatile => CliPreset::Volatile,
            ApiPreset::Stagflation1970s => CliPreset::Stagflation1970s,
            ApiPreset::SteadyGrowth => CliPreset::SteadyGrowth,
            ApiPreset::ProlongedCrisis => CliPreset::ProlongedCrisis,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiCashPolicy {
    Capped,
    #[serde(alias = "allow-overdraft", alias = "allowOverdraft")]
    Overdraft,
}

impl From<ApiCashPolicy> for CliCashPolicy {
    fn from(value: ApiCashPolicy) -> Self {
        match value {
            ApiCashPolicy::Capped => CliCashPolicy::Capped,
            ApiCashPolicy::Overdraft => CliCashPolicy::Overdraft,
        }
    }
}

/// One ETF sleeve; every figure except the name is in percent.
#[derive(Clone, Debug, PartialEq)]
struct EtfArg {
    name: String,
    weight: f64,
    expected_return: f64,
    volatility: f64,
    ter: f64,
}

fn parse_etf_arg(raw: &str) -> Result<EtfArg, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 5 {
        return Err(format!(
            "expected name:weight:return:volatility:ter, got '{raw}'"
        ));
    }
    let number = |idx: usize, label: &str| -> Result<f64, String> {
        parts[idx]
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid {label} '{}' in '{raw}': {e}", parts[idx]))
    };
    Ok(EtfArg {
        name: parts[0].trim().to_string(),
        weight: number(1, "weight")?,
        expected_return: number(2, "return")?,
        volatility: number(3, "volatility")?,
        ter: number(4, "ter")?,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ApiEtf {
    name: Option<String>,
    weight: Option<f64>,
    expected_return: Option<f64>,
    volatility: Option<f64>,
    ter: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    start_age: Option<u32>,
    retirement_age: Option<u32>,
    horizon_age: Option<u32>,
    simulations: Option<u32>,
    seed: Option<u64>,

    initial_cash: Option<f64>,
    #[serde(alias = "etfStart")]
    initial_etf: Option<f64>,
    #[serde(alias = "etfCostBasis")]
    initial_etf_cost_basis: Option<f64>,

    monthly_cash_saving: Option<f64>,
    monthly_etf_investment: Option<f64>,
    contribution_growth: Option<f64>,
    etfs: Option<Vec<ApiEtf>>,

    pension_start: Option<f64>,
    pension_contribution: Option<f64>,
    pension_return: Option<f64>,
    pension_volatility: Option<f64>,
    pension_ter: Option<f64>,
    pension_accrual_tax: Option<f64>,
    pension_payout_tax: Option<f64>,
    pension_payout_age: Option<u32>,
    pension_lump_sum_share: Option<f64>,
    pension_annuity_years: Option<u32>,

    withdrawal_policy: Option<ApiWithdrawalStrategy>,
    withdrawal_amount: Option<f64>,
    withdrawal_rate: Option<f64>,
    guardrail_upper: Option<f64>,
    guardrail_lower: Option<f64>,
    guardrail_adjustment: Option<f64>,

    glidepath: Option<bool>,
    glidepath_start_age: Option<f64>,
    glidepath_end_age: Option<f64>,
    glidepath_start_share: Option<f64>,
    glidepath_end_share: Option<f64>,
    glidepath_tolerance: Option<f64>,

    cgt_rate: Option<f64>,
    stamp_duty: Option<f64>,
    cash_stamp_duty: Option<f64>,
    cash_stamp_threshold: Option<f64>,
    broker_fee: Option<f64>,

    public_pension: Option<f64>,
    public_pension_age: Option<u32>,

    preset: Option<ApiPreset>,
    economic_model: Option<serde_json::Value>,
    cash_policy: Option<ApiCashPolicy>,
    trajectories: Option<bool>,
}

#[derive(Parser, Debug)]
#[command(
    name = "nestegg",
    about = "Regime-switching Monte Carlo projection of household savings, ETFs and pension fund"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run one scenario and print the summary as JSON
    Simulate(Box<ScenarioArgs>),
    /// List the bundled economic presets
    Presets,
}

#[derive(Args, Debug, Clone, PartialEq)]
struct ScenarioArgs {
    #[arg(long, default_value_t = 40)]
    start_age: u32,
    #[arg(long, default_value_t = 60)]
    retirement_age: u32,
    #[arg(long, default_value_t = 90)]
    horizon_age: u32,
    #[arg(long, default_value_t = 20_000.0)]
    initial_cash: f64,
    #[arg(long, default_value_t = 100_000.0)]
    initial_etf: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Cost basis of the initial ETF holdings; defaults to initial-etf"
    )]
    initial_etf_cost_basis: f64,
    #[arg(long, default_value_t = 300.0)]
    monthly_cash_saving: f64,
    #[arg(long, default_value_t = 700.0)]
    monthly_etf_investment: f64,
    #[arg(
        long,
        default_value_t = 2.0,
        help = "Yearly growth of both monthly contributions in percent"
    )]
    contribution_growth_rate: f64,
    #[arg(
        long = "etf",
        value_parser = parse_etf_arg,
        default_value = "world:100:7:15:0.2",
        help = "ETF sleeve as name:weight:return:volatility:ter, all in percent; repeatable"
    )]
    etfs: Vec<EtfArg>,

    #[arg(long, default_value_t = 10_000.0)]
    pension_start: f64,
    #[arg(long, default_value_t = 1_200.0, help = "Annual pension fund contribution")]
    pension_annual_contribution: f64,
    #[arg(long, default_value_t = 4.0)]
    pension_return: f64,
    #[arg(long, default_value_t = 6.0)]
    pension_volatility: f64,
    #[arg(long, default_value_t = 1.0)]
    pension_ter: f64,
    #[arg(long, default_value_t = 20.0)]
    pension_accrual_tax: f64,
    #[arg(long, default_value_t = 15.0)]
    pension_payout_tax: f64,
    #[arg(long, default_value_t = 67)]
    pension_payout_age: u32,
    #[arg(long, default_value_t = 50.0)]
    pension_lump_sum_share: f64,
    #[arg(long, default_value_t = 25)]
    pension_annuity_years: u32,

    #[arg(long, value_enum, default_value_t = CliWithdrawalStrategy::Fixed)]
    withdrawal_strategy: CliWithdrawalStrategy,
    #[arg(
        long,
        default_value_t = 30_000.0,
        help = "Fixed strategy: real annual amount; 0 solves for the sustainable amount"
    )]
    withdrawal_amount: f64,
    #[arg(long, default_value_t = 4.0, help = "Withdrawal rate in percent")]
    withdrawal_rate: f64,
    #[arg(long, default_value_t = 5.0)]
    guardrail_upper: f64,
    #[arg(long, default_value_t = 3.0)]
    guardrail_lower: f64,
    #[arg(long, default_value_t = 10.0)]
    guardrail_adjustment: f64,

    #[arg(long, default_value_t = false)]
    glidepath: bool,
    #[arg(long, default_value_t = 50.0)]
    glidepath_start_age: f64,
    #[arg(long, default_value_t = 70.0)]
    glidepath_end_age: f64,
    #[arg(long, default_value_t = 90.0)]
    glidepath_start_share: f64,
    #[arg(long, default_value_t = 50.0)]
    glidepath_end_share: f64,
    #[arg(long, default_value_t = 5.0)]
    glidepath_tolerance: f64,

    #[arg(long, default_value_t = 26.0)]
    capital_gains_tax_rate: f64,
    #[arg(long, default_value_t = 0.2, help = "Yearly securities stamp duty in percent")]
    stamp_duty: f64,
    #[arg(long, default_value_t = 34.2)]
    cash_stamp_duty: f64,
    #[arg(long, default_value_t = 5_000.0)]
    cash_stamp_threshold: f64,
    #[arg(long, default_value_t = 0.0)]
    broker_fee: f64,

    #[arg(long, default_value_t = 8_400.0, help = "Public pension per year in today's money")]
    public_pension_income: f64,
    #[arg(long, default_value_t = 67)]
    public_pension_age: u32,

    #[arg(long, value_enum, default_value_t = CliPreset::Volatile)]
    preset: CliPreset,
    #[arg(long, help = "Economic model JSON file; overrides --preset")]
    economic_model_file: Option<PathBuf>,
    #[arg(skip)]
    economic_model_json: Option<String>,
    #[arg(long, default_value_t = 1_000)]
    simulations: u32,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, value_enum, default_value_t = CliCashPolicy::Capped)]
    cash_policy: CliCashPolicy,
    #[arg(long, default_value_t = false, help = "Include per-trial trajectories in the output")]
    trajectories: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    model: String,
    withdrawal_policy: &'static str,
    #[serde(flatten)]
    result: SimulationResult,
}

#[derive(Debug, Serialize)]
struct PresetsResponse {
    presets: Vec<PresetInfo>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn percent(value: f64) -> f64 {
    value / 100.0
}

fn build_config(args: ScenarioArgs) -> Result<ScenarioConfig, String> {
    if args.retirement_age < args.start_age {
        return Err("--retirement-age must be >= --start-age".to_string());
    }

    if args.horizon_age <= args.start_age {
        return Err("--horizon-age must be > --start-age".to_string());
    }

    if args.retirement_age > args.horizon_age {
        return Err("--retirement-age must be <= --horizon-age".to_string());
    }

    if args.simulations == 0 {
        return Err("--simulations must be > 0".to_string());
    }

    if args.initial_cash < 0.0 {
        return Err("--initial-cash must be >= 0".to_string());
    }

    if args.initial_etf < 0.0 {
        return Err("--initial-etf must be >= 0".to_string());
    }

    if args.initial_etf_cost_basis < 0.0 || args.initial_etf_cost_basis > args.initial_etf {
        return Err("--initial-etf-cost-basis must be between 0 and initial-etf".to_string());
    }

    if args.monthly_cash_saving < 0.0 || args.monthly_etf_investment < 0.0 {
        return Err("--monthly-cash-saving and --monthly-etf-investment must be >= 0".to_string());
    }

    if args.contribution_growth_rate <= -100.0 {
        return Err("--contribution-growth-rate must be > -100".to_string());
    }

    if args.etfs.is_empty() {
        return Err("--etf must be given at least once".to_string());
    }

    let weight_total: f64 = args.etfs.iter().map(|etf| etf.weight).sum();
    if (weight_total - 100.0).abs() > 1e-4 {
        return Err(format!("--etf weights must sum to 100, got {weight_total}"));
    }

    for etf in &args.etfs {
        if etf.weight < 0.0 {
            return Err(format!("--etf {} weight must be >= 0", etf.name));
        }
        if etf.expected_return <= -100.0 {
            return Err(format!("--etf {} return must be > -100", etf.name));
        }
        if etf.volatility < 0.0 {
            return Err(format!("--etf {} volatility must be >= 0", etf.name));
        }
        if !(0.0..=100.0).contains(&etf.ter) {
            return Err(format!("--etf {} ter must be between 0 and 100", etf.name));
        }
    }

    for (flag, value) in [
        ("--capital-gains-tax-rate", args.capital_gains_tax_rate),
        ("--stamp-duty", args.stamp_duty),
        ("--pension-ter", args.pension_ter),
        ("--pension-accrual-tax", args.pension_accrual_tax),
        ("--pension-payout-tax", args.pension_payout_tax),
        ("--pension-lump-sum-share", args.pension_lump_sum_share),
        ("--withdrawal-rate", args.withdrawal_rate),
        ("--guardrail-upper", args.guardrail_upper),
        ("--guardrail-lower", args.guardrail_lower),
        ("--guardrail-adjustment", args.guardrail_adjustment),
        ("--glidepath-start-share", args.glidepath_start_share),
        ("--glidepath-end-share", args.glidepath_end_share),
        ("--glidepath-tolerance", args.glidepath_tolerance),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(format!("{flag} must be between 0 and 100"));
        }
    }

    if args.guardrail_lower > args.guardrail_upper {
        return Err("--guardrail-lower must be <= --guardrail-upper".to_string());
    }

    if args.glidepath && args.glidepath_end_age < args.glidepath_start_age {
        return Err("--glidepath-end-age must be >= --glidepath-start-age".to_string());
    }

    if args.withdrawal_amount < 0.0 {
        return Err("--withdrawal-amount must be >= 0".to_string());
    }

    if args.pension_start < 0.0 || args.pension_annual_contribution < 0.0 {
        return Err("--pension-start and --pension-annual-contribution must be >= 0".to_string());
    }

    if args.pension_annuity_years == 0 {
        return Err("--pension-annuity-years must be > 0".to_string());
    }

    if args.public_pension_income < 0.0 {
        return Err("--public-pension-income must be >= 0".to_string());
    }

    if args.cash_stamp_duty < 0.0 || args.cash_stamp_threshold < 0.0 || args.broker_fee < 0.0 {
        return Err("--cash-stamp-duty, --cash-stamp-threshold and --broker-fee must be >= 0"
            .to_string());
    }

    let economic_model = if let Some(json) = &args.economic_model_json {
        parse_model(json).map_err(|e| e.to_string())?
    } else if let Some(path) = &args.economic_model_file {
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("--economic-model-file {}: {e}", path.display()))?;
        parse_model(&json).map_err(|e| e.to_string())?
    } else {
        load_preset(args.preset.id()).map_err(|e| e.to_string())?
    };

    let initial_etf_cost_basis = if args.initial_etf_cost_basis > 0.0 {
        args.initial_etf_cost_basis
    } else {
        args.initial_etf
    };

    let pension_fund = if args.pension_start > 0.0 || args.pension_annual_contribution > 0.0 {
        Some(PensionFundConfig {
            initial_balance: args.pension_start,
            annual_contribution: args.pension_annual_contribution,
            expected_return: percent(args.pension_return),
            volatility: percent(args.pension_volatility),
            ter: percent(args.pension_ter),
            accrual_tax_rate: percent(args.pension_accrual_tax),
            payout_tax_rate: percent(args.pension_payout_tax),
            payout_age: args.pension_payout_age,
            lump_sum_share: percent(args.pension_lump_sum_share),
            annuity_years: args.pension_annuity_years,
        })
    } else {
        None
    };

    let withdrawal = match args.withdrawal_strategy {
        CliWithdrawalStrategy::Fixed => WithdrawalPolicy::Fixed {
            annual_amount: args.withdrawal_amount,
        },
        CliWithdrawalStrategy::PercentOfBalance => WithdrawalPolicy::PercentOfBalance {
            annual_rate: percent(args.withdrawal_rate),
        },
        CliWithdrawalStrategy::Guardrail => WithdrawalPolicy::Guardrail {
            initial_rate: percent(args.withdrawal_rate),
            upper_rate: percent(args.guardrail_upper),
            lower_rate: percent(args.guardrail_lower),
            adjustment: percent(args.guardrail_adjustment),
        },
    };

    let config = ScenarioConfig {
        start_age: args.start_age,
        horizon_months: (args.horizon_age - args.start_age) * 12,
        retirement_month: (args.retirement_age - args.start_age) * 12,
        initial_cash: args.initial_cash,
        initial_etf_value: args.initial_etf,
        initial_etf_cost_basis,
        contributions: ContributionSchedule {
            monthly_cash: args.monthly_cash_saving,
            monthly_etf: args.monthly_etf_investment,
            annual_growth: percent(args.contribution_growth_rate),
        },
        instruments: args
            .etfs
            .iter()
            .map(|etf| EtfInstrument {
                name: etf.name.clone(),
                weight: percent(etf.weight),
                expected_return: percent(etf.expected_return),
                volatility: percent(etf.volatility),
                ter: percent(etf.ter),
            })
            .collect(),
        pension_fund,
        withdrawal,
        glidepath: GlidepathConfig {
            enabled: args.glidepath,
            start_age: args.glidepath_start_age,
            end_age: args.glidepath_end_age,
            start_etf_share: percent(args.glidepath_start_share),
            end_etf_share: percent(args.glidepath_end_share),
            tolerance: percent(args.glidepath_tolerance),
        },
        tax: TaxConfig {
            capital_gain_rate: percent(args.capital_gains_tax_rate),
            securities_stamp_duty: percent(args.stamp_duty),
            cash_stamp_duty: args.cash_stamp_duty,
            cash_stamp_threshold: args.cash_stamp_threshold,
            monthly_broker_fee: args.broker_fee,
        },
        public_pension: PublicPension {
            annual_amount: args.public_pension_income,
            start_age: args.public_pension_age,
        },
        economic_model,
        simulations: args.simulations,
        seed: args.seed,
        cash_policy: args.cash_policy.into(),
        record_trajectories: args.trajectories,
    };

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

pub async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Serve { port } => run_http_server(port).await.map_err(|e| e.to_string()),
        Command::Simulate(args) => {
            let config = build_config(*args)?;
            let response = run_blocking(config).await?;
            let json = serde_json::to_string_pretty(&response).map_err(|e| e.to_string())?;
            println!("{json}");
            Ok(())
        }
        Command::Presets => {
            let presets = preset_catalog().map_err(|e| e.to_string())?;
            let json = serde_json::to_string_pretty(&PresetsResponse { presets })
                .map_err(|e| e.to_string())?;
            println!("{json}");
            Ok(())
        }
    }
}

async fn run_blocking(config: ScenarioConfig) -> Result<SimulateResponse, String> {
    let model = config.economic_model.name.clone();
    let withdrawal_policy = config.withdrawal.label();
    let result = tokio::task::spawn_blocking(move || run_simulation(&config))
        .await
        .map_err(|e| format!("simulation task failed: {e}"))?
        .map_err(|e: SimulationError| e.to_string())?;
    Ok(SimulateResponse {
        model,
        withdrawal_policy,
        result,
    })
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router();

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "nestegg HTTP API listening");

    axum::serve(listener, app).await
}

fn router() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/presets", get(presets_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .fallback(not_found_handler)
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, HealthResponse { status: "ok" })
}

async fn presets_handler() -> Response {
    match preset_catalog() {
        Ok(presets) => json_response(StatusCode::OK, PresetsResponse { presets }),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let config = match config_from_payload(payload) {
        Ok(config) => config,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    match run_blocking(config).await {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(msg) => {
            error!(error = %msg, "simulation request failed");
            error_response(StatusCode::UNPROCESSABLE_ENTITY, &msg)
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn config_from_json(json: &str) -> Result<ScenarioConfig, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    config_from_payload(payload)
}

fn config_from_payload(payload: SimulatePayload) -> Result<ScenarioConfig, String> {
    let mut args = default_args_for_api();

    if let Some(v) = payload.start_age {
        args.start_age = v;
    }
    if let Some(v) = payload.retirement_age {
        args.retirement_age = v;
    }
    if let Some(v) = payload.horizon_age {
        args.horizon_age = v;
    }
    if let Some(v) = payload.simulations {
        args.simulations = v;
    }
    if let Some(v) = payload.seed {
        args.seed = Some(v);
    }

    if let Some(v) = payload.initial_cash {
        args.initial_cash = v;
    }
    if let Some(v) = payload.initial_etf {
        args.initial_etf = v;
    }
    if let Some(v) = payload.initial_etf_cost_basis {
        args.initial_etf_cost_basis = v;
    }
    if let Some(v) = payload.monthly_cash_saving {
        args.monthly_cash_saving = v;
    }
    if let Some(v) = payload.monthly_etf_investment {
        args.monthly_etf_investment = v;
    }
    if let Some(v) = payload.contribution_growth {
        args.contribution_growth_rate = v;
    }
    if let Some(etfs) = payload.etfs {
        args.etfs = etfs
            .into_iter()
            .enumerate()
            .map(|(idx, etf)| {
                Ok(EtfArg {
                    name: etf.name.unwrap_or_else(|| format!("etf-{}", idx + 1)),
                    weight: etf.weight.ok_or("etfs[].weight is required")?,
                    expected_return: etf
                        .expected_return
                        .ok_or("etfs[].expectedReturn is required")?,
                    volatility: etf.volatility.ok_or("etfs[].volatility is required")?,
                    ter: etf.ter.unwrap_or(0.0),
                })
            })
            .collect::<Result<Vec<_>, &str>>()?;
    }

    if let Some(v) = payload.pension_start {
        args.pension_start = v;
    }
    if let Some(v) = payload.pension_contribution {
        args.pension_annual_contribution = v;
    }
    if let Some(v) = payload.pension_return {
        args.pension_return = v;
    }
    if let Some(v) = payload.pension_volatility {
        args.pension_volatility = v;
    }
    if let Some(v) = payload.pension_ter {
        args.pension_ter = v;
    }
    if let Some(v) = payload.pension_accrual_tax {
        args.pension_accrual_tax = v;
    }
    if let Some(v) = payload.pension_payout_tax {
        args.pension_payout_tax = v;
    }
    if let Some(v) = payload.pension_payout_age {
        args.pension_payout_age = v;
    }
    if let Some(v) = payload.pension_lump_sum_share {
        args.pension_lump_sum_share = v;
    }
    if let Some(v) = payload.pension_annuity_years {
        args.pension_annuity_years = v;
    }

    if let Some(v) = payload.withdrawal_policy {
        args.withdrawal_strategy = v.into();
    }
    if let Some(v) = payload.withdrawal_amount {
        args.withdrawal_amount = v;
    }
    if let Some(v) = payload.withdrawal_rate {
        args.withdrawal_rate = v;
    }
    if let Some(v) = payload.guardrail_upper {
        args.guardrail_upper = v;
    }
    if let Some(v) = payload.guardrail_lower {
        args.guardrail_lower = v;
    }
    if let Some(v) = payload.guardrail_adjustment {
        args.guardrail_adjustment = v;
    }

    if let Some(v) = payload.glidepath {
        args.glidepath = v;
    }
    if let Some(v) = payload.glidepath_start_age {
        args.glidepath_start_age = v;
    }
    if let Some(v) = payload.glidepath_end_age {
        args.glidepath_end_age = v;
    }
    if let Some(v) = payload.glidepath_start_share {
        args.glidepath_start_share = v;
    }
    if let Some(v) = payload.glidepath_end_share {
        args.glidepath_end_share = v;
    }
    if let Some(v) = payload.glidepath_tolerance {
        args.glidepath_tolerance = v;
    }

    if let Some(v) = payload.cgt_rate {
        args.capital_gains_tax_rate = v;
    }
    if let Some(v) = payload.stamp_duty {
        args.stamp_duty = v;
    }
    if let Some(v) = payload.cash_stamp_duty {
        args.cash_stamp_duty = v;
    }
    if let Some(v) = payload.cash_stamp_threshold {
        args.cash_stamp_threshold = v;
    }
    if let Some(v) = payload.broker_fee {
        args.broker_fee = v;
    }

    if let Some(v) = payload.public_pension {
        args.public_pension_income = v;
    }
    if let Some(v) = payload.public_pension_age {
        args.public_pension_age = v;
    }

    if let Some(v) = payload.preset {
        args.preset = v.into();
    }
    if let Some(model) = payload.economic_model {
        args.economic_model_json = Some(model.to_string());
    }
    if let Some(v) = payload.cash_policy {
        args.cash_policy = v.into();
    }
    if let Some(v) = payload.trajectories {
        args.trajectories = v;
    }

    build_config(args)
}

fn default_args_for_api() -> ScenarioArgs {
    ScenarioArgs {
        start_age: 40,
        retirement_age: 60,
        horizon_age: 90,
        initial_cash: 20_000.0,
        initial_etf: 100_000.0,
        initial_etf_cost_basis: 0.0,
        monthly_cash_saving: 300.0,
        monthly_etf_investment: 700.0,
        contribution_growth_rate: 2.0,
        etfs: vec![EtfArg {
            name: "world".to_string(),
            weight: 100.0,
            expected_return: 7.0,
            volatility: 15.0,
            ter: 0.2,
        }],
        pension_start: 10_000.0,
        pension_annual_contribution: 1_200.0,
        pension_return: 4.0,
        pension_volatility: 6.0,
        pension_ter: 1.0,
        pension_accrual_tax: 20.0,
        pension_payout_tax: 15.0,
        pension_payout_age: 67,
        pension_lump_sum_share: 50.0,
        pension_annuity_years: 25,
        withdrawal_strategy: CliWithdrawalStrategy::Fixed,
        withdrawal_amount: 30_000.0,
        withdrawal_rate: 4.0,
        guardrail_upper: 5.0,
        guardrail_lower: 3.0,
        guardrail_adjustment: 10.0,
        glidepath: false,
        glidepath_start_age: 50.0,
        glidepath_end_age: 70.0,
        glidepath_start_share: 90.0,
        glidepath_end_share: 50.0,
        glidepath_tolerance: 5.0,
        capital_gains_tax_rate: 26.0,
        stamp_duty: 0.2,
        cash_stamp_duty: 34.2,
        cash_stamp_threshold: 5_000.0,
        broker_fee: 0.0,
        public_pension_income: 8_400.0,
        public_pension_age: 67,
        preset: CliPreset::Volatile,
        economic_model_file: None,
        economic_model_json: None,
        simulations: 1_000,
        seed: Some(42),
        cash_policy: CliCashPolicy::Capped,
        trajectories: false,
    }
}
