use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::regime::{
    EconomicModel, InflationRegime, InflationTransitions, InitialRegime, MarketRegime,
    TransitionMatrix,
};

const PRESETS_JSON: &str = include_str!("presets.json");

#[derive(Debug, Clone, Deserialize)]
struct PresetFile {
    presets: Vec<ModelSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub market: FamilySpec,
    pub inflation: FamilySpec,
    /// market regime -> inflation regime -> next inflation regime -> probability
    #[serde(default)]
    pub coupled_transitions: Option<BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilySpec {
    #[serde(default)]
    pub initial: Option<String>,
    pub regimes: Vec<RegimeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegimeSpec {
    pub name: String,
    pub mean: f64,
    pub volatility: f64,
    pub transitions: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub market_regimes: Vec<String>,
    pub inflation_regimes: Vec<String>,
}

fn bundled() -> Result<Vec<ModelSpec>, ConfigError> {
    let file: PresetFile =
        serde_json::from_str(PRESETS_JSON).map_err(|e| ConfigError::ModelJson(e.to_string()))?;
    Ok(file.presets)
}

pub fn preset_ids() -> Result<Vec<String>, ConfigError> {
    Ok(bundled()?.into_iter().filter_map(|spec| spec.id).collect())
}

pub fn preset_catalog() -> Result<Vec<PresetInfo>, ConfigError> {
    Ok(bundled()?
        .into_iter()
        .map(|spec| {
            let id = spec.id.clone().unwrap_or_default();
            PresetInfo {
                name: spec.name.clone().unwrap_or_else(|| id.clone()),
                description: spec.description.clone().unwrap_or_default(),
                market_regimes: spec.market.regimes.iter().map(|r| r.name.clone()).collect(),
                inflation_regimes: spec
                    .inflation
                    .regimes
                    .iter()
                    .map(|r| r.name.clone())
                    .collect(),
                id,
            }
        })
        .collect())
}

pub fn load_preset(id: &str) -> Result<EconomicModel, ConfigError> {
    bundled()?
        .into_iter()
        .find(|spec| spec.id.as_deref() == Some(id))
        .ok_or_else(|| ConfigError::UnknownPreset(id.to_string()))?
        .into_model()
}

pub fn parse_model(json: &str) -> Result<EconomicModel, ConfigError> {
    let spec: ModelSpec =
        serde_json::from_str(json).map_err(|e| ConfigError::ModelJson(e.to_string()))?;
    spec.into_model()
}

impl ModelSpec {
    pub fn into_model(self) -> Result<EconomicModel, ConfigError> {
        let market_names: Vec<&str> = self.market.regimes.iter().map(|r| r.name.as_str()).collect();
        let inflation_names: Vec<&str> = self
            .inflation
            .regimes
            .iter()
            .map(|r| r.name.as_str())
            .collect();

        let market = self
            .market
            .regimes
            .iter()
            .map(|r| MarketRegime::from_annual(r.name.clone(), r.mean, r.volatility))
            .collect::<Result<Vec<_>, _>>()?;
        let inflation = self
            .inflation
            .regimes
            .iter()
            .map(|r| InflationRegime::from_annual(r.name.clone(), r.mean, r.volatility))
            .collect::<Result<Vec<_>, _>>()?;

        let market_transitions = TransitionMatrix::new(
            "market",
            self.market
                .regimes
                .iter()
                .map(|r| build_row("market", &r.name, &r.transitions, &market_names))
                .collect::<Result<Vec<_>, _>>()?,
        )?;
        let own_inflation_rows = self
            .inflation
            .regimes
            .iter()
            .map(|r| build_row("inflation", &r.name, &r.transitions, &inflation_names))
            .collect::<Result<Vec<_>, _>>()?;

        let inflation_transitions = match &self.coupled_transitions {
            None => InflationTransitions::Independent(TransitionMatrix::new(
                "inflation",
                own_inflation_rows,
            )?),
            Some(coupling) => {
                for market_name in coupling.keys() {
                    if !market_names.contains(&market_name.as_str()) {
                        return Err(ConfigError::UnknownRegime {
                            family: "market",
                            from: "coupling".to_string(),
                            to: market_name.clone(),
                        });
                    }
                }
                let mut matrices = Vec::with_capacity(market_names.len());
                for market_name in &market_names {
                    let rows = match coupling.get(*market_name) {
                        None => own_inflation_rows.clone(),
                        Some(overrides) => inflation_names
                            .iter()
                            .zip(&own_inflation_rows)
                            .map(|(name, own)| match overrides.get(*name) {
                                Some(row) => build_row("inflation", name, row, &inflation_names),
                                None => Ok(own.clone()),
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                    };
                    matrices.push(TransitionMatrix::new("inflation", rows)?);
                }
                InflationTransitions::CoupledToMarket(matrices)
            }
        };

        let model = EconomicModel {
            name: self
                .name
                .clone()
                .or_else(|| self.id.clone())
                .unwrap_or_else(|| "custom".to_string()),
            market,
            market_transitions,
            initial_market: resolve_initial("market", self.market.initial.as_deref(), &market_names)?,
            inflation,
            inflation_transitions,
            initial_inflation: resolve_initial(
                "inflation",
                self.inflation.initial.as_deref(),
                &inflation_names,
            )?,
        };
        model.validate()?;
        Ok(model)
    }
}

fn build_row(
    family: &'static str,
    from: &str,
    transitions: &BTreeMap<String, f64>,
    names: &[&str],
) -> Result<Vec<f64>, ConfigError> {
    let mut row = vec![0.0; names.len()];
    for (to, probability) in transitions {
        let idx = names
            .iter()
            .position(|name| name == to)
            .ok_or_else(|| ConfigError::UnknownRegime {
                family,
                from: from.to_string(),
                to: to.clone(),
            })?;
        row[idx] = *probability;
    }
    Ok(row)
}

fn resolve_initial(
    family: &'static str,
    initial: Option<&str>,
    names: &[&str],
) -> Result<InitialRegime, ConfigError> {
    match initial {
        None => Ok(InitialRegime::Stationary),
        Some(name) => names
            .iter()
            .position(|candidate| *candidate == name)
            .map(InitialRegime::Fixed)
            .ok_or_else(|| ConfigError::UnknownRegime {
                family,
                from: "initial".to_string(),
                to: name.to_string(),
            }),
    }
}
