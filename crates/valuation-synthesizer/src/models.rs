use analysis_core::{ComponentValues, NormalizedFinancialData, ValuationModel, ValuationModelKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const PROJECTION_YEARS: i32 = 5;
const DEFAULT_GROWTH: f64 = 0.03;
const MIN_GROWTH: f64 = -0.05;
const MAX_GROWTH: f64 = 0.25;

/// Market assumptions shared by the reference models
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelAssumptions {
    pub discount_rate: f64,
    pub terminal_growth: f64,
    pub tax_rate: f64,
}

impl Default for ModelAssumptions {
    fn default() -> Self {
        Self {
            discount_rate: 0.10,
            terminal_growth: 0.025,
            tax_rate: 0.21,
        }
    }
}

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x > 0.0)
}

/// Net cash per share; absent balance sheet items count as zero.
fn net_cash_per_share(data: &NormalizedFinancialData, shares: f64) -> f64 {
    let cash = data.cash_and_equivalents.unwrap_or(0.0);
    let debt = data.total_debt.unwrap_or(0.0);
    (cash - debt) / shares
}

/// Five-year free cash flow projection with a Gordon terminal value.
pub struct DiscountedCashFlow {
    assumptions: ModelAssumptions,
}

impl DiscountedCashFlow {
    pub fn new(assumptions: ModelAssumptions) -> Self {
        Self { assumptions }
    }
}

impl ValuationModel for DiscountedCashFlow {
    fn kind(&self) -> ValuationModelKind {
        ValuationModelKind::Dcf
    }

    fn compute(&self, data: &NormalizedFinancialData) -> Option<f64> {
        let shares = positive(data.shares_outstanding)?;
        let fcf = data.free_cash_flow.or_else(|| {
            match (data.operating_cash_flow, data.capital_expenditure) {
                (Some(ocf), Some(capex)) => Some(ocf - capex.abs()),
                _ => None,
            }
        })?;

        let fcf_per_share = fcf / shares;
        if !(fcf_per_share > 0.0) {
            return None;
        }

        let growth = data
            .revenue_growth
            .filter(|g| g.is_finite())
            .map(|g| g.clamp(MIN_GROWTH, MAX_GROWTH))
            .unwrap_or(DEFAULT_GROWTH);
        let r = self.assumptions.discount_rate;
        let g = self.assumptions.terminal_growth;
        if r <= g {
            return None;
        }

        let projected: f64 = (1..=PROJECTION_YEARS)
            .map(|i| fcf_per_share * (1.0 + growth).powi(i) / (1.0 + r).powi(i))
            .sum();
        let terminal_value =
            fcf_per_share * (1.0 + growth).powi(PROJECTION_YEARS) * (1.0 + g) / (r - g);
        let terminal_pv = terminal_value / (1.0 + r).powi(PROJECTION_YEARS);

        let value = projected + terminal_pv + net_cash_per_share(data, shares);
        value.is_finite().then_some(value)
    }
}

/// Steady-state value of current after-tax operating earnings, no growth.
pub struct EarningsPowerValue {
    assumptions: ModelAssumptions,
}

impl EarningsPowerValue {
    pub fn new(assumptions: ModelAssumptions) -> Self {
        Self { assumptions }
    }
}

impl ValuationModel for EarningsPowerValue {
    fn kind(&self) -> ValuationModelKind {
        ValuationModelKind::EarningsPower
    }

    fn compute(&self, data: &NormalizedFinancialData) -> Option<f64> {
        let shares = positive(data.shares_outstanding)?;
        let operating_income = positive(data.operating_income)?;
        if !(self.assumptions.discount_rate > 0.0) {
            return None;
        }

        let nopat = operating_income * (1.0 - self.assumptions.tax_rate);
        let value =
            nopat / self.assumptions.discount_rate / shares + net_cash_per_share(data, shares);
        value.is_finite().then_some(value)
    }
}

/// Book equity per share, from reported equity or assets minus liabilities.
pub struct AssetBasedValue;

impl ValuationModel for AssetBasedValue {
    fn kind(&self) -> ValuationModelKind {
        ValuationModelKind::AssetBased
    }

    fn compute(&self, data: &NormalizedFinancialData) -> Option<f64> {
        let shares = positive(data.shares_outstanding)?;
        let equity = data.shareholders_equity.or_else(|| {
            match (data.total_assets, data.total_liabilities) {
                (Some(a), Some(l)) => Some(a - l),
                _ => None,
            }
        })?;
        let value = equity / shares;
        value.is_finite().then_some(value)
    }
}

/// The ordered set of models run for every ticker
#[derive(Clone)]
pub struct ModelSet {
    models: Vec<Arc<dyn ValuationModel>>,
}

impl ModelSet {
    pub fn new(models: Vec<Arc<dyn ValuationModel>>) -> Self {
        Self { models }
    }

    pub fn reference(assumptions: ModelAssumptions) -> Self {
        Self::new(vec![
            Arc::new(DiscountedCashFlow::new(assumptions)) as Arc<dyn ValuationModel>,
            Arc::new(EarningsPowerValue::new(assumptions)),
            Arc::new(AssetBasedValue),
        ])
    }

    pub fn compute_all(&self, data: &NormalizedFinancialData) -> ComponentValues {
        let mut values = ComponentValues::default();
        for model in &self.models {
            let value = model.compute(data).filter(|v| v.is_finite());
            if value.is_none() {
                tracing::debug!(
                    "{}: {} produced no value",
                    data.ticker,
                    model.kind().as_str()
                );
            }
            values.set(model.kind(), value);
        }
        values
    }
}
