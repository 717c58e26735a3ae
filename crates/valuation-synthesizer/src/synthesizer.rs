use crate::presets::PresetTable;
use analysis_core::{
    normalize_ticker, AnalysisResult, AnalysisStatus, BusinessType, ComponentValues,
    QualityWarning, Recommendation, ValuationModelKind, WarningSeverity,
};
use chrono::{NaiveDate, Utc};

const STRONG_BUY_MARGIN: f64 = 0.30;
const BUY_MARGIN: f64 = 0.10;

/// Everything the synthesizer needs for one ticker
#[derive(Debug, Clone)]
pub struct ValuationInputs {
    pub ticker: String,
    pub exchange: Option<String>,
    pub analysis_date: NaiveDate,
    pub current_price: Option<f64>,
    pub components: ComponentValues,
    /// Warnings raised upstream while normalizing provider data
    pub input_notes: Vec<QualityWarning>,
    pub data_source: Option<String>,
}

/// Map margin of safety to a recommendation tier
pub fn recommend(margin_of_safety: Option<f64>) -> Recommendation {
    match margin_of_safety {
        None => Recommendation::Unknown,
        Some(m) if m >= STRONG_BUY_MARGIN => Recommendation::StrongBuy,
        Some(m) if m >= BUY_MARGIN => Recommendation::Buy,
        Some(m) if m >= 0.0 => Recommendation::Hold,
        Some(_) => Recommendation::Avoid,
    }
}

fn usable_price(price: Option<f64>) -> Option<f64> {
    price.filter(|p| p.is_finite() && *p > 0.0)
}

#[derive(Debug, Clone, Default)]
pub struct Synthesizer {
    presets: PresetTable,
}

impl Synthesizer {
    pub fn new(presets: PresetTable) -> Self {
        Self { presets }
    }

    pub fn presets(&self) -> &PresetTable {
        &self.presets
    }

    /// Combine the available model values into one fair value.
    ///
    /// Never fails: missing models and prices are reported as warnings, and a
    /// ticker with no model values comes back as a `Failed` result.
    pub fn synthesize(
        &self,
        inputs: ValuationInputs,
        business_type: BusinessType,
    ) -> AnalysisResult {
        let ticker = normalize_ticker(&inputs.ticker);
        let available = inputs.components.available();
        let mut warnings = inputs.input_notes;

        if available.is_empty() {
            warnings.push(QualityWarning::missing(
                "valuation_models",
                WarningSeverity::High,
                "No valuation model produced a value: dcf, earnings_power, asset_based",
            ));
            let mut result = AnalysisResult::failed(
                &ticker,
                inputs.exchange.as_deref(),
                inputs.analysis_date,
                "Insufficient financial data for any valuation model",
            );
            result.current_price = usable_price(inputs.current_price);
            result.component_values = inputs.components;
            result.quality_warnings = warnings;
            result.business_type = Some(business_type);
            result.data_source = inputs.data_source;
            return result;
        }

        for kind in ValuationModelKind::ALL {
            if !available.contains(&kind) {
                warnings.push(QualityWarning::missing(
                    kind.as_str(),
                    WarningSeverity::Medium,
                    format!("{} unavailable; weight redistributed", kind.to_label()),
                ));
            }
        }

        let preset = self.presets.get(business_type);
        let (weights, equal_fallback) = preset.renormalize(&available);
        if equal_fallback {
            warnings.push(QualityWarning::assumed(
                "weights_used",
                WarningSeverity::Medium,
                format!(
                    "{} preset gives zero weight to every available model; equal weights applied",
                    business_type.as_str()
                ),
            ));
        }

        let fair_value: f64 = weights
            .iter()
            .filter_map(|(kind, w)| inputs.components.get(*kind).map(|v| v * w))
            .sum();

        let current_price = usable_price(inputs.current_price);
        if current_price.is_none() {
            warnings.push(QualityWarning::missing(
                "current_price",
                WarningSeverity::High,
                "No usable market price; margin of safety not computed",
            ));
        }

        let (margin_of_safety, upside, recommendation) = match current_price {
            Some(price) if fair_value > 0.0 => {
                let mos = (fair_value - price) / fair_value;
                let upside = (fair_value - price) / price;
                (Some(mos), Some(upside), recommend(Some(mos)))
            }
            // Non-positive fair value: nothing to buy at any price
            Some(_) => (None, None, Recommendation::Avoid),
            None => (None, None, Recommendation::Unknown),
        };

        let status = if available.len() == ValuationModelKind::ALL.len() {
            AnalysisStatus::Success
        } else {
            AnalysisStatus::PartialSuccess
        };

        AnalysisResult {
            ticker,
            exchange: inputs.exchange,
            analysis_date: inputs.analysis_date,
            computed_at: Utc::now(),
            fair_value: Some(fair_value),
            current_price,
            margin_of_safety,
            upside,
            component_values: inputs.components,
            weights_used: weights,
            recommendation,
            status,
            quality_warnings: warnings,
            error_message: None,
            business_type: Some(business_type),
            data_source: inputs.data_source,
        }
    }
}
