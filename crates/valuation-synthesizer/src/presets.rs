use analysis_core::{BusinessType, ConfigError, ValuationModelKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

/// Fixed (DCF, EPV, Asset) weight triple summing to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightPreset {
    dcf: f64,
    earnings_power: f64,
    asset_based: f64,
}

impl WeightPreset {
    pub fn new(dcf: f64, earnings_power: f64, asset_based: f64) -> Result<Self, String> {
        let weights = [dcf, earnings_power, asset_based];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(format!(
                "weights must be finite and non-negative, got ({}, {}, {})",
                dcf, earnings_power, asset_based
            ));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(format!("weights must sum to 1.0, got {:.4}", sum));
        }
        Ok(Self {
            dcf,
            earnings_power,
            asset_based,
        })
    }

    /// Parse a `dcf,epv,asset` triple such as `0.5,0.3,0.2`
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>().map_err(|e| format!("{}: {}", p.trim(), e)))
            .collect::<Result<_, _>>()?;
        match parts.as_slice() {
            [d, e, a] => Self::new(*d, *e, *a),
            _ => Err(format!("expected 3 comma-separated weights, got {}", parts.len())),
        }
    }

    pub fn weight(&self, kind: ValuationModelKind) -> f64 {
        match kind {
            ValuationModelKind::Dcf => self.dcf,
            ValuationModelKind::EarningsPower => self.earnings_power,
            ValuationModelKind::AssetBased => self.asset_based,
        }
    }

    /// Renormalize over the available models so the weights used sum to 1.0.
    ///
    /// Falls back to equal weights when every available model has a zero preset
    /// weight; the bool reports whether that fallback happened.
    pub fn renormalize(
        &self,
        available: &[ValuationModelKind],
    ) -> (BTreeMap<ValuationModelKind, f64>, bool) {
        let mut out = BTreeMap::new();
        if available.is_empty() {
            return (out, false);
        }

        let sum: f64 = available.iter().map(|k| self.weight(*k)).sum();
        if sum <= f64::EPSILON {
            let equal = 1.0 / available.len() as f64;
            for k in available {
                out.insert(*k, equal);
            }
            return (out, true);
        }

        for k in available {
            out.insert(*k, self.weight(*k) / sum);
        }
        (out, false)
    }
}

/// Weight preset per business type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetTable {
    growth: WeightPreset,
    mature: WeightPreset,
    asset_heavy: WeightPreset,
    distressed: WeightPreset,
}

impl Default for PresetTable {
    fn default() -> Self {
        Self {
            growth: WeightPreset { dcf: 0.6, earnings_power: 0.3, asset_based: 0.1 },
            mature: WeightPreset { dcf: 0.4, earnings_power: 0.4, asset_based: 0.2 },
            asset_heavy: WeightPreset { dcf: 0.2, earnings_power: 0.3, asset_based: 0.5 },
            distressed: WeightPreset { dcf: 0.1, earnings_power: 0.2, asset_based: 0.7 },
        }
    }
}

impl PresetTable {
    pub fn get(&self, business_type: BusinessType) -> WeightPreset {
        match business_type {
            BusinessType::Growth => self.growth,
            BusinessType::Mature => self.mature,
            BusinessType::AssetHeavy => self.asset_heavy,
            BusinessType::Distressed => self.distressed,
        }
    }

    pub fn set(&mut self, business_type: BusinessType, preset: WeightPreset) {
        match business_type {
            BusinessType::Growth => self.growth = preset,
            BusinessType::Mature => self.mature = preset,
            BusinessType::AssetHeavy => self.asset_heavy = preset,
            BusinessType::Distressed => self.distressed = preset,
        }
    }

    /// Override a preset from its `dcf,epv,asset` string form
    pub fn set_from_str(
        &mut self,
        business_type: BusinessType,
        raw: &str,
    ) -> Result<(), ConfigError> {
        let preset =
            WeightPreset::parse(raw).map_err(|reason| ConfigError::InvalidWeightPreset {
                preset: business_type.as_str().to_string(),
                reason,
            })?;
        self.set(business_type, preset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ValuationModelKind::*;

    fn subsets() -> Vec<Vec<ValuationModelKind>> {
        vec![
            vec![Dcf],
            vec![EarningsPower],
            vec![AssetBased],
            vec![Dcf, EarningsPower],
            vec![Dcf, AssetBased],
            vec![EarningsPower, AssetBased],
            vec![Dcf, EarningsPower, AssetBased],
        ]
    }

    #[test]
    fn test_renormalized_weights_sum_to_one_and_keep_ratios() {
        let table = PresetTable::default();
        for bt in BusinessType::ALL {
            let preset = table.get(bt);
            for subset in subsets() {
                let (weights, fallback) = preset.renormalize(&subset);
                assert!(!fallback);
                assert_eq!(weights.len(), subset.len());
                let sum: f64 = weights.values().sum();
                assert_relative_eq!(sum, 1.0, epsilon = 1e-9);

                // Pairwise ratios match the preset's original ratios
                for a in &subset {
                    for b in &subset {
                        assert_relative_eq!(
                            weights[a] * preset.weight(*b),
                            weights[b] * preset.weight(*a),
                            epsilon = 1e-12
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_zero_weight_subset_falls_back_to_equal() {
        let preset = WeightPreset::new(0.5, 0.5, 0.0).unwrap();
        let (weights, fallback) = preset.renormalize(&[AssetBased]);
        assert!(fallback);
        assert_relative_eq!(weights[&AssetBased], 1.0);
    }

    #[test]
    fn test_invalid_presets_rejected() {
        assert!(WeightPreset::new(0.5, 0.5, 0.5).is_err());
        assert!(WeightPreset::new(1.2, -0.2, 0.0).is_err());
        assert!(WeightPreset::parse("0.5,0.5").is_err());
        assert!(WeightPreset::parse("a,b,c").is_err());
        assert_eq!(
            WeightPreset::parse(" 0.5, 0.3 ,0.2").unwrap(),
            WeightPreset::new(0.5, 0.3, 0.2).unwrap()
        );
    }

    #[test]
    fn test_preset_override_reports_config_error() {
        let mut table = PresetTable::default();
        let err = table.set_from_str(BusinessType::Growth, "0.9,0.9,0.9").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidWeightPreset { ref preset, .. } if preset == "growth"
        ));
        table.set_from_str(BusinessType::Growth, "1,0,0").unwrap();
        assert_relative_eq!(table.get(BusinessType::Growth).weight(Dcf), 1.0);
    }
}
