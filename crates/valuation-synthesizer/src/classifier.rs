use analysis_core::{BusinessType, NormalizedFinancialData};

const GROWTH_REVENUE_THRESHOLD: f64 = 0.15;
const ASSET_HEAVY_RATIO: f64 = 2.0;
const DISTRESSED_LEVERAGE: f64 = 0.8;

/// Pick the weight preset category for a company.
///
/// Checked in order: distressed, growth, asset-heavy, otherwise mature.
pub fn classify_business(data: &NormalizedFinancialData) -> BusinessType {
    if is_distressed(data) {
        return BusinessType::Distressed;
    }

    if data
        .revenue_growth
        .map_or(false, |g| g >= GROWTH_REVENUE_THRESHOLD)
    {
        return BusinessType::Growth;
    }

    if let (Some(assets), Some(revenue)) = (data.total_assets, data.revenue) {
        if revenue > 0.0 && assets / revenue >= ASSET_HEAVY_RATIO {
            return BusinessType::AssetHeavy;
        }
    }

    BusinessType::Mature
}

fn is_distressed(data: &NormalizedFinancialData) -> bool {
    if data.shareholders_equity.map_or(false, |e| e <= 0.0) {
        return true;
    }

    let losing_money = data.net_income.map_or(false, |ni| ni < 0.0);
    let over_levered = match (data.total_liabilities, data.total_assets) {
        (Some(liabilities), Some(assets)) if assets > 0.0 => {
            liabilities > DISTRESSED_LEVERAGE * assets
        }
        _ => false,
    };
    losing_money && over_levered
}
