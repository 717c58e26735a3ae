//! Fair value synthesis: reference valuation models, business classification
//! and the weighted combination of whatever models produced a value.

pub mod classifier;
pub mod models;
pub mod presets;
pub mod synthesizer;

pub use classifier::classify_business;
pub use models::{
    AssetBasedValue, DiscountedCashFlow, EarningsPowerValue, ModelAssumptions, ModelSet,
};
pub use presets::{PresetTable, WeightPreset};
pub use synthesizer::{recommend, Synthesizer, ValuationInputs};
