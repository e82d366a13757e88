use serde::{Deserialize, Serialize};

/// Look-back windows and thresholds applied by the screening rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreeningConfig {
    pub duplicate_window_days: i64,
    pub rejection_window_days: i64,
    pub overstay_history_min_days: u32,
    pub phone_pattern_window_days: i64,
    pub phone_pattern_min_identities: usize,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            duplicate_window_days: 7,
            rejection_window_days: 30,
            overstay_history_min_days: 7,
            phone_pattern_window_days: 30,
            phone_pattern_min_identities: 3,
        }
    }
}
