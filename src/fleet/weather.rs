use serde::{Deserialize, Serialize};

const RAIN_SURCHARGE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Month {
    January,
    February,
    March,
    April,
    May,
    June,
    July,
    August,
    September,
    October,
    November,
    December,
}

impl Month {
    pub const ALL: [Month; 12] = [
        Month::January,
        Month::February,
        Month::March,
        Month::April,
        Month::May,
        Month::June,
        Month::July,
        Month::August,
        Month::September,
        Month::October,
        Month::November,
        Month::December,
    ];

    /// Seasonal consumption factor before rain.
    pub fn base_multiplier(self) -> f64 {
        match self {
            Month::December | Month::January | Month::February => 1.4,
            Month::March | Month::November => 1.2,
            Month::April | Month::October => 1.0,
            Month::May | Month::September => 0.9,
            Month::June | Month::July | Month::August => 0.8,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|m| format!("{:?}", m).eq_ignore_ascii_case(name))
    }
}

/// Month and rain inputs. The multiplier is always derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weather {
    pub month: Month,
    pub raining: bool,
}

impl Weather {
    pub fn new(month: Month, raining: bool) -> Self {
        Self { month, raining }
    }

    pub fn consumption_multiplier(&self) -> f64 {
        let base = self.month.base_multiplier();
        if self.raining {
            base + RAIN_SURCHARGE
        } else {
            base
        }
    }
}

impl Default for Weather {
    fn default() -> Self {
        Self {
            month: Month::January,
            raining: false,
        }
    }
}
