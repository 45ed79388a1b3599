use super::route::RouteName;
use super::{CRITICAL_BATTERY_PERCENT, EMPTY_BATTERY_PERCENT, FULL_BATTERY_PERCENT, MS_PER_MINUTE};
use serde::{Deserialize, Serialize};

/// Fixed electrical characteristics of a vehicle model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub battery_capacity_kwh: f64,
    pub consumption_kwh_per_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusModel {
    #[serde(rename = "MBeCitaro")]
    MbECitaro,
    YutongE12,
    #[serde(rename = "BYDK9")]
    BydK9,
    Volvo7900E,
}

// Indexed by `BusModel as usize`.
static MODEL_SPECS: [ModelSpec; 4] = [
    ModelSpec { battery_capacity_kwh: 392.0, consumption_kwh_per_km: 1.11 },
    ModelSpec { battery_capacity_kwh: 422.0, consumption_kwh_per_km: 0.84 },
    ModelSpec { battery_capacity_kwh: 324.0, consumption_kwh_per_km: 1.26 },
    ModelSpec { battery_capacity_kwh: 470.0, consumption_kwh_per_km: 1.00 },
];

impl BusModel {
    pub const ALL: [BusModel; 4] = [
        BusModel::MbECitaro,
        BusModel::YutongE12,
        BusModel::BydK9,
        BusModel::Volvo7900E,
    ];

    pub fn spec(self) -> &'static ModelSpec {
        &MODEL_SPECS[self as usize]
    }

    pub fn name(self) -> &'static str {
        match self {
            BusModel::MbECitaro => "MBeCitaro",
            BusModel::YutongE12 => "YutongE12",
            BusModel::BydK9 => "BYDK9",
            BusModel::Volvo7900E => "Volvo7900E",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|m| m.name().eq_ignore_ascii_case(name))
    }
}

impl Default for BusModel {
    fn default() -> Self {
        BusModel::MbECitaro
    }
}

impl core::fmt::Display for BusModel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusStatus {
    Garage,
    Free,
    Intercept,
    Inroute,
    Returning,
    Charging,
    Repair,
}

impl BusStatus {
    pub const ALL: [BusStatus; 7] = [
        BusStatus::Garage,
        BusStatus::Free,
        BusStatus::Intercept,
        BusStatus::Inroute,
        BusStatus::Returning,
        BusStatus::Charging,
        BusStatus::Repair,
    ];

    /// Driving states that draw from the battery.
    pub fn is_in_service(self) -> bool {
        matches!(self, BusStatus::Inroute | BusStatus::Intercept | BusStatus::Returning)
    }

    /// States whose status timer advances with the clock.
    pub fn accrues_time(self) -> bool {
        self.is_in_service() || self == BusStatus::Charging
    }

    pub fn name(self) -> &'static str {
        match self {
            BusStatus::Garage => "Garage",
            BusStatus::Free => "Free",
            BusStatus::Intercept => "Intercept",
            BusStatus::Inroute => "Inroute",
            BusStatus::Returning => "Returning",
            BusStatus::Charging => "Charging",
            BusStatus::Repair => "Repair",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|s| s.name().eq_ignore_ascii_case(name))
    }
}

impl Default for BusStatus {
    fn default() -> Self {
        BusStatus::Garage
    }
}

impl core::fmt::Display for BusStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub id: String,
    pub model: BusModel,
    pub year: String,
    pub battery_level: f64,
    pub status: BusStatus,
    pub route: RouteName,
    pub last_update_ms: u64,
    pub status_changed_at_ms: u64,
    pub time_in_status_ms: u64,
    /// Id of the bus this one is standing in for. Never an owning link.
    pub replacing_bus: Option<String>,
}

impl Bus {
    pub fn new(id: impl Into<String>, model: BusModel) -> Self {
        Self {
            id: id.into(),
            model,
            year: String::new(),
            battery_level: FULL_BATTERY_PERCENT,
            status: BusStatus::Garage,
            route: RouteName::None,
            last_update_ms: 0,
            status_changed_at_ms: 0,
            time_in_status_ms: 0,
            replacing_bus: None,
        }
    }

    pub fn with_status(mut self, status: BusStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_route(mut self, route: RouteName) -> Self {
        self.route = route;
        self
    }

    pub fn with_battery_level(mut self, level: f64) -> Self {
        self.battery_level = clamp_level(level);
        self
    }

    pub fn with_year(mut self, year: impl Into<String>) -> Self {
        self.year = year.into();
        self
    }

    pub fn spec(&self) -> &'static ModelSpec {
        self.model.spec()
    }

    pub fn time_in_status_minutes(&self) -> f64 {
        self.time_in_status_ms as f64 / MS_PER_MINUTE as f64
    }

    pub fn is_critical(&self) -> bool {
        self.battery_level < f64::from(CRITICAL_BATTERY_PERCENT)
    }

    pub fn is_in_service(&self) -> bool {
        self.status.is_in_service()
    }

    pub fn display_text(&self) -> String {
        format!("{} | {} | {:.1}%", self.id, self.model, self.battery_level)
    }
}

/// Clamps a battery level into `[0, 100]`. Non-finite input maps to empty.
pub fn clamp_level(level: f64) -> f64 {
    if level.is_finite() {
        level.clamp(EMPTY_BATTERY_PERCENT, FULL_BATTERY_PERCENT)
    } else {
        EMPTY_BATTERY_PERCENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_table_lookup() {
        assert_eq!(BusModel::MbECitaro.spec().battery_capacity_kwh, 392.0);
        assert_eq!(BusModel::YutongE12.spec().consumption_kwh_per_km, 0.84);
        assert_eq!(BusModel::BydK9.spec().battery_capacity_kwh, 324.0);
        assert_eq!(BusModel::Volvo7900E.spec().consumption_kwh_per_km, 1.00);
        for model in BusModel::ALL {
            assert!(model.spec().battery_capacity_kwh > 0.0);
        }
    }

    #[test]
    fn test_name_parsing_is_case_insensitive() {
        assert_eq!(BusModel::from_name("bydk9"), Some(BusModel::BydK9));
        assert_eq!(BusModel::from_name(" MBeCitaro "), Some(BusModel::MbECitaro));
        assert_eq!(BusModel::from_name("Tesla"), None);
        assert_eq!(BusStatus::from_name("inroute"), Some(BusStatus::Inroute));
        assert_eq!(BusStatus::from_name("parked"), None);
    }

    #[test]
    fn test_builder_clamps_level() {
        let bus = Bus::new("BUS001", BusModel::YutongE12).with_battery_level(140.0);
        assert_eq!(bus.battery_level, 100.0);
        let bus = bus.with_battery_level(-3.0);
        assert_eq!(bus.battery_level, 0.0);
        assert_eq!(clamp_level(f64::NAN), 0.0);
    }

    #[test]
    fn test_service_and_critical_flags() {
        let bus = Bus::new("BUS002", BusModel::YutongE12)
            .with_status(BusStatus::Returning)
            .with_battery_level(19.5);
        assert!(bus.is_in_service());
        assert!(bus.is_critical());
        assert!(BusStatus::Charging.accrues_time());
        assert!(!BusStatus::Repair.accrues_time());
        assert_eq!(bus.display_text(), "BUS002 | YutongE12 | 19.5%");
    }
}
