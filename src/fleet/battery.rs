//! Battery arithmetic.
//!
//! Every function here is pure and returns a percentage delta of the pack's
//! capacity. Nothing is clamped: the caller owns the `[0, 100]` invariant.

use super::bus::ModelSpec;
use thiserror::Error;

pub const DEFAULT_CHARGE_POWER_KW: f64 = 150.0;
pub const DEFAULT_AVERAGE_SPEED_KMH: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum BatteryError {
    #[error("battery capacity must be positive, got {0} kWh")]
    NonPositiveCapacity(f64),
}

pub struct BatteryModel;

impl BatteryModel {
    /// Percent of capacity used to drive `distance_km`.
    pub fn consume_for_distance(
        distance_km: f64,
        consumption_kwh_per_km: f64,
        weather_multiplier: f64,
        capacity_kwh: f64,
    ) -> Result<f64, BatteryError> {
        let capacity = Self::checked_capacity(capacity_kwh)?;
        let consumed_kwh = distance_km * consumption_kwh_per_km * weather_multiplier;
        Ok(consumed_kwh / capacity * 100.0)
    }

    /// Percent of capacity gained by charging for `hours`.
    pub fn charge_for_duration(
        hours: f64,
        charge_power_kw: f64,
        capacity_kwh: f64,
    ) -> Result<f64, BatteryError> {
        let capacity = Self::checked_capacity(capacity_kwh)?;
        Ok(charge_power_kw * hours / capacity * 100.0)
    }

    /// Driving hours left before `level_percent` falls to `reserve_percent`.
    ///
    /// Returns zero when the level is already at or under the reserve, or
    /// when the bus would not consume anything.
    pub fn hours_until_reserve(
        level_percent: f64,
        reserve_percent: f64,
        spec: &ModelSpec,
        weather_multiplier: f64,
        speed_kmh: f64,
    ) -> Result<f64, BatteryError> {
        let capacity = Self::checked_capacity(spec.battery_capacity_kwh)?;
        let usable_percent = level_percent - reserve_percent;
        let draw_per_km = spec.consumption_kwh_per_km * weather_multiplier;
        if usable_percent <= 0.0 || draw_per_km <= 0.0 || speed_kmh <= 0.0 {
            return Ok(0.0);
        }
        let km_left = usable_percent / 100.0 * capacity / draw_per_km;
        Ok(km_left / speed_kmh)
    }

    pub fn check_spec(spec: &ModelSpec) -> Result<(), BatteryError> {
        Self::checked_capacity(spec.battery_capacity_kwh).map(|_| ())
    }

    fn checked_capacity(capacity_kwh: f64) -> Result<f64, BatteryError> {
        // NaN fails the comparison as well
        if capacity_kwh > 0.0 && capacity_kwh.is_finite() {
            Ok(capacity_kwh)
        } else {
            Err(BatteryError::NonPositiveCapacity(capacity_kwh))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumption_formula() {
        let used = BatteryModel::consume_for_distance(20.0, 1.0, 1.0, 100.0).unwrap();
        assert!((used - 20.0).abs() < 1e-9);

        // Winter rain on a Citaro: 10 km * 1.11 * 1.5 / 392 * 100
        let used = BatteryModel::consume_for_distance(10.0, 1.11, 1.5, 392.0).unwrap();
        assert!((used - 4.247_448_979_591_836).abs() < 1e-9);
    }

    #[test]
    fn test_charge_formula() {
        // 75 kWh over half an hour into a 422 kWh pack
        let gained = BatteryModel::charge_for_duration(0.5, DEFAULT_CHARGE_POWER_KW, 422.0).unwrap();
        assert!((gained - 75.0 / 422.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert_eq!(
            BatteryModel::consume_for_distance(1.0, 1.0, 1.0, 0.0),
            Err(BatteryError::NonPositiveCapacity(0.0))
        );
        assert!(BatteryModel::charge_for_duration(1.0, 150.0, -5.0).is_err());
        assert!(BatteryModel::charge_for_duration(1.0, 150.0, f64::NAN).is_err());
        assert!(BatteryModel::charge_for_duration(1.0, 150.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_results_are_not_clamped() {
        let used = BatteryModel::consume_for_distance(1_000.0, 1.0, 1.0, 100.0).unwrap();
        assert!(used > 100.0);
    }

    #[test]
    fn test_hours_until_reserve() {
        let spec = ModelSpec { battery_capacity_kwh: 100.0, consumption_kwh_per_km: 1.0 };
        // 40% usable of 100 kWh = 40 km at 20 km/h
        let hours = BatteryModel::hours_until_reserve(53.0, 13.0, &spec, 1.0, 20.0).unwrap();
        assert!((hours - 2.0).abs() < 1e-9);
        assert_eq!(BatteryModel::hours_until_reserve(12.0, 13.0, &spec, 1.0, 20.0).unwrap(), 0.0);
    }
}
