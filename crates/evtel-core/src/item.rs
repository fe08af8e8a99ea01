//! Canonical vehicle data items

use bitflags::bitflags;

bitflags! {
    /// Bit-flag encoded physical quantities of the canonical data set.
    ///
    /// Units are metric: volts, amps, °C, kW, N·m, km/h, meters. Battery
    /// current is negative for discharge, positive for charge.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DataItems: u32 {
        const HV_BATT_V     = 0x0000_0001;
        const HV_BATT_I     = 0x0000_0002;
        const HV_BATT_MIN_T = 0x0000_0004;
        const HV_BATT_MAX_T = 0x0000_0008;
        const LV_BATT_V     = 0x0000_0010;
        const LV_BATT_I     = 0x0000_0020;
        const LV_BATT_T     = 0x0000_0040;
        const AUX_KW        = 0x0000_0100;
        const FRONT_TORQUE  = 0x0000_1000;
        const REAR_TORQUE   = 0x0000_2000;
        const SPEED         = 0x0001_0000;
        const GPS_ELEVATION = 0x0010_0000;
    }
}

impl DataItems {
    /// Every defined item paired with a stable label, for observer
    /// registration and logging.
    pub const LABELED: [(DataItems, &'static str); 12] = [
        (DataItems::HV_BATT_V, "hv_battery_voltage"),
        (DataItems::HV_BATT_I, "hv_battery_current"),
        (DataItems::HV_BATT_MIN_T, "hv_battery_min_temp"),
        (DataItems::HV_BATT_MAX_T, "hv_battery_max_temp"),
        (DataItems::LV_BATT_V, "lv_battery_voltage"),
        (DataItems::LV_BATT_I, "lv_battery_current"),
        (DataItems::LV_BATT_T, "lv_battery_temp"),
        (DataItems::AUX_KW, "aux_power_kw"),
        (DataItems::FRONT_TORQUE, "front_torque_nm"),
        (DataItems::REAR_TORQUE, "rear_torque_nm"),
        (DataItems::SPEED, "speed_kph"),
        (DataItems::GPS_ELEVATION, "gps_elevation_m"),
    ];

    /// Broker slot index of the lowest set bit.
    pub fn lowest_index(self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.bits().trailing_zeros() as usize)
        }
    }

    /// True when any bit of `wanted` is requested by `self`.
    pub fn wants(self, wanted: DataItems) -> bool {
        self.intersects(wanted)
    }
}

/// Display range for a gauge-facing quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemRange {
    pub min: f32,
    pub max: f32,
}

impl ItemRange {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_index_matches_bit_position() {
        assert_eq!(DataItems::HV_BATT_V.lowest_index(), Some(0));
        assert_eq!(DataItems::SPEED.lowest_index(), Some(16));
        assert_eq!(DataItems::GPS_ELEVATION.lowest_index(), Some(20));
        assert_eq!(DataItems::empty().lowest_index(), None);
    }

    #[test]
    fn lowest_index_uses_lowest_of_combined_mask() {
        let mask = DataItems::SPEED | DataItems::HV_BATT_I;
        assert_eq!(mask.lowest_index(), Some(1));
    }
}
