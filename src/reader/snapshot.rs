//! The typed record produced once per completed telegram.

use super::values::FixedValue;
use serde::Serialize;

/// One decoded meter reading. OBIS lines are sparse, so a field a given
/// telegram does not carry keeps its previous value; the struct is cloned
/// wholesale into the published event only after the end marker is seen,
/// so sinks never observe a half-decoded state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeterReading {
    // identity
    pub p1_version: String,
    /// Meter timestamp, fixed-width `YYMMDDhhmmssX` as sent on the wire.
    pub timestamp: String,
    pub equipment_id: String,
    pub equipment_id2: String,

    // energy counters, 3 decimals
    pub electricity_used_tariff1: FixedValue,
    pub electricity_used_tariff2: FixedValue,
    pub electricity_returned_tariff1: FixedValue,
    pub electricity_returned_tariff2: FixedValue,

    // instantaneous
    pub power_delivered: FixedValue,
    pub power_returned: FixedValue,
    pub power_delivered_l1: FixedValue,
    pub power_delivered_l2: FixedValue,
    pub power_delivered_l3: FixedValue,
    pub power_returned_l1: FixedValue,
    pub power_returned_l2: FixedValue,
    pub power_returned_l3: FixedValue,
    pub voltage_l1: FixedValue,
    pub voltage_l2: FixedValue,
    pub voltage_l3: FixedValue,
    pub current_l1: FixedValue,
    pub current_l2: FixedValue,
    pub current_l3: FixedValue,

    // quality counters
    pub tariff_indicator: u32,
    pub power_failures: u32,
    pub long_power_failures: u32,
    pub long_failures_log: String,
    pub voltage_sags_l1: u32,
    pub voltage_sags_l2: u32,
    pub voltage_sags_l3: u32,
    pub voltage_swells_l1: u32,
    pub voltage_swells_l2: u32,
    pub voltage_swells_l3: u32,

    /// Last 5-minute gas volume, decimal form.
    pub gas_received_5min: String,
    /// Same volume with the decimal point dropped; Domoticz wants it
    /// integer-only.
    pub gas_no_decimals: String,
}
