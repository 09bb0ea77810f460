//! OBIS line dispatch.
//!
//! The numeric key of a line is every decimal digit before the first `(`,
//! concatenated: `1-0:1.8.1(...)` becomes 10181, `0-0:96.14.0(...)`
//! becomes 96140. Dispatch goes through a sparse table so vendor variants
//! can add codes without touching the decode loop; unknown keys are noted
//! at debug level and skipped.

use super::snapshot::MeterReading;
use super::values::{double_parenthesis, first_parenthesis, until_star, FixedValue};
use log::debug;
use std::collections::HashMap;

type QuantityField = fn(&mut MeterReading) -> &mut FixedValue;
type CounterField = fn(&mut MeterReading) -> &mut u32;
type TextField = fn(&mut MeterReading) -> &mut String;

enum FieldRule {
    /// First-parenthesis value into a string field.
    Text(TextField),
    /// First-parenthesis value parsed as an integer count.
    Counter(CounterField),
    /// Until-star value into a fixed-point field.
    Quantity(QuantityField),
    /// Until-star value destined for a tariff band; the swap rule picks
    /// the partner field when inversion is configured.
    TariffQuantity {
        normal: QuantityField,
        swapped: QuantityField,
    },
    /// The active tariff band indicator, 1 and 2 trade places under
    /// inversion.
    TariffIndicator,
    /// Compound `(timestamp)(value*unit)` gas line, stored in both
    /// encodings.
    Gas,
    /// Free-form remainder of the line (power failure event log).
    EventLog(TextField),
    /// Known code, nothing we keep.
    Ignore,
}

pub struct ObisTable {
    rules: HashMap<u32, FieldRule>,
    invert_tariff: bool,
}

impl ObisTable {
    pub fn new(invert_tariff: bool) -> Self {
        use FieldRule::*;
        let mut rules: HashMap<u32, FieldRule> = HashMap::new();

        // identity
        rules.insert(9614, Text(|r| &mut r.p1_version)); // 0-0:96.1.4
        rules.insert(100, Text(|r| &mut r.timestamp)); // 0-0:1.0.0
        rules.insert(9611, Text(|r| &mut r.equipment_id)); // 0-0:96.1.1
        rules.insert(19610, Text(|r| &mut r.equipment_id2)); // 0-1:96.1.0

        // energy counters, tariff-banded
        rules.insert(
            10181, // 1-0:1.8.1
            TariffQuantity {
                normal: |r| &mut r.electricity_used_tariff1,
                swapped: |r| &mut r.electricity_used_tariff2,
            },
        );
        rules.insert(
            10182, // 1-0:1.8.2
            TariffQuantity {
                normal: |r| &mut r.electricity_used_tariff2,
                swapped: |r| &mut r.electricity_used_tariff1,
            },
        );
        rules.insert(
            10281, // 1-0:2.8.1
            TariffQuantity {
                normal: |r| &mut r.electricity_returned_tariff1,
                swapped: |r| &mut r.electricity_returned_tariff2,
            },
        );
        rules.insert(
            10282, // 1-0:2.8.2
            TariffQuantity {
                normal: |r| &mut r.electricity_returned_tariff2,
                swapped: |r| &mut r.electricity_returned_tariff1,
            },
        );
        rules.insert(96140, TariffIndicator); // 0-0:96.14.0

        // instantaneous power
        rules.insert(10170, Quantity(|r| &mut r.power_delivered)); // 1-0:1.7.0
        rules.insert(10270, Quantity(|r| &mut r.power_returned)); // 1-0:2.7.0
        rules.insert(102170, Quantity(|r| &mut r.power_delivered_l1)); // 1-0:21.7.0
        rules.insert(104170, Quantity(|r| &mut r.power_delivered_l2)); // 1-0:41.7.0
        rules.insert(106170, Quantity(|r| &mut r.power_delivered_l3)); // 1-0:61.7.0
        rules.insert(102270, Quantity(|r| &mut r.power_returned_l1)); // 1-0:22.7.0
        rules.insert(104270, Quantity(|r| &mut r.power_returned_l2)); // 1-0:42.7.0
        rules.insert(106270, Quantity(|r| &mut r.power_returned_l3)); // 1-0:62.7.0

        // per-phase voltage and current
        rules.insert(103270, Quantity(|r| &mut r.voltage_l1)); // 1-0:32.7.0
        rules.insert(105270, Quantity(|r| &mut r.voltage_l2)); // 1-0:52.7.0
        rules.insert(107270, Quantity(|r| &mut r.voltage_l3)); // 1-0:72.7.0
        rules.insert(103170, Quantity(|r| &mut r.current_l1)); // 1-0:31.7.0
        rules.insert(105170, Quantity(|r| &mut r.current_l2)); // 1-0:51.7.0
        rules.insert(107170, Quantity(|r| &mut r.current_l3)); // 1-0:71.7.0

        // quality counters
        rules.insert(96721, Counter(|r| &mut r.power_failures)); // 0-0:96.7.21
        rules.insert(9679, Counter(|r| &mut r.long_power_failures)); // 0-0:96.7.9
        rules.insert(1099970, EventLog(|r| &mut r.long_failures_log)); // 1-0:99.97.0
        rules.insert(1032320, Counter(|r| &mut r.voltage_sags_l1)); // 1-0:32.32.0
        rules.insert(1052320, Counter(|r| &mut r.voltage_sags_l2)); // 1-0:52.32.0
        rules.insert(1072320, Counter(|r| &mut r.voltage_sags_l3)); // 1-0:72.32.0
        rules.insert(1032360, Counter(|r| &mut r.voltage_swells_l1)); // 1-0:32.36.0
        rules.insert(1052360, Counter(|r| &mut r.voltage_swells_l2)); // 1-0:52.36.0
        rules.insert(1072360, Counter(|r| &mut r.voltage_swells_l3)); // 1-0:72.36.0

        // gas
        rules.insert(12421, Gas); // 0-1:24.2.1

        // seen in the wild, intentionally not kept
        for code in [10140, 10160, 96310, 1700, 103140, 96130, 9810] {
            rules.insert(code, Ignore);
        }

        ObisTable {
            rules,
            invert_tariff,
        }
    }

    /// Decodes one raw line into the reading. Lines without a known key
    /// leave the reading untouched.
    pub fn apply(&self, line: &str, reading: &mut MeterReading) {
        let Some(code) = line_code(line) else {
            return;
        };

        match self.rules.get(&code) {
            Some(FieldRule::Text(field)) => {
                *field(reading) = first_parenthesis(line);
            }
            Some(FieldRule::Counter(field)) => {
                *field(reading) = first_parenthesis(line).parse().unwrap_or(0);
            }
            Some(FieldRule::Quantity(field)) => {
                *field(reading) = FixedValue::parse(&until_star(line));
            }
            Some(FieldRule::TariffQuantity { normal, swapped }) => {
                let field = if self.invert_tariff { swapped } else { normal };
                *field(reading) = FixedValue::parse(&until_star(line));
            }
            Some(FieldRule::TariffIndicator) => {
                let band: u32 = first_parenthesis(line).parse().unwrap_or(0);
                reading.tariff_indicator = if self.invert_tariff {
                    if band == 1 {
                        2
                    } else {
                        1
                    }
                } else {
                    band
                };
            }
            Some(FieldRule::Gas) => {
                let value = double_parenthesis(line);
                reading.gas_no_decimals = value.chars().filter(|c| *c != '.').collect();
                reading.gas_received_5min = value;
            }
            Some(FieldRule::EventLog(field)) => {
                if let Some(p) = line.find('(') {
                    *field(reading) = line[p..].trim_end().to_string();
                }
            }
            Some(FieldRule::Ignore) => {}
            None => {
                debug!("[P1] Unrecognized line key {code}");
            }
        }
    }
}

/// Concatenates every digit before the first `(` into the dispatch key.
/// A line without a `(` carries no payload and never dispatches.
fn line_code(line: &str) -> Option<u32> {
    let mut digits = String::new();
    for c in line.chars() {
        if c == '(' {
            return digits.parse().ok();
        }
        if c.is_ascii_digit() {
            digits.push(c);
        }
    }
    None
}
