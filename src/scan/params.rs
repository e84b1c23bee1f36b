//! Scan configuration parameters and their validation.
//!
//! Validation is deliberately lenient: a value that is unknown, declared
//! non-modifiable, or outside its valid set is logged as a warning and left
//! out of the outgoing start command, never turned into a hard failure. The
//! server then runs with its own default for that parameter.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::scan::ScanKind;

/// The set of values a parameter accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidValues {
    /// Any value.
    Any,
    /// One of an explicit list.
    OneOf(Vec<Value>),
    /// An integer in an inclusive range.
    IntRange {
        /// Lowest accepted value.
        min: i64,
        /// Highest accepted value.
        max: i64,
    },
}

impl ValidValues {
    /// Whether the value is inside the valid set.
    #[must_use]
    pub fn permits(&self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::OneOf(values) => values.contains(value),
            Self::IntRange { min, max } => value
                .as_i64()
                .map(|v| (*min..=*max).contains(&v))
                .unwrap_or(false),
        }
    }
}

/// Declaration of one scan configuration parameter.
#[derive(Debug, Clone)]
pub struct ScanParam {
    /// Parameter name as used in the start command.
    pub name: &'static str,

    /// Default applied by the server when the parameter is omitted.
    pub default: Value,

    /// Valid value set.
    pub valid: ValidValues,

    /// Whether callers may override the default.
    pub modifiable: bool,
}

/// Horizontal engineering range strings accepted by the scan hardware.
const HORZ_RANGES: [&str; 3] = ["-0.5 to 0.5", "-0.25 to 0.25", "-0.125 to 0.125"];

pub(crate) fn params_for(kind: ScanKind) -> Vec<ScanParam> {
    let horz_range = ScanParam {
        name: "horz-range",
        default: Value::from(HORZ_RANGES[0]),
        valid: ValidValues::OneOf(HORZ_RANGES.iter().map(|s| Value::from(*s)).collect()),
        modifiable: true,
    };
    let dwell_ber = ScanParam {
        name: "dwell-ber",
        default: Value::from("1e-6"),
        valid: ValidValues::OneOf(
            ["1e-5", "1e-6", "1e-7", "1e-8"]
                .iter()
                .map(|s| Value::from(*s))
                .collect(),
        ),
        modifiable: true,
    };
    let ber_floor = ScanParam {
        name: "ber-floor",
        default: Value::from(1e-12),
        valid: ValidValues::Any,
        modifiable: true,
    };
    // Reported by the hardware, never settable from the client side.
    let max_prescale = ScanParam {
        name: "max-prescale",
        default: Value::from(31),
        valid: ValidValues::IntRange { min: 0, max: 31 },
        modifiable: false,
    };

    match kind {
        ScanKind::Eye => vec![
            horz_range,
            dwell_ber,
            ber_floor,
            max_prescale,
            ScanParam {
                name: "vert-step",
                default: Value::from(1),
                valid: ValidValues::IntRange { min: 1, max: 16 },
                modifiable: true,
            },
        ],
        ScanKind::Slicer => vec![
            horz_range,
            dwell_ber,
            ber_floor,
            max_prescale,
            ScanParam {
                name: "taps",
                default: Value::from(5),
                valid: ValidValues::IntRange { min: 1, max: 12 },
                modifiable: true,
            },
        ],
    }
}

/// Filter a supplied configuration down to the values that may be sent.
///
/// Returns the argument object for the start command. Dropped values are
/// reported through `tracing::warn!` and nothing else; the scan proceeds
/// without them.
pub(crate) fn validate_config(
    params: &[ScanParam],
    supplied: &HashMap<String, Value>,
) -> Map<String, Value> {
    let mut accepted = Map::new();

    for (name, value) in supplied {
        let Some(param) = params.iter().find(|p| p.name == name) else {
            tracing::warn!(param = %name, "dropping unknown scan parameter");
            continue;
        };
        if !param.modifiable {
            tracing::warn!(param = %name, "dropping non-modifiable scan parameter");
            continue;
        }
        if !param.valid.permits(value) {
            tracing::warn!(
                param = %name,
                value = %value,
                "dropping scan parameter outside its valid set"
            );
            continue;
        }
        accepted.insert(name.clone(), value.clone());
    }

    accepted
}

/// The effective value of a parameter: the accepted override if present,
/// else the declared default.
pub(crate) fn effective<'a>(
    params: &'a [ScanParam],
    accepted: &'a Map<String, Value>,
    name: &str,
) -> Option<&'a Value> {
    if let Some(v) = accepted.get(name) {
        return Some(v);
    }
    params.iter().find(|p| p.name == name).map(|p| &p.default)
}
