//! Kubernetes resource quantity comparison
//!
//! Quantities such as `1Gi`, `1024Mi` and `1073741824` are different strings
//! for the same amount. The API server may also normalise what it stores, so
//! diffs on sizes and resource requirements compare parsed values.

use crate::error::{OperatorError, Result};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Exponent applied so sub-unit suffixes (`n`, `u`, `m`) stay integral
const NANO_EXPONENT: i32 = 9;

/// A parsed, non-negative quantity expressed in nano-units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ParsedQuantity(u128);

impl ParsedQuantity {
    /// Whole units, rounded down
    pub fn units(&self) -> u128 {
        self.0 / 10u128.pow(NANO_EXPONENT as u32)
    }
}

/// Parse a quantity string
pub fn parse_quantity(value: &str) -> Result<ParsedQuantity> {
    let value = value.trim();
    let invalid = || OperatorError::InvalidConfig(format!("invalid quantity '{}'", value));

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    if number.is_empty() || number.starts_with('.') || number.ends_with('.') {
        return Err(invalid());
    }

    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if fraction.contains('.') || whole.len() + fraction.len() > 30 {
        return Err(invalid());
    }

    let mut digits: u128 = 0;
    for c in whole.chars().chain(fraction.chars()) {
        let d = c.to_digit(10).ok_or_else(invalid)? as u128;
        digits = digits
            .checked_mul(10)
            .and_then(|v| v.checked_add(d))
            .ok_or_else(invalid)?;
    }

    let (binary_power, decimal_exponent) = suffix_scale(suffix).ok_or_else(invalid)?;
    let exponent = decimal_exponent
        .checked_add(NANO_EXPONENT)
        .and_then(|e| e.checked_sub(fraction.len() as i32))
        .ok_or_else(invalid)?;

    let mut nanos = digits
        .checked_mul(1u128 << binary_power)
        .ok_or_else(invalid)?;
    if exponent >= 0 {
        nanos = 10u128
            .checked_pow(exponent as u32)
            .and_then(|m| nanos.checked_mul(m))
            .ok_or_else(invalid)?;
    } else {
        nanos = match 10u128.checked_pow(exponent.unsigned_abs()) {
            Some(divisor) => nanos / divisor,
            None => 0,
        };
    }

    Ok(ParsedQuantity(nanos))
}

/// Map a suffix to (binary power of two, decimal exponent)
fn suffix_scale(suffix: &str) -> Option<(u32, i32)> {
    let scale = match suffix {
        "" => (0, 0),
        "Ki" => (10, 0),
        "Mi" => (20, 0),
        "Gi" => (30, 0),
        "Ti" => (40, 0),
        "Pi" => (50, 0),
        "Ei" => (60, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        _ => {
            // Scientific notation: 1e3, 5E-3
            let exponent = suffix.strip_prefix(['e', 'E'])?;
            let unsigned = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
            if unsigned.is_empty() || !unsigned.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            (0, exponent.parse::<i32>().ok()?)
        }
    };
    Some(scale)
}

/// Compare two quantity strings by value
pub fn compare_quantities(a: &str, b: &str) -> Result<Ordering> {
    Ok(parse_quantity(a)?.cmp(&parse_quantity(b)?))
}

/// Semantic equality, falling back to string equality when either side
/// cannot be parsed
pub fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    match (parse_quantity(&a.0), parse_quantity(&b.0)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.0 == b.0,
    }
}

fn quantity_maps_equal(
    a: Option<&BTreeMap<String, Quantity>>,
    b: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let a = a.unwrap_or(&empty);
    let b = b.unwrap_or(&empty);

    a.len() == b.len()
        && a.iter().all(|(key, qa)| {
            b.get(key)
                .map(|qb| quantities_equal(qa, qb))
                .unwrap_or(false)
        })
}

/// Compare container resource requirements by value. `None` and an empty
/// requirement set are equal.
pub fn resources_equal(
    a: Option<&ResourceRequirements>,
    b: Option<&ResourceRequirements>,
) -> bool {
    let default = ResourceRequirements::default();
    let a = a.unwrap_or(&default);
    let b = b.unwrap_or(&default);

    quantity_maps_equal(a.limits.as_ref(), b.limits.as_ref())
        && quantity_maps_equal(a.requests.as_ref(), b.requests.as_ref())
        && a.claims.as_ref().filter(|c| !c.is_empty()) == b.claims.as_ref().filter(|c| !c.is_empty())
}
