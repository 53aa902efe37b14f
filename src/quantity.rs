//! Arithmetic on Kubernetes resource quantities.
//!
//! `k8s_openapi` keeps quantities as opaque strings. The capacity
//! calculations need integer access to them (millicores for CPU, base units
//! for memory), so this module parses the serialized form: plain integers,
//! decimal suffixes (`k M G T P E`), binary suffixes (`Ki Mi Gi Ti Pi Ei`),
//! scientific notation and the milli suffix `m`.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{Error, Result};

const SCALE_DIVISOR: i64 = 100;

/// Checks that a quantity string is well-formed.
pub fn validate(s: &str) -> Result<()> {
    parse_milli(s).map(|_| ())
}

/// The quantity in milli units, truncated.
pub fn milli_value(q: &Quantity) -> Result<i64> {
    let milli = parse_milli(&q.0)?;
    i64::try_from(milli).map_err(|_| Error::QuantityError(q.0.clone()))
}

/// The quantity in base units, truncated.
pub fn value(q: &Quantity) -> Result<i64> {
    let milli = parse_milli(&q.0)?;
    i64::try_from(milli / 1000).map_err(|_| Error::QuantityError(q.0.clone()))
}

/// `q * percent / 100` in milli units, e.g. `1 * 90% = 900m`.
pub fn scale_milli(q: &Quantity, percent: i64) -> Result<Quantity> {
    let scaled = milli_value(q)? * percent / SCALE_DIVISOR;
    Ok(Quantity(format_milli(scaled)))
}

/// `q * percent / 100` in base units, e.g. `2000 * 90% = 1800`.
pub fn scale(q: &Quantity, percent: i64) -> Result<Quantity> {
    let scaled = value(q)? * percent / SCALE_DIVISOR;
    Ok(Quantity(scaled.to_string()))
}

fn format_milli(milli: i64) -> String {
    if milli % 1000 == 0 {
        (milli / 1000).to_string()
    } else {
        format!("{milli}m")
    }
}

fn parse_milli(s: &str) -> Result<i128> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::QuantityError(s.to_string()));
    }
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    // scientific notation carries the exponent in what looks like a suffix
    if matches!(suffix.chars().next(), Some('e') | Some('E')) && suffix.len() > 1 {
        let parsed: f64 = s
            .parse()
            .map_err(|_| Error::QuantityError(s.to_string()))?;
        return Ok((parsed * 1000.0) as i128);
    }
    let multiplier = milli_multiplier(suffix).ok_or_else(|| Error::QuantityError(s.to_string()))?;
    if number.contains('.') {
        let parsed: f64 = number
            .parse()
            .map_err(|_| Error::QuantityError(s.to_string()))?;
        Ok((parsed * multiplier as f64) as i128)
    } else {
        let parsed: i128 = number
            .parse()
            .map_err(|_| Error::QuantityError(s.to_string()))?;
        Ok(parsed * multiplier)
    }
}

/// Milli units per one unit of the given suffix.
fn milli_multiplier(suffix: &str) -> Option<i128> {
    const KI: i128 = 1024;
    Some(match suffix {
        "m" => 1,
        "" => 1000,
        "k" => 1000 * 1000,
        "M" => 1000 * 1000_000,
        "G" => 1000 * 1000_000_000,
        "T" => 1000 * 1000_000_000_000,
        "P" => 1000 * 1000_000_000_000_000,
        "E" => 1000 * 1000_000_000_000_000_000,
        "Ki" => 1000 * KI,
        "Mi" => 1000 * KI.pow(2),
        "Gi" => 1000 * KI.pow(3),
        "Ti" => 1000 * KI.pow(4),
        "Pi" => 1000 * KI.pow(5),
        "Ei" => 1000 * KI.pow(6),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantity(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn parses_millicores() {
        assert_eq!(milli_value(&quantity("50m")).unwrap(), 50);
        assert_eq!(milli_value(&quantity("1")).unwrap(), 1000);
        assert_eq!(milli_value(&quantity("0.5")).unwrap(), 500);
    }

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(value(&quantity("48Mi")).unwrap(), 48 * 1024 * 1024);
        assert_eq!(value(&quantity("1Gi")).unwrap(), 1024 * 1024 * 1024);
        assert_eq!(value(&quantity("128Ti")).unwrap(), 128 * 1024_i64.pow(4));
    }

    #[test]
    fn parses_decimal_suffixes() {
        assert_eq!(value(&quantity("2k")).unwrap(), 2000);
        assert_eq!(value(&quantity("1M")).unwrap(), 1_000_000);
        assert_eq!(value(&quantity("3e2")).unwrap(), 300);
    }

    #[test]
    fn rejects_garbage() {
        assert!(validate("").is_err());
        assert!(validate("five").is_err());
        assert!(validate("12Qi").is_err());
        assert!(validate("1.2.3").is_err());
    }

    #[test]
    fn scales_millicores_truncating() {
        assert_eq!(scale_milli(&quantity("1"), 90).unwrap().0, "900m");
        assert_eq!(scale_milli(&quantity("4"), 90).unwrap().0, "3600m");
        assert_eq!(scale_milli(&quantity("1"), 100).unwrap().0, "1");
        // 72% across 7 containers leaves 10% each
        assert_eq!(scale_milli(&quantity("1"), 72 / 7).unwrap().0, "100m");
    }

    #[test]
    fn scales_base_units_truncating() {
        assert_eq!(scale(&quantity("2000"), 90).unwrap().0, "1800");
        assert_eq!(scale(&quantity("500"), 90).unwrap().0, "450");
        assert_eq!(scale(&quantity("999"), 10).unwrap().0, "99");
    }
}
