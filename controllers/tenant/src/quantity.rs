//! Exact Kubernetes resource quantity arithmetic.
//!
//! Quantities are held as signed integers of nano-units so that sums are
//! exact. Parsing accepts the three wire forms: binary SI (`Ki`..`Ei`),
//! decimal SI (`n`, `u`, `m`, `k`, `M`..`E`) and decimal exponent (`1e3`).
//! Values finer than one nano-unit are rounded up, as the API server does.

use crate::error::ControllerError;
use crds::ResourceList;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as NativeQuantity;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const NANO: i128 = 1_000_000_000;

/// Suffix family a quantity is rendered in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    DecimalSi,
    BinarySi,
    DecimalExponent,
}

/// A parsed resource quantity.
///
/// Equality and ordering compare values only; `1`, `1000m` and `1e0` are
/// equal.
#[derive(Debug, Clone, Copy)]
pub struct Quantity {
    nanos: i128,
    format: Format,
}

impl Quantity {
    pub fn zero() -> Self {
        Self {
            nanos: 0,
            format: Format::DecimalSi,
        }
    }

    /// Add `other` in place. A zero accumulator adopts the other operand's
    /// format so that `0 + 2Gi` renders as `2Gi`.
    pub fn add(&mut self, other: &Quantity) -> Result<(), ControllerError> {
        if self.nanos == 0 {
            self.format = other.format;
        }
        self.nanos = self.nanos.checked_add(other.nanos).ok_or_else(|| {
            ControllerError::InvalidQuantity(format!("{} + {} overflows", self, other))
        })?;
        Ok(())
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.nanos == other.nanos
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nanos.cmp(&other.nanos)
    }
}

enum Scale {
    Decimal(i32),
    Binary(u32),
}

fn parse_suffix(suffix: &str) -> Option<(Format, Scale)> {
    let decimal = |e| Some((Format::DecimalSi, Scale::Decimal(e)));
    let binary = |b| Some((Format::BinarySi, Scale::Binary(b)));
    match suffix {
        "" => decimal(0),
        "n" => decimal(-9),
        "u" => decimal(-6),
        "m" => decimal(-3),
        "k" => decimal(3),
        "M" => decimal(6),
        "G" => decimal(9),
        "T" => decimal(12),
        "P" => decimal(15),
        "E" => decimal(18),
        "Ki" => binary(10),
        "Mi" => binary(20),
        "Gi" => binary(30),
        "Ti" => binary(40),
        "Pi" => binary(50),
        "Ei" => binary(60),
        s if s.len() > 1 && s.starts_with(['e', 'E']) => {
            let exp: i32 = s[1..].parse().ok()?;
            Some((Format::DecimalExponent, Scale::Decimal(exp)))
        }
        _ => None,
    }
}

/// `mantissa * 10^exp`, rounding up when `exp` is negative.
fn scale_pow10(mantissa: i128, exp: i32) -> Option<i128> {
    if exp >= 0 {
        10i128.checked_pow(exp.unsigned_abs())?.checked_mul(mantissa)
    } else {
        match 10i128.checked_pow(exp.unsigned_abs()) {
            Some(divisor) => Some(mantissa / divisor + i128::from(mantissa % divisor != 0)),
            // Anything non-zero this small rounds up to one nano-unit
            None => Some(i128::from(mantissa > 0)),
        }
    }
}

impl FromStr for Quantity {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ControllerError::InvalidQuantity(s.to_string());
        let trimmed = s.trim();
        let (negative, unsigned) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };

        let number_end = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_end);
        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if (int_part.is_empty() && frac_part.is_empty()) || frac_part.contains('.') {
            return Err(invalid());
        }

        let digits = format!("{}{}", int_part, frac_part);
        let digits = digits.trim_start_matches('0');
        let mantissa: i128 = if digits.is_empty() {
            0
        } else {
            digits.parse().map_err(|_| invalid())?
        };
        let frac_len = i32::try_from(frac_part.len()).map_err(|_| invalid())?;

        let (format, scale) = parse_suffix(suffix).ok_or_else(invalid)?;
        let magnitude = match scale {
            Scale::Decimal(exp) => 9i32
                .checked_add(exp)
                .and_then(|e| e.checked_sub(frac_len))
                .and_then(|e| scale_pow10(mantissa, e)),
            Scale::Binary(bits) => 1i128
                .checked_shl(bits)
                .and_then(|m| m.checked_mul(mantissa))
                .and_then(|m| scale_pow10(m, 9i32.checked_sub(frac_len)?)),
        }
        .ok_or_else(invalid)?;

        Ok(Self {
            nanos: if negative { -magnitude } else { magnitude },
            format,
        })
    }
}

const DECIMAL_SUFFIXES: [(i32, &str); 10] = [
    (18, "E"),
    (15, "P"),
    (12, "T"),
    (9, "G"),
    (6, "M"),
    (3, "k"),
    (0, ""),
    (-3, "m"),
    (-6, "u"),
    (-9, "n"),
];

const BINARY_SUFFIXES: [(u32, &str); 6] = [
    (60, "Ei"),
    (50, "Pi"),
    (40, "Ti"),
    (30, "Gi"),
    (20, "Mi"),
    (10, "Ki"),
];

fn write_decimal(f: &mut fmt::Formatter<'_>, abs: i128, exponent_form: bool) -> fmt::Result {
    for (exp, suffix) in DECIMAL_SUFFIXES {
        let Some(unit) = scale_pow10(1, 9 + exp) else {
            continue;
        };
        if unit > 0 && abs % unit == 0 {
            let value = abs / unit;
            return if exponent_form && exp != 0 {
                write!(f, "{}e{}", value, exp)
            } else {
                write!(f, "{}{}", value, suffix)
            };
        }
    }
    write!(f, "{}n", abs)
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos == 0 {
            return f.write_str("0");
        }
        if self.nanos < 0 {
            f.write_str("-")?;
        }
        let abs = self.nanos.abs();
        match self.format {
            Format::BinarySi if abs % NANO == 0 => {
                let units = abs / NANO;
                for (bits, suffix) in BINARY_SUFFIXES {
                    let unit = 1i128 << bits;
                    if units % unit == 0 {
                        return write!(f, "{}{}", units / unit, suffix);
                    }
                }
                write!(f, "{}", units)
            }
            Format::BinarySi | Format::DecimalSi => write_decimal(f, abs, false),
            Format::DecimalExponent => write_decimal(f, abs, true),
        }
    }
}

/// Parse every entry of a resource list
pub fn parse_list(list: &ResourceList) -> Result<BTreeMap<String, Quantity>, ControllerError> {
    list.iter()
        .map(|(name, raw)| {
            raw.parse::<Quantity>()
                .map(|q| (name.clone(), q))
                .map_err(|_| ControllerError::InvalidQuantity(format!("{}: {:?}", name, raw)))
        })
        .collect()
}

/// Render a parsed list back to its wire form
pub fn format_list(list: &BTreeMap<String, Quantity>) -> ResourceList {
    list.iter().map(|(k, v)| (k.clone(), v.to_string())).collect()
}

/// Add every entry of `add` into `total`, resource-name-wise. Names missing
/// from `total` start at zero.
pub fn add_into(
    total: &mut BTreeMap<String, Quantity>,
    add: &ResourceList,
) -> Result<(), ControllerError> {
    for (name, q) in parse_list(add)? {
        total.entry(name).or_insert_with(Quantity::zero).add(&q)?;
    }
    Ok(())
}

/// Resource list as carried by native objects (`ResourceQuota.status.used`)
pub fn from_native(list: Option<&BTreeMap<String, NativeQuantity>>) -> ResourceList {
    list.map(|l| l.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
        .unwrap_or_default()
}

pub fn to_native(list: &ResourceList) -> BTreeMap<String, NativeQuantity> {
    list.iter()
        .map(|(k, v)| (k.clone(), NativeQuantity(v.clone())))
        .collect()
}

/// Same resource names with equal values. Unparseable values fall back to
/// string comparison.
pub fn semantic_eq(a: &ResourceList, b: &ResourceList) -> bool {
    a.len() == b.len()
        && a.iter().all(|(name, va)| {
            b.get(name).is_some_and(|vb| {
                match (va.parse::<Quantity>(), vb.parse::<Quantity>()) {
                    (Ok(qa), Ok(qb)) => qa == qb,
                    _ => va == vb,
                }
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    fn list(pairs: &[(&str, &str)]) -> ResourceList {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_forms_compare_by_value() {
        assert_eq!(q("500m"), q("0.5"));
        assert_eq!(q("1"), q("1000m"));
        assert_eq!(q("1e3"), q("1k"));
        assert_eq!(q("1Ki"), q("1024"));
        assert_eq!(q("1Gi"), q("1073741824"));
        assert_eq!(q("0Gi"), Quantity::zero());
        assert!(q("2Gi") > q("2G"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "abc", "1.2.3", "12x", "Gi", "1iK", "--1"] {
            assert!(bad.parse::<Quantity>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_sub_nano_rounds_up() {
        assert_eq!(q("0.1n"), q("1n"));
        assert_eq!(q("1e-300"), q("1n"));
    }

    #[test]
    fn test_extreme_exponents_are_rejected() {
        for bad in ["1e2147483647", "1e99", "170141183460469231731687303715884105727k"] {
            assert!(
                matches!(bad.parse::<Quantity>(), Err(ControllerError::InvalidQuantity(_))),
                "{bad:?} should be rejected"
            );
        }
        assert_eq!(q("1e-2147483648"), q("1n"));
    }

    #[test]
    fn test_display_canonical() {
        assert_eq!(q("0Gi").to_string(), "0");
        assert_eq!(q("2048Mi").to_string(), "2Gi");
        assert_eq!(q("1.5Gi").to_string(), "1536Mi");
        assert_eq!(q("1500").to_string(), "1500");
        assert_eq!(q("2000").to_string(), "2k");
        assert_eq!(q("0.5").to_string(), "500m");
        assert_eq!(q("2e3").to_string(), "2e3");
        assert_eq!(q("-250m").to_string(), "-250m");
    }

    #[test]
    fn test_add_is_exact() {
        let mut total = q("100m");
        total.add(&q("900m")).unwrap();
        assert_eq!(total.to_string(), "1");

        let mut total = q("1");
        total.add(&q("500m")).unwrap();
        assert_eq!(total.to_string(), "1500m");
    }

    #[test]
    fn test_zero_adopts_format() {
        let mut total = q("0");
        total.add(&q("2Gi")).unwrap();
        assert_eq!(total.to_string(), "2Gi");
    }

    #[test]
    fn test_add_into_sums_by_name() {
        let mut total = parse_list(&list(&[("cpu", "0")])).unwrap();
        add_into(&mut total, &list(&[("cpu", "1"), ("memory", "1Gi")])).unwrap();
        add_into(&mut total, &list(&[("cpu", "250m"), ("memory", "1Gi")])).unwrap();
        assert_eq!(
            format_list(&total),
            list(&[("cpu", "1250m"), ("memory", "2Gi")])
        );
    }

    #[test]
    fn test_add_into_reports_bad_entry() {
        let mut total = BTreeMap::new();
        let err = add_into(&mut total, &list(&[("cpu", "lots")])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidQuantity(_)));
    }

    #[test]
    fn test_semantic_eq_ignores_representation() {
        assert!(semantic_eq(
            &list(&[("cpu", "1"), ("memory", "1Gi")]),
            &list(&[("memory", "1024Mi"), ("cpu", "1000m")])
        ));
        assert!(!semantic_eq(&list(&[("cpu", "1")]), &list(&[("cpu", "2")])));
        assert!(!semantic_eq(&list(&[("cpu", "0")]), &list(&[])));
    }
}
