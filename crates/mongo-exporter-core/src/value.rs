//! Numeric coercion for loosely-typed diagnostic fields.
//!
//! Server diagnostics report the same counter as `Int32`, `Int64` or `Double`
//! depending on server version and magnitude. Everything that ends up in a
//! sample goes through [`numeric`], so the acceptance rules live in one place:
//!
//! - integers of either width and doubles are accepted;
//! - negative values are rejected (no counter or gauge in this domain is
//!   legitimately negative, a negative reading means upstream wrap-around);
//! - NaN is rejected;
//! - every other BSON type (strings, booleans, timestamps, decimals) is absent.

use mongodb::bson::Bson;

/// Interprets `value` as a non-negative real number.
///
/// Returns `None` for non-numeric types, negatives and NaN. Never fails.
pub fn numeric(value: &Bson) -> Option<f64> {
    let v = match value {
        Bson::Int32(v) => *v as f64,
        Bson::Int64(v) => *v as f64,
        Bson::Double(v) => *v,
        _ => return None,
    };
    if v.is_nan() || v < 0.0 {
        return None;
    }
    Some(v)
}

/// Converts a boolean flag into the 0/1 gauge convention.
pub fn flag(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_accepts_all_widths() {
        assert_eq!(numeric(&Bson::Int64(100)), Some(100.0));
        assert_eq!(numeric(&Bson::Int32(50)), Some(50.0));
        assert_eq!(numeric(&Bson::Double(12.5)), Some(12.5));
        assert_eq!(numeric(&Bson::Int64(0)), Some(0.0));
    }

    #[test]
    fn test_numeric_rejects_negative() {
        assert_eq!(numeric(&Bson::Int64(-1)), None);
        assert_eq!(numeric(&Bson::Int32(i32::MIN)), None);
        assert_eq!(numeric(&Bson::Double(-0.5)), None);
    }

    #[test]
    fn test_numeric_rejects_non_numeric() {
        assert_eq!(numeric(&Bson::String("100".into())), None);
        assert_eq!(numeric(&Bson::Boolean(true)), None);
        assert_eq!(numeric(&Bson::Null), None);
        assert_eq!(numeric(&Bson::Double(f64::NAN)), None);
    }

    #[test]
    fn test_numeric_large_int64_is_exact_within_f64_range() {
        let v = 1_i64 << 52;
        assert_eq!(numeric(&Bson::Int64(v)), Some(v as f64));
    }

    #[test]
    fn test_flag() {
        assert_eq!(flag(true), 1.0);
        assert_eq!(flag(false), 0.0);
    }
}
