//! Minor-unit amounts and the decimal-string wire codec.
//!
//! Amounts are held internally as `u64` minor units (cents). The escrow
//! provider transmits decimal strings, so parsing and formatting live here
//! and nowhere else.

use crate::error::CivicError;

/// Parse a decimal amount string ("1000", "1000.5", "1000.50") into minor units.
///
/// At most two fractional digits are accepted; negatives and malformed input
/// are rejected.
pub fn parse_decimal(value: &str) -> Result<u64, CivicError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CivicError::validation("amount must not be empty"));
    }
    if trimmed.starts_with('-') {
        return Err(CivicError::validation(format!(
            "amount '{trimmed}' must not be negative"
        )));
    }

    let (whole, frac) = match trimmed.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (trimmed, ""),
    };

    if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
        return Err(CivicError::validation(format!(
            "amount '{trimmed}' is not a decimal number"
        )));
    }
    if frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(CivicError::validation(format!(
            "amount '{trimmed}' must have at most two fractional digits"
        )));
    }

    let whole: u64 = whole
        .parse()
        .map_err(|_| CivicError::validation(format!("amount '{trimmed}' is too large")))?;

    let cents = match frac.len() {
        0 => 0,
        1 => frac.parse::<u64>().unwrap_or(0) * 10,
        _ => frac.parse::<u64>().unwrap_or(0),
    };

    whole
        .checked_mul(100)
        .and_then(|minor| minor.checked_add(cents))
        .ok_or_else(|| CivicError::validation(format!("amount '{trimmed}' is too large")))
}

/// Render minor units as the provider's decimal-string form, e.g. `25000` -> "250.00".
pub fn format_minor(minor: u64) -> String {
    format!("{}.{:02}", minor / 100, minor % 100)
}

/// Split a total evenly across `parts` milestones.
///
/// Remainder cents are assigned to the final slice so the slices always sum
/// exactly to the total.
pub fn equal_split(total_minor: u64, parts: usize) -> Vec<u64> {
    if parts == 0 {
        return Vec::new();
    }
    let parts_u64 = parts as u64;
    let base = total_minor / parts_u64;
    let remainder = total_minor % parts_u64;

    let mut slices = vec![base; parts];
    if let Some(last) = slices.last_mut() {
        *last += remainder;
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whole_and_fractional_amounts() {
        assert_eq!(parse_decimal("1000").unwrap(), 100_000);
        assert_eq!(parse_decimal("1000.5").unwrap(), 100_050);
        assert_eq!(parse_decimal("1000.50").unwrap(), 100_050);
        assert_eq!(parse_decimal("0.07").unwrap(), 7);
    }

    #[test]
    fn rejects_malformed_amounts() {
        for bad in ["", "-5", "12.345", "12,50", "abc", "1.2.3"] {
            assert!(parse_decimal(bad).is_err(), "expected rejection for {bad:?}");
        }
    }

    #[test]
    fn formats_minor_units_with_two_digits() {
        assert_eq!(format_minor(25_000), "250.00");
        assert_eq!(format_minor(7), "0.07");
        assert_eq!(format_minor(100_050), "1000.50");
    }

    #[test]
    fn decimal_string_roundtrip() {
        for minor in [0, 1, 99, 100, 25_000, 100_050] {
            assert_eq!(parse_decimal(&format_minor(minor)).unwrap(), minor);
        }
    }

    #[test]
    fn equal_split_is_exact() {
        assert_eq!(equal_split(100_000, 4), vec![25_000, 25_000, 25_000, 25_000]);
        assert_eq!(equal_split(100_000, 3), vec![33_333, 33_333, 33_334]);
        assert_eq!(equal_split(5, 3), vec![1, 1, 3]);
        assert!(equal_split(100, 0).is_empty());

        for (total, parts) in [(100_000_u64, 7_usize), (999, 4), (1, 3)] {
            let slices = equal_split(total, parts);
            assert_eq!(slices.iter().sum::<u64>(), total);
            assert_eq!(slices.len(), parts);
        }
    }
}
