//! Conversion between human-entered ether amounts and on-chain wei.

use alloy_primitives::U256;
use alloy_primitives::utils::format_ether;
use thiserror::Error;

/// Fractional digits of the display unit (ether -> wei).
pub const DISPLAY_DECIMALS: usize = 18;

const WEI_PER_ETHER: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("invalid amount format: {0}")]
    InvalidFormat(String),
}

/// Parses an unsigned decimal ether amount ("1", "0.01", "12.500") into wei.
///
/// Zero is a valid parse; callers that need a positive amount check it.
pub fn parse_display_amount(text: &str) -> Result<U256, AmountError> {
    let trimmed = text.trim();
    let (whole, fraction) = split_decimal(trimmed)?;

    let fraction = if fraction.len() > DISPLAY_DECIMALS {
        let (kept, excess) = fraction.split_at(DISPLAY_DECIMALS);
        if excess.bytes().any(|b| b != b'0') {
            return Err(AmountError::InvalidFormat(format!(
                "{trimmed:?} has more than {DISPLAY_DECIMALS} decimal places"
            )));
        }
        kept
    } else {
        fraction
    };

    let overflow = || AmountError::InvalidFormat(format!("{trimmed:?} is too large"));

    let whole = U256::from_str_radix(whole, 10).map_err(|_| overflow())?;
    let mut fraction_wei = U256::ZERO;
    if !fraction.is_empty() {
        let padded = format!("{fraction:0<width$}", width = DISPLAY_DECIMALS);
        fraction_wei = U256::from_str_radix(&padded, 10).map_err(|_| overflow())?;
    }

    whole
        .checked_mul(WEI_PER_ETHER)
        .and_then(|wei| wei.checked_add(fraction_wei))
        .ok_or_else(overflow)
}

/// Formats wei as a normalized ether string: no trailing fractional zeros and
/// `"0"` for zero.
pub fn format_smallest_unit(value: U256) -> String {
    trim_fraction(&format_ether(value))
}

/// Same as [`format_smallest_unit`], treating an absent value as zero.
pub fn format_optional(value: Option<U256>) -> String {
    format_smallest_unit(value.unwrap_or_default())
}

/// Canonical form of a syntactically valid display amount: redundant leading
/// zeros of the whole part and trailing zeros of the fraction are removed.
pub fn normalize_display_amount(text: &str) -> Result<String, AmountError> {
    let (whole, fraction) = split_decimal(text.trim())?;

    let whole = whole.trim_start_matches('0');
    let whole = if whole.is_empty() { "0" } else { whole };
    let fraction = fraction.trim_end_matches('0');

    if fraction.is_empty() {
        Ok(whole.to_owned())
    } else {
        Ok(format!("{whole}.{fraction}"))
    }
}

fn split_decimal(text: &str) -> Result<(&str, &str), AmountError> {
    let invalid = || AmountError::InvalidFormat(format!("{text:?} is not an unsigned decimal number"));

    let (whole, fraction) = match text.split_once('.') {
        Some((whole, fraction)) => {
            if fraction.is_empty() {
                return Err(invalid());
            }
            (whole, fraction)
        }
        None => (text, ""),
    };

    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    Ok((whole, fraction))
}

fn trim_fraction(formatted: &str) -> String {
    match formatted.split_once('.') {
        Some((whole, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                whole.to_owned()
            } else {
                format!("{whole}.{fraction}")
            }
        }
        None => formatted.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wei(value: u128) -> U256 {
        U256::from(value)
    }

    #[test]
    fn parses_whole_and_fractional_amounts() {
        assert_eq!(parse_display_amount("1").unwrap(), wei(1_000_000_000_000_000_000));
        assert_eq!(parse_display_amount("0.01").unwrap(), wei(10_000_000_000_000_000));
        assert_eq!(parse_display_amount(" 2.5 ").unwrap(), wei(2_500_000_000_000_000_000));
        assert_eq!(parse_display_amount("0.000000000000000001").unwrap(), wei(1));
        assert_eq!(parse_display_amount("0").unwrap(), U256::ZERO);
        assert_eq!(parse_display_amount("0.0").unwrap(), U256::ZERO);
    }

    #[test]
    fn excess_decimals_are_allowed_only_when_zero() {
        assert_eq!(parse_display_amount("1.0000000000000000010").unwrap(), wei(1_000_000_000_000_000_001));
        assert!(parse_display_amount("1.0000000000000000001").is_err());
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["", "   ", "-1", "+1", "1e18", "abc", "1.", ".5", "1.2.3", "0x10", "1,5", "1 000"] {
            assert!(
                matches!(parse_display_amount(input), Err(AmountError::InvalidFormat(_))),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_values_beyond_256_bits() {
        let huge = "9".repeat(80);
        assert!(parse_display_amount(&huge).is_err());
    }

    #[test]
    fn formats_normalized_ether() {
        assert_eq!(format_smallest_unit(U256::ZERO), "0");
        assert_eq!(format_smallest_unit(wei(1_000_000_000_000_000_000)), "1");
        assert_eq!(format_smallest_unit(wei(10_000_000_000_000_000)), "0.01");
        assert_eq!(format_smallest_unit(wei(1)), "0.000000000000000001");
        assert_eq!(format_optional(None), "0");
        assert_eq!(format_optional(Some(wei(1_500_000_000_000_000_000))), "1.5");
    }

    #[test]
    fn format_inverts_parse_up_to_normalization() {
        for input in [
            "0",
            "000",
            "1",
            "007.50",
            "0.01",
            "0.010000",
            "123456789.123456789",
            "0.000000000000000001",
            "1.000000000000000000000",
        ] {
            let parsed = parse_display_amount(input).unwrap();
            assert_eq!(
                format_smallest_unit(parsed),
                normalize_display_amount(input).unwrap(),
                "round trip of {input:?}"
            );
        }
    }
}
