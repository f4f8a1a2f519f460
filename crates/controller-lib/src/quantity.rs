//! Kubernetes resource-quantity parsing
//!
//! Annotation values and container limits arrive as Kubernetes quantity
//! strings (`512Mi`, `1.5Gi`, `100m`, `2e6`). This module resolves them to an
//! absolute byte count.

use thiserror::Error;

/// Errors produced while parsing a quantity string.
#[derive(Debug, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("negative quantity {0:?}")]
    Negative(String),

    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),

    #[error("unknown suffix {suffix:?} in quantity {quantity:?}")]
    UnknownSuffix { quantity: String, suffix: String },

    #[error("quantity {0:?} overflows the byte range")]
    Overflow(String),
}

/// Parse a Kubernetes quantity into bytes, flooring fractional results.
///
/// Accepts plain integers, decimal numbers, binary (IEC) suffixes `Ki`..`Ei`,
/// decimal (SI) suffixes `k`..`E`, the sub-unit suffixes `m`/`u`/`n`, and
/// decimal-exponent notation (`2e6`).
pub fn parse_quantity(input: &str) -> Result<u64, QuantityError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }
    if s.starts_with('-') {
        return Err(QuantityError::Negative(input.to_string()));
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return Err(QuantityError::InvalidNumber(input.to_string()));
    }

    if is_decimal_exponent(suffix) {
        let exponent: i32 = suffix[1..]
            .parse()
            .map_err(|_| QuantityError::InvalidNumber(input.to_string()))?;
        let value: f64 = number
            .parse()
            .map_err(|_| QuantityError::InvalidNumber(input.to_string()))?;

        return float_to_bytes(value * 10f64.powi(exponent), input);
    }

    let scale = match suffix {
        "" => Scale::Mul(1),
        "Ki" => Scale::Mul(1 << 10),
        "Mi" => Scale::Mul(1 << 20),
        "Gi" => Scale::Mul(1 << 30),
        "Ti" => Scale::Mul(1 << 40),
        "Pi" => Scale::Mul(1 << 50),
        "Ei" => Scale::Mul(1 << 60),
        "k" => Scale::Mul(1_000),
        "M" => Scale::Mul(1_000_000),
        "G" => Scale::Mul(1_000_000_000),
        "T" => Scale::Mul(1_000_000_000_000),
        "P" => Scale::Mul(1_000_000_000_000_000),
        "E" => Scale::Mul(1_000_000_000_000_000_000),
        "m" => Scale::Div(1_000),
        "u" => Scale::Div(1_000_000),
        "n" => Scale::Div(1_000_000_000),
        other => {
            return Err(QuantityError::UnknownSuffix {
                quantity: input.to_string(),
                suffix: other.to_string(),
            })
        }
    };

    if number.contains('.') {
        let value: f64 = number
            .parse()
            .map_err(|_| QuantityError::InvalidNumber(input.to_string()))?;
        let scaled = match scale {
            Scale::Mul(m) => value * m as f64,
            Scale::Div(d) => value / d as f64,
        };

        return float_to_bytes(scaled, input);
    }

    let value: u128 = number
        .parse()
        .map_err(|_| QuantityError::InvalidNumber(input.to_string()))?;
    let scaled = match scale {
        Scale::Mul(m) => value
            .checked_mul(m)
            .ok_or_else(|| QuantityError::Overflow(input.to_string()))?,
        Scale::Div(d) => value / d,
    };

    u64::try_from(scaled).map_err(|_| QuantityError::Overflow(input.to_string()))
}

enum Scale {
    Mul(u128),
    Div(u128),
}

/// A decimal exponent is `e`/`E` followed by an optionally signed integer.
/// A bare `E` is the exabyte suffix, not an exponent.
fn is_decimal_exponent(suffix: &str) -> bool {
    let Some(rest) = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))
    else {
        return false;
    };
    let digits = rest.strip_prefix(['+', '-']).unwrap_or(rest);

    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn float_to_bytes(value: f64, input: &str) -> Result<u64, QuantityError> {
    if !value.is_finite() || value < 0.0 || value >= u64::MAX as f64 {
        return Err(QuantityError::Overflow(input.to_string()));
    }

    Ok(value.floor() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_integer() {
        assert_eq!(parse_quantity("1048576").unwrap(), 1_048_576);
        assert_eq!(parse_quantity("0").unwrap(), 0);
    }

    #[test]
    fn test_binary_suffixes() {
        assert_eq!(parse_quantity("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_quantity("1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_quantity("2Ki").unwrap(), 2048);
        assert_eq!(parse_quantity("1Ti").unwrap(), 1 << 40);
    }

    #[test]
    fn test_decimal_suffixes() {
        assert_eq!(parse_quantity("1k").unwrap(), 1_000);
        assert_eq!(parse_quantity("2M").unwrap(), 2_000_000);
        assert_eq!(parse_quantity("3G").unwrap(), 3_000_000_000);
    }

    #[test]
    fn test_fractional_values() {
        assert_eq!(parse_quantity("1.5Gi").unwrap(), 3 * (1 << 29));
        assert_eq!(parse_quantity("0.5Ki").unwrap(), 512);
    }

    #[test]
    fn test_sub_unit_suffixes_floor() {
        // 100 millibytes floors to zero bytes.
        assert_eq!(parse_quantity("100m").unwrap(), 0);
        assert_eq!(parse_quantity("1500m").unwrap(), 1);
    }

    #[test]
    fn test_decimal_exponent() {
        assert_eq!(parse_quantity("2e6").unwrap(), 2_000_000);
        assert_eq!(parse_quantity("1E3").unwrap(), 1_000);
        assert_eq!(parse_quantity("1.5e3").unwrap(), 1_500);
    }

    #[test]
    fn test_bare_e_is_exabytes() {
        assert_eq!(parse_quantity("1E").unwrap(), 1_000_000_000_000_000_000);
    }

    #[test]
    fn test_whitespace_and_sign() {
        assert_eq!(parse_quantity("  256Mi  ").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_quantity("+1Ki").unwrap(), 1024);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(parse_quantity(""), Err(QuantityError::Empty)));
        assert!(matches!(
            parse_quantity("-1Gi"),
            Err(QuantityError::Negative(_))
        ));
        assert!(matches!(
            parse_quantity("Mi"),
            Err(QuantityError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_quantity("12Xy"),
            Err(QuantityError::UnknownSuffix { .. })
        ));
        assert!(matches!(
            parse_quantity("1.2.3Mi"),
            Err(QuantityError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_overflow() {
        assert!(matches!(
            parse_quantity("20E"),
            Err(QuantityError::Overflow(_))
        ));
    }
}
