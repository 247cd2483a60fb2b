//! Small shared helpers: clocks, rounding, and order-preserving price keys.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current UTC time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Current UTC time in whole seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current UTC time formatted as `YYYY-mm-dd HH:MM:SS`.
pub fn now_str() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Round to 6 decimal places. Quantities accumulate as f64 throughout the
/// accounting layer; this keeps repeated +/- cycles from leaving dust.
pub fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

/// Order-preserving integer key for a non-negative price.
///
/// For finite `f64 >= 0.0` the IEEE-754 bit pattern is monotone, so the raw
/// bits can key an ordered map directly. Negative prices never reach the
/// consolidation book (quotes with zero/negative prices are erased, not
/// inserted).
pub fn price_key(px: f64) -> u64 {
    debug_assert!(px >= 0.0);
    px.to_bits()
}

/// Inverse of [`price_key`].
pub fn price_from_key(key: u64) -> f64 {
    f64::from_bits(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round6() {
        assert_eq!(round6(0.1 + 0.2), 0.3);
        assert_eq!(round6(1.0000004), 1.0);
        assert_eq!(round6(-2.5000004), -2.5);
    }

    #[test]
    fn test_price_key_orders_prices() {
        let prices = [0.0, 0.0001, 0.5, 1.0, 9.99, 10.0, 10.01, 1_000_000.0];
        for w in prices.windows(2) {
            assert!(price_key(w[0]) < price_key(w[1]));
        }
        for p in prices {
            assert_eq!(price_from_key(price_key(p)), p);
        }
    }

    #[test]
    fn test_clocks_are_sane() {
        let us = now_micros();
        let s = now_secs();
        assert!(us / 1_000_000 - s <= 1);
        assert_eq!(now_str().len(), 19);
    }
}
