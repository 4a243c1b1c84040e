//! Cents-exact money arithmetic.
//!
//! Every monetary amount in the engine is a signed integer number of cents.
//! The quote oracle reports prices as decimal strings; this module owns the
//! conversion and the share/refund math used by commits and trigger fires.

use thiserror::Error;

/// Signed monetary amount in cents.
pub type Cents = i64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("malformed price string {0:?}: expected digits with exactly two fractional digits")]
    MalformedPrice(String),
    #[error("price must be at least one cent")]
    NonPositivePrice,
    #[error("amount too small to cover a single share at this price")]
    TargetTooSmall,
}

/// Convert an oracle price string to cents.
///
/// The conversion is positional: the decimal point is stripped and the digits
/// are read as an integer, so the oracle must always report exactly two
/// fractional digits ("12.34" is 1234 cents, "1.5" is rejected rather than
/// silently becoming 15 or 150).
pub fn parse_price_cents(raw: &str) -> Result<Cents, MoneyError> {
    let malformed = || MoneyError::MalformedPrice(raw.to_string());

    let trimmed = raw.trim();
    let (whole, frac) = trimmed.split_once('.').ok_or_else(malformed)?;

    if whole.is_empty() || frac.len() != 2 {
        return Err(malformed());
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }

    let dollars: i64 = whole.parse().map_err(|_| malformed())?;
    let cents_part: i64 = frac.parse().map_err(|_| malformed())?;
    let cents = dollars
        .checked_mul(100)
        .and_then(|c| c.checked_add(cents_part))
        .ok_or_else(malformed)?;

    if cents <= 0 {
        return Err(MoneyError::NonPositivePrice);
    }
    Ok(cents)
}

/// Whole shares purchasable with `reserved` cents at `price` cents per share.
#[inline]
pub fn shares_buyable(reserved: Cents, price: Cents) -> i64 {
    debug_assert!(price > 0, "price must be positive");
    reserved / price
}

/// Cents left over after buying as many whole shares as `reserved` covers.
#[inline]
pub fn buy_refund(reserved: Cents, price: Cents) -> Cents {
    reserved - shares_buyable(reserved, price) * price
}

/// Whole shares that must be sold at `price` to raise at least `target`.
///
/// Fails if even one share is out of reach, i.e. `target < 1`.
#[inline]
pub fn shares_to_sell(target: Cents, price: Cents) -> Result<i64, MoneyError> {
    debug_assert!(price > 0, "price must be positive");
    if target < 1 {
        return Err(MoneyError::TargetTooSmall);
    }
    Ok((target + price - 1) / price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_two_digit_prices() {
        assert_eq!(parse_price_cents("12.34"), Ok(1234));
        assert_eq!(parse_price_cents("1.50"), Ok(150));
        assert_eq!(parse_price_cents("0.05"), Ok(5));
        assert_eq!(parse_price_cents(" 30.00 "), Ok(3000));
    }

    #[test]
    fn rejects_nonconforming_prices() {
        for bad in ["1.5", "1.500", "12", ".50", "12.", "a.bc", "-1.00", "1,50", ""] {
            assert!(
                matches!(parse_price_cents(bad), Err(MoneyError::MalformedPrice(_))),
                "expected {bad:?} to be rejected"
            );
        }
        assert_eq!(parse_price_cents("0.00"), Err(MoneyError::NonPositivePrice));
    }

    #[test]
    fn sell_share_count_rounds_up() {
        assert_eq!(shares_to_sell(5000, 2500), Ok(2));
        assert_eq!(shares_to_sell(5000, 3000), Ok(2));
        assert_eq!(shares_to_sell(100, 3000), Ok(1));
        assert_eq!(shares_to_sell(0, 3000), Err(MoneyError::TargetTooSmall));
    }

    proptest! {
        // Buying never loses money: shares * price + refund reassembles the
        // reservation exactly, and the refund is always under one share.
        #[test]
        fn buy_split_is_exact(reserved in 1i64..1_000_000_000, price in 1i64..10_000_000) {
            let shares = shares_buyable(reserved, price);
            let refund = buy_refund(reserved, price);
            prop_assert_eq!(shares * price + refund, reserved);
            prop_assert!(refund >= 0 && refund < price);
        }

        // Selling always raises at least the target, and one share fewer
        // would not.
        #[test]
        fn sell_shares_cover_target(target in 1i64..1_000_000_000, price in 1i64..10_000_000) {
            let shares = shares_to_sell(target, price).unwrap();
            prop_assert!(shares >= 1);
            prop_assert!(shares * price >= target);
            prop_assert!((shares - 1) * price < target);
        }
    }
}
