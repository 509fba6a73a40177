//! Monetary units and money range rules.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;

/// No single value or running sum may exceed this.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Adds two amounts, returning `None` when the sum leaves the money range.
pub fn checked_money_add(a: Amount, b: Amount) -> Option<Amount> {
    let sum = a.checked_add(b)?;
    money_range(sum).then_some(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_bounds() {
        assert!(money_range(0));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(-1));
        assert!(!money_range(MAX_MONEY + 1));
    }

    #[test]
    fn checked_add_rejects_overflow() {
        assert_eq!(checked_money_add(COIN, COIN), Some(2 * COIN));
        assert_eq!(checked_money_add(MAX_MONEY, 1), None);
        assert_eq!(checked_money_add(i64::MAX, 1), None);
    }
}
