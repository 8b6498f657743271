//! Monetary units and money range rules.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// No amount larger than this (in base units) is valid.
pub const MAX_MONEY: Amount = 20_000_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Adds two amounts, failing on overflow or when the sum leaves the money range.
pub fn checked_money_add(a: Amount, b: Amount) -> Option<Amount> {
    let sum = a.checked_add(b)?;
    money_range(sum).then_some(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_add_rejects_out_of_range() {
        assert_eq!(checked_money_add(COIN, CENT), Some(COIN + CENT));
        assert_eq!(checked_money_add(MAX_MONEY, 1), None);
        assert_eq!(checked_money_add(i64::MAX, 1), None);
        assert_eq!(checked_money_add(-5, 1), None);
    }
}
