use rust_decimal::Decimal;

use crate::error::{LedgerError, LedgerResult};

/// Relationship between a chain's smallest unit and its display unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denomination {
    pub base: String,
    pub display: String,
    /// Display unit = 10^exponent base units
    pub exponent: u32,
}

impl Denomination {
    pub fn new(base: impl Into<String>, display: impl Into<String>, exponent: u32) -> Self {
        Self {
            base: base.into(),
            display: display.into(),
            exponent,
        }
    }

    /// Display amount to base units. Fails if the amount is finer than one base unit.
    pub fn to_base_units(&self, display: Decimal) -> LedgerResult<Decimal> {
        let factor = self.factor()?;
        let base = display.checked_mul(factor).ok_or_else(|| {
            LedgerError::Units(format!("{} {} overflows base units", display, self.display))
        })?;

        if !base.fract().is_zero() {
            return Err(LedgerError::Units(format!(
                "{} {} is finer than one {}",
                display, self.display, self.base
            )));
        }

        Ok(base.normalize())
    }

    /// Base units to display amount, exact.
    pub fn from_base_units(&self, base: Decimal) -> LedgerResult<Decimal> {
        let mut display = base;
        let scale = base.scale() + self.exponent;
        // Shifting the scale is exact; division could round.
        display.set_scale(scale).map_err(|_| {
            LedgerError::Units(format!(
                "{} {} needs more than 28 fractional digits",
                base, self.base
            ))
        })?;
        Ok(display.normalize())
    }

    fn factor(&self) -> LedgerResult<Decimal> {
        10i128
            .checked_pow(self.exponent)
            .and_then(|f| Decimal::try_from_i128_with_scale(f, 0).ok())
            .ok_or_else(|| LedgerError::Units(format!("exponent {} is too large", self.exponent)))
    }
}

/// Integer string of a non-negative whole amount of base units
pub fn base_units_string(amount: Decimal) -> LedgerResult<String> {
    if amount.is_sign_negative() || !amount.fract().is_zero() {
        return Err(LedgerError::Units(format!(
            "{} is not a whole, non-negative number of base units",
            amount
        )));
    }
    Ok(amount.trunc().normalize().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn like() -> Denomination {
        Denomination::new("nanolike", "LIKE", 9)
    }

    fn wei() -> Denomination {
        Denomination::new("wei", "LIKE", 18)
    }

    #[test]
    fn test_from_base_units_is_exact() {
        assert_eq!(wei().from_base_units(dec!(3000000000000000000)).unwrap(), dec!(3));
        assert_eq!(like().from_base_units(dec!(1)).unwrap(), dec!(0.000000001));
        assert_eq!(like().from_base_units(dec!(1234567891)).unwrap(), dec!(1.234567891));
    }

    #[test]
    fn test_to_base_units_is_exact() {
        assert_eq!(wei().to_base_units(dec!(0.1)).unwrap(), dec!(100000000000000000));
        assert_eq!(like().to_base_units(dec!(1.234567891)).unwrap(), dec!(1234567891));
    }

    #[test]
    fn test_to_base_units_rejects_sub_unit_precision() {
        assert!(like().to_base_units(dec!(0.0000000001)).is_err());
    }

    #[test]
    fn test_base_units_string() {
        assert_eq!(base_units_string(dec!(3000.000)).unwrap(), "3000");
        assert!(base_units_string(dec!(1.5)).is_err());
        assert!(base_units_string(dec!(-1)).is_err());
    }
}
