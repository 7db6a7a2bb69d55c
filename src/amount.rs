//! Currencies, units and exact amounts
//!
//! An `Amount` is an integer number of base units of one currency, tagged with the unit it
//! was expressed in. All scaling between units of the same currency is exact; conversion
//! across currencies is refused.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Largest supported decimal count; 10^30 still leaves headroom in an i128.
pub const MAX_DECIMALS: u8 = 30;

/// A currency, identified by `uids`
#[derive(Debug, Clone)]
pub struct Currency {
    uids: String,
    name: String,
    code: String,
    kind: String,
    issuer: Option<String>,
}

impl Currency {
    pub fn new(uids: &str, name: &str, code: &str, kind: &str, issuer: Option<&str>) -> Self {
        Self {
            uids: uids.to_string(),
            name: name.to_string(),
            code: code.to_lowercase(),
            kind: kind.to_string(),
            issuer: issuer.map(str::to_string),
        }
    }

    pub fn uids(&self) -> &str {
        &self.uids
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lowercase ticker code, e.g. `btc`
    pub fn code(&self) -> &str {
        &self.code
    }

    /// `native` for a network's own currency, `erc20` and the like for tokens
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }
}

impl PartialEq for Currency {
    fn eq(&self, other: &Self) -> bool {
        self.uids == other.uids
    }
}

impl Eq for Currency {}

impl Hash for Currency {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uids.hash(state);
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

/// A unit of a currency: the base unit has zero decimals, derived units scale it by 10^decimals
#[derive(Debug, Clone)]
pub struct Unit {
    currency: Currency,
    uids: String,
    name: String,
    symbol: String,
    decimals: u8,
}

impl Unit {
    /// Create the base unit of `currency`
    pub fn base(currency: Currency, uids: &str, name: &str, symbol: &str) -> Self {
        Self {
            currency,
            uids: uids.to_string(),
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals: 0,
        }
    }

    /// Create a unit worth 10^decimals base units
    pub fn derived(base: &Unit, uids: &str, name: &str, symbol: &str, decimals: u8) -> Self {
        Self {
            currency: base.currency.clone(),
            uids: uids.to_string(),
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals: decimals.min(MAX_DECIMALS),
        }
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn uids(&self) -> &str {
        &self.uids
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn has_currency(&self, currency: &Currency) -> bool {
        self.currency == *currency
    }

    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.currency == other.currency
    }

    fn scale(&self) -> i128 {
        // decimals is clamped to MAX_DECIMALS, so this cannot overflow
        10i128.pow(u32::from(self.decimals))
    }
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.uids == other.uids && self.currency == other.currency
    }
}

impl Eq for Unit {}

impl Hash for Unit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uids.hash(state);
        self.currency.hash(state);
    }
}

/// An exact signed quantity of a currency
#[derive(Debug, Clone)]
pub struct Amount {
    value: i128,
    unit: Unit,
}

impl Amount {
    /// Create from a raw base-unit value; `unit` is kept for display
    pub fn from_base(value: i128, unit: &Unit) -> Self {
        Self {
            value,
            unit: unit.clone(),
        }
    }

    /// `value` whole units of `unit`, or `None` on overflow
    pub fn create_integer(value: i64, unit: &Unit) -> Option<Self> {
        i128::from(value)
            .checked_mul(unit.scale())
            .map(|v| Self::from_base(v, unit))
    }

    /// Nearest base-unit value to `value` units of `unit`
    pub fn create_double(value: f64, unit: &Unit) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let scaled = (value * unit.scale() as f64).round();
        if scaled.abs() >= i128::MAX as f64 {
            return None;
        }
        Some(Self::from_base(scaled as i128, unit))
    }

    /// Parse a decimal string such as `-1.25` exactly; more fractional digits than the unit
    /// carries is rejected
    pub fn create_string(value: &str, unit: &Unit) -> Option<Self> {
        let value = value.trim();
        let (negative, digits) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value.strip_prefix('+').unwrap_or(value)),
        };
        let (whole, fraction) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
            return None;
        }
        let decimals = usize::from(unit.decimals);
        let fraction = fraction.trim_end_matches('0');
        if fraction.len() > decimals {
            return None;
        }

        let whole: i128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let padded = format!("{:0<width$}", fraction, width = decimals);
        let fraction: i128 = if padded.is_empty() { 0 } else { padded.parse().ok()? };

        let magnitude = whole.checked_mul(unit.scale())?.checked_add(fraction)?;
        Some(Self::from_base(if negative { -magnitude } else { magnitude }, unit))
    }

    /// Raw value in base units
    pub fn value(&self) -> i128 {
        self.value
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn currency(&self) -> &Currency {
        self.unit.currency()
    }

    pub fn has_currency(&self, currency: &Currency) -> bool {
        self.unit.has_currency(currency)
    }

    pub fn is_compatible(&self, other: &Amount) -> bool {
        self.unit.is_compatible(&other.unit)
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    pub fn is_negative(&self) -> bool {
        self.value < 0
    }

    pub fn negate(&self) -> Self {
        Self::from_base(-self.value, &self.unit)
    }

    /// The same quantity expressed in another unit of the same currency
    pub fn convert(&self, unit: &Unit) -> Result<Self> {
        self.check_unit(unit)?;
        Ok(Self::from_base(self.value, unit))
    }

    /// Whole units of `unit`, present only when the value is an exact multiple
    pub fn integer_in(&self, unit: &Unit) -> Option<i128> {
        if !self.unit.is_compatible(unit) {
            return None;
        }
        let scale = unit.scale();
        (self.value % scale == 0).then(|| self.value / scale)
    }

    pub fn double_in(&self, unit: &Unit) -> Option<f64> {
        if !self.unit.is_compatible(unit) {
            return None;
        }
        Some(self.value as f64 / unit.scale() as f64)
    }

    /// Exact decimal rendering in `unit`, trailing fractional zeros trimmed
    pub fn string_in(&self, unit: &Unit) -> Option<String> {
        if !self.unit.is_compatible(unit) {
            return None;
        }
        let scale = unit.scale();
        let magnitude = self.value.unsigned_abs();
        let whole = magnitude / scale as u128;
        let fraction = magnitude % scale as u128;
        let sign = if self.value < 0 { "-" } else { "" };
        if fraction == 0 {
            return Some(format!("{}{}", sign, whole));
        }
        let fraction = format!("{:0>width$}", fraction, width = usize::from(unit.decimals));
        Some(format!("{}{}.{}", sign, whole, fraction.trim_end_matches('0')))
    }

    pub fn add(&self, other: &Amount) -> Result<Self> {
        self.check_unit(&other.unit)?;
        self.value
            .checked_add(other.value)
            .map(|v| Self::from_base(v, &self.unit))
            .ok_or(Error::AmountOverflow)
    }

    pub fn sub(&self, other: &Amount) -> Result<Self> {
        self.check_unit(&other.unit)?;
        self.value
            .checked_sub(other.value)
            .map(|v| Self::from_base(v, &self.unit))
            .ok_or(Error::AmountOverflow)
    }

    fn check_unit(&self, unit: &Unit) -> Result<()> {
        if self.unit.is_compatible(unit) {
            Ok(())
        } else {
            Err(Error::CurrencyMismatch {
                expected: self.currency().code().to_string(),
                actual: unit.currency().code().to_string(),
            })
        }
    }
}

impl PartialEq for Amount {
    fn eq(&self, other: &Self) -> bool {
        self.is_compatible(other) && self.value == other.value
    }
}

/// Amounts of different currencies are unordered
impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.is_compatible(other)
            .then(|| self.value.cmp(&other.value))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.string_in(&self.unit) {
            Some(s) => write!(f, "{} {}", s, self.unit.symbol),
            None => write!(f, "{} ?", self.value),
        }
    }
}

/// An exchange rate between two currencies: one `base_unit` buys `exchange_rate` `quote_unit`s
#[derive(Debug, Clone)]
pub struct CurrencyPair {
    pub base_unit: Unit,
    pub quote_unit: Unit,
    pub exchange_rate: f64,
}

impl CurrencyPair {
    pub fn new(base_unit: Unit, quote_unit: Unit, exchange_rate: f64) -> Self {
        Self {
            base_unit,
            quote_unit,
            exchange_rate,
        }
    }

    /// Convert an amount of the quote currency into the base currency
    pub fn exchange_as_base(&self, quote: &Amount) -> Option<Amount> {
        if self.exchange_rate == 0.0 {
            return None;
        }
        let value = quote.double_in(&self.quote_unit)?;
        Amount::create_double(value / self.exchange_rate, &self.base_unit)
    }

    /// Convert an amount of the base currency into the quote currency
    pub fn exchange_as_quote(&self, base: &Amount) -> Option<Amount> {
        let value = base.double_in(&self.base_unit)?;
        Amount::create_double(value * self.exchange_rate, &self.quote_unit)
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}={}",
            self.base_unit.symbol, self.quote_unit.symbol, self.exchange_rate
        )
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{btc, eth};
    use super::*;
    use test_case::test_case;

    #[test_case("1.5", 150_000_000 ; "fraction")]
    #[test_case("-0.00000001", -1 ; "one satoshi negative")]
    #[test_case("21000000", 2_100_000_000_000_000 ; "whole")]
    #[test_case(".25", 25_000_000 ; "leading dot")]
    #[test_case("2.10000000000", 210_000_000 ; "trailing zeros beyond precision")]
    fn test_create_string(input: &str, expected: i128) {
        let (_, btc) = btc();
        assert_eq!(Amount::create_string(input, &btc).unwrap().value(), expected);
    }

    #[test_case("1.000000001" ; "too precise")]
    #[test_case("1.2.3" ; "two dots")]
    #[test_case("abc" ; "not a number")]
    #[test_case("" ; "empty")]
    fn test_create_string_rejects(input: &str) {
        let (_, btc) = btc();
        assert!(Amount::create_string(input, &btc).is_none());
    }

    #[test]
    fn test_exact_scaling() {
        let (sat, btc) = btc();
        let amount = Amount::create_integer(3, &btc).unwrap();
        assert_eq!(amount.value(), 300_000_000);
        assert_eq!(amount.integer_in(&sat), Some(300_000_000));
        assert_eq!(amount.integer_in(&btc), Some(3));

        let odd = Amount::from_base(150_000_001, &sat);
        assert_eq!(odd.integer_in(&btc), None);
        assert_eq!(odd.string_in(&btc).as_deref(), Some("1.50000001"));
        assert_eq!(odd.negate().string_in(&btc).as_deref(), Some("-1.50000001"));
        assert_eq!(odd.to_string(), "150000001 SAT");
    }

    #[test]
    fn test_cross_currency_is_refused() {
        let (sat, _) = btc();
        let (wei, eth) = eth();
        let a = Amount::from_base(1, &sat);
        let b = Amount::from_base(1, &wei);

        assert!(matches!(a.add(&b), Err(Error::CurrencyMismatch { .. })));
        assert!(a.convert(&eth).is_err());
        assert_eq!(a.partial_cmp(&b), None);
        assert_ne!(a, b);
        assert_eq!(a.string_in(&eth), None);
    }

    #[test]
    fn test_arithmetic_and_overflow() {
        let (sat, btc) = btc();
        let a = Amount::create_integer(1, &btc).unwrap();
        let b = Amount::from_base(1, &sat);
        let sum = a.add(&b).unwrap();
        assert_eq!(sum.value(), 100_000_001);
        assert!(sum > a);
        assert!(b.sub(&a).unwrap().is_negative());

        let max = Amount::from_base(i128::MAX, &sat);
        assert!(matches!(max.add(&b), Err(Error::AmountOverflow)));
    }

    #[test]
    fn test_currency_pair() {
        let (_, btc) = btc();
        let usd_currency = Currency::new("iso4217:USD", "US Dollar", "usd", "fiat", None);
        let cent = Unit::base(usd_currency, "usd-cent", "Cent", "c");
        let usd = Unit::derived(&cent, "usd-dollar", "Dollar", "$", 2);

        let pair = CurrencyPair::new(btc.clone(), usd.clone(), 20_000.0);
        let one_btc = Amount::create_integer(1, &btc).unwrap();
        let quote = pair.exchange_as_quote(&one_btc).unwrap();
        assert_eq!(quote.integer_in(&usd), Some(20_000));

        let back = pair.exchange_as_base(&quote).unwrap();
        assert_eq!(back, one_btc);
        assert!(pair.exchange_as_base(&one_btc).is_none());
    }
}
