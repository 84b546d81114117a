//! Monetary amount extraction.
//!
//! Accepts the forms users actually type: `$50`, `$1,000.50`,
//! `1000.50 USD`, `fifty dollars`. Everything round-trips through
//! [`Decimal`] so `"$1,000.50"` and `"1000.50 usd"` compare equal.

use rust_decimal::Decimal;

/// An extracted amount with the currency it was stated in, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAmount {
    /// The numeric value.
    pub value: Decimal,
    /// Normalized currency code (e.g. `USD`), when stated.
    pub currency: Option<String>,
}

/// Parse a digit token like `1,000.50` into a [`Decimal`].
///
/// Group separators are stripped; anything else non-numeric fails.
pub fn parse_decimal(token: &str) -> Option<Decimal> {
    let cleaned: String = token.chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    cleaned.parse().ok()
}

/// Normalize a currency symbol or word to an ISO-ish code.
pub fn normalize_currency(raw: &str) -> Option<&'static str> {
    match raw.trim().to_lowercase().as_str() {
        "$" | "usd" | "dollar" | "dollars" | "buck" | "bucks" => Some("USD"),
        "usdc" => Some("USDC"),
        "usdt" => Some("USDT"),
        "eur" | "euro" | "euros" => Some("EUR"),
        "eth" | "ether" => Some("ETH"),
        "btc" | "bitcoin" => Some("BTC"),
        "sol" => Some("SOL"),
        _ => None,
    }
}

/// Find the first amount in normalized (lowercased) text.
///
/// Tried in order: `$1,000.50`, `1000.50 usd`, spelled-out numbers
/// (`fifty dollars`), then a bare number as a last resort.
pub fn find_amount(text: &str) -> Option<ParsedAmount> {
    if let Some(found) = find_symbol_amount(text) {
        return Some(found);
    }
    if let Some(found) = find_suffixed_amount(text) {
        return Some(found);
    }
    if let Some(found) = find_word_amount(text) {
        return Some(found);
    }
    find_bare_amount(text)
}

/// `$50`, `$ 1,000.50`.
fn find_symbol_amount(text: &str) -> Option<ParsedAmount> {
    let dollar = text.find('$')?;
    let rest = text.get(dollar.saturating_add(1)..)?.trim_start();
    let token: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    let value = parse_decimal(token.trim_end_matches('.'))?;
    Some(ParsedAmount {
        value,
        currency: Some("USD".to_owned()),
    })
}

/// `1000.50 usd`, `20 bucks`, `0.5 eth`.
fn find_suffixed_amount(text: &str) -> Option<ParsedAmount> {
    let words: Vec<&str> = text.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        let Some(value) = parse_decimal(word) else {
            continue;
        };
        let currency = words
            .get(i.saturating_add(1))
            .and_then(|next| normalize_currency(next));
        if let Some(code) = currency {
            return Some(ParsedAmount {
                value,
                currency: Some(code.to_owned()),
            });
        }
    }
    None
}

/// Bare number with no currency marker: weakest form, tried last.
fn find_bare_amount(text: &str) -> Option<ParsedAmount> {
    for word in text.split_whitespace() {
        if let Some(value) = parse_decimal(word) {
            return Some(ParsedAmount {
                value,
                currency: None,
            });
        }
    }
    None
}

/// Spelled-out numbers through the thousands: `fifty`, `two hundred`,
/// `one thousand five hundred dollars`.
fn find_word_amount(text: &str) -> Option<ParsedAmount> {
    let words: Vec<&str> = text.split_whitespace().collect();

    let mut start = None;
    for (i, word) in words.iter().enumerate() {
        if word_value(word).is_some() {
            start = Some(i);
            break;
        }
    }
    let start = start?;

    let mut total: u64 = 0;
    let mut current: u64 = 0;
    let mut consumed = 0usize;
    for word in words.iter().skip(start) {
        match *word {
            "hundred" if current > 0 => current = current.saturating_mul(100),
            "thousand" if current > 0 => {
                total = total.saturating_add(current.saturating_mul(1_000));
                current = 0;
            }
            "and" => {}
            other => match word_value(other) {
                Some(v) => current = current.saturating_add(v),
                None => break,
            },
        }
        consumed = consumed.saturating_add(1);
    }
    if consumed == 0 {
        return None;
    }
    total = total.saturating_add(current);
    if total == 0 {
        return None;
    }

    let currency = words
        .iter()
        .skip(start.saturating_add(consumed))
        .find_map(|w| normalize_currency(w))
        .map(ToOwned::to_owned);

    Some(ParsedAmount {
        value: Decimal::from(total),
        currency,
    })
}

fn word_value(word: &str) -> Option<u64> {
    let v = match word {
        "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        "thirteen" => 13,
        "fourteen" => 14,
        "fifteen" => 15,
        "sixteen" => 16,
        "seventeen" => 17,
        "eighteen" => 18,
        "nineteen" => 19,
        "twenty" => 20,
        "thirty" => 30,
        "forty" => 40,
        "fifty" => 50,
        "sixty" => 60,
        "seventy" => 70,
        "eighty" => 80,
        "ninety" => 90,
        _ => return None,
    };
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn symbol_and_suffixed_forms_parse_equal() {
        let a = find_amount("add $1,000.50 to my card").expect("symbol form");
        let b = find_amount("add 1000.50 usd to my card").expect("suffixed form");
        assert_eq!(a.value, b.value);
        assert_eq!(a.value, dec!(1000.50));
        assert_eq!(a.currency.as_deref(), Some("USD"));
        assert_eq!(b.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn symbol_with_space_parses() {
        let parsed = find_amount("send $ 25 to bob").expect("amount");
        assert_eq!(parsed.value, dec!(25));
    }

    #[test]
    fn word_numbers_parse() {
        let parsed = find_amount("send fifty dollars to alice").expect("amount");
        assert_eq!(parsed.value, dec!(50));
        assert_eq!(parsed.currency.as_deref(), Some("USD"));

        let parsed = find_amount("transfer two hundred fifty bucks").expect("amount");
        assert_eq!(parsed.value, dec!(250));

        let parsed = find_amount("one thousand five hundred").expect("amount");
        assert_eq!(parsed.value, dec!(1500));
        assert!(parsed.currency.is_none());
    }

    #[test]
    fn crypto_currencies_normalize() {
        let parsed = find_amount("swap 0.5 eth for usdc").expect("amount");
        assert_eq!(parsed.value, dec!(0.5));
        assert_eq!(parsed.currency.as_deref(), Some("ETH"));
    }

    #[test]
    fn bare_number_is_last_resort() {
        let parsed = find_amount("add 75 to my card").expect("amount");
        assert_eq!(parsed.value, dec!(75));
        assert!(parsed.currency.is_none());
    }

    #[test]
    fn no_amount_yields_none() {
        assert!(find_amount("send money to alice").is_none());
        assert!(find_amount("what's my balance").is_none());
    }

    #[test]
    fn group_separators_are_stripped() {
        assert_eq!(parse_decimal("1,234,567.89"), Some(dec!(1234567.89)));
        assert_eq!(parse_decimal("12"), Some(dec!(12)));
        assert_eq!(parse_decimal("12a"), None);
        assert_eq!(parse_decimal(""), None);
    }
}
