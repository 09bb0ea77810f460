//! Value extraction from OBIS data lines.
//!
//! P1 lines carry their payload in parentheses, zero-padded to a fixed
//! width, e.g. `1-0:1.8.1(000992.992*kWh)` or the two-group gas form
//! `0-1:24.2.1(231029141500W)(05446.465*m3)`. The extractors here strip
//! the padding without ever corrupting a value below 1.0.

use serde::{Serialize, Serializer};
use std::fmt;

/// Characters between the first `(` and the next `)`, with leading `0`s
/// stripped. An all-zero field yields the empty string; counter callers
/// treat that as 0.
pub fn first_parenthesis(line: &str) -> String {
    let Some(start) = line.find('(') else {
        return String::new();
    };

    let mut value = String::new();
    let mut leading = true;
    for c in line[start + 1..].chars() {
        if c == ')' {
            break;
        }
        if leading && c == '0' {
            continue;
        }
        leading = false;
        value.push(c);
    }
    value
}

/// Characters between the first `(` and the unit separator `*`, with the
/// same leading-zero stripping, except that a zero directly before the
/// decimal point survives: `(00.378*kW)` gives `0.378`, never `.378`.
pub fn until_star(line: &str) -> String {
    let Some(start) = line.find('(') else {
        return String::new();
    };

    let mut value = String::new();
    let mut leading = true;
    let mut chars = line[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '*' || c == ')' {
            break;
        }
        if leading && c != '0' {
            leading = false;
        }
        if c == '0' && chars.peek() == Some(&'.') {
            leading = false;
        }
        if !leading {
            value.push(c);
        }
    }
    value
}

/// For compound `(timestamp)(value*unit)` lines: skip to the second
/// parenthesized group and apply the until-star rule to its contents.
pub fn double_parenthesis(line: &str) -> String {
    let Some(first) = line.find('(') else {
        return String::new();
    };
    let rest = &line[first + 1..];
    match rest.find('(') {
        Some(second) => until_star(&rest[second..]),
        None => String::new(),
    }
}

/// A decimal meter value held as integer thousandths. Parsed once per
/// telegram line; accessing it never re-parses a string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedValue(i64);

impl FixedValue {
    /// Parses a cleaned decimal string (as produced by [`until_star`]).
    /// Anything unparseable, including the empty string, reads as zero.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() {
            return FixedValue(0);
        }

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        let whole: i64 = whole.parse().unwrap_or(0);

        let mut milli = 0i64;
        let mut scale = 100;
        for c in frac.chars().take(3) {
            milli += c.to_digit(10).unwrap_or(0) as i64 * scale;
            scale /= 10;
        }
        FixedValue(whole * 1000 + milli)
    }

    pub fn val(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn thousandths(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for FixedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.val())
    }
}

impl Serialize for FixedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.val())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_parenthesis_strips_padding() {
        assert_eq!(first_parenthesis("0-0:96.14.0(0001)"), "1");
        assert_eq!(first_parenthesis("0-0:96.7.21(00051)"), "51");
        assert_eq!(first_parenthesis("0-0:96.1.1(4B414C37)"), "4B414C37");
    }

    #[test]
    fn test_first_parenthesis_all_zero_is_empty() {
        // documented convention: a fully padded zero reads as ""
        assert_eq!(first_parenthesis("1-0:32.32.0(0000)"), "");
    }

    #[test]
    fn test_until_star_keeps_zero_before_decimal() {
        assert_eq!(until_star("(00.378*kW)"), "0.378");
        assert_eq!(until_star("1-0:1.8.1(000992.992*kWh)"), "992.992");
    }

    #[test]
    fn test_until_star_zero_reading_is_never_empty() {
        assert_eq!(until_star("(000000.000*kWh)"), "0.000");
    }

    #[test]
    fn test_double_parenthesis_takes_second_group() {
        assert_eq!(
            double_parenthesis("0-1:24.2.1(231029141500W)(05446.465*m3)"),
            "5446.465"
        );
        assert_eq!(double_parenthesis("0-1:24.2.1(231029141500W)"), "");
    }

    #[test]
    fn test_fixed_value_parse() {
        assert_eq!(FixedValue::parse("0.378").thousandths(), 378);
        assert_eq!(FixedValue::parse("992.992").thousandths(), 992992);
        assert_eq!(FixedValue::parse("232").thousandths(), 232000);
        assert_eq!(FixedValue::parse("").thousandths(), 0);
        assert_eq!(FixedValue::parse("1.5").thousandths(), 1500);
    }

    #[test]
    fn test_fixed_value_display() {
        assert_eq!(FixedValue::parse("0.378").to_string(), "0.378");
        assert_eq!(FixedValue::parse("5").to_string(), "5.000");
    }
}
