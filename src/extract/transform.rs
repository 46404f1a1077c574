//! Field value transforms
//!
//! Transforms never fail a record: a rejected value becomes
//! `FieldValue::Unparsed` and the caller attaches a diagnostic.

use regex::Regex;
use url::Url;

use crate::config::TransformSpec;
use crate::extract::FieldValue;
use crate::ConfigError;

/// A compiled `TransformSpec`
#[derive(Debug, Clone)]
pub enum Transform {
    Text,
    Integer,
    Number,
    Lowercase,
    Url,
    Regex(Regex),
}

impl Transform {
    pub fn compile(spec: Option<&TransformSpec>) -> Result<Self, ConfigError> {
        Ok(match spec {
            None | Some(TransformSpec::Text) => Self::Text,
            Some(TransformSpec::Integer) => Self::Integer,
            Some(TransformSpec::Number) => Self::Number,
            Some(TransformSpec::Lowercase) => Self::Lowercase,
            Some(TransformSpec::Url) => Self::Url,
            Some(TransformSpec::Regex(pattern)) => Self::Regex(
                Regex::new(pattern)
                    .map_err(|e| ConfigError::InvalidPattern(format!("{}: {}", pattern, e)))?,
            ),
        })
    }

    /// Applies the transform to raw element text
    ///
    /// Returns the reason on failure; `base` resolves relative URLs.
    pub fn apply(&self, raw: &str, base: &Url) -> Result<FieldValue, String> {
        let text = collapse_whitespace(raw);

        match self {
            Self::Text => Ok(FieldValue::Text(text)),
            Self::Lowercase => Ok(FieldValue::Text(text.to_lowercase())),
            Self::Integer => numeric_core(&text)
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|_| format!("'{}' is not an integer", text)),
            Self::Number => {
                let core = numeric_core(&text);
                match core.parse::<f64>() {
                    Ok(n) if n.is_finite() => Ok(FieldValue::Number(n)),
                    _ => Err(format!("'{}' is not a number", text)),
                }
            }
            Self::Url => {
                if text.is_empty() {
                    return Err("empty URL".to_string());
                }
                base.join(&text)
                    .map(|u| FieldValue::Text(u.to_string()))
                    .map_err(|e| format!("'{}' is not a URL: {}", text, e))
            }
            Self::Regex(re) => {
                let caps = re
                    .captures(&text)
                    .ok_or_else(|| format!("'{}' does not match /{}/", text, re.as_str()))?;
                let matched = caps.get(1).or_else(|| caps.get(0)).map_or("", |m| m.as_str());
                Ok(FieldValue::Text(matched.to_string()))
            }
        }
    }
}

pub(crate) fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strips currency symbols, units and thousands separators around a number
fn numeric_core(text: &str) -> String {
    text.trim_matches(|c: char| !(c.is_ascii_digit() || c == '-' || c == '+' || c == '.'))
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | ' ' | '\u{a0}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://shop.example.com/items/").unwrap()
    }

    #[test]
    fn test_text_collapses_whitespace() {
        let value = Transform::Text.apply("  Blue \n\t Widget ", &base()).unwrap();
        assert_eq!(value, FieldValue::Text("Blue Widget".into()));
    }

    #[test]
    fn test_number_tolerates_currency_and_separators() {
        let value = Transform::Number.apply("$1,299.50", &base()).unwrap();
        assert_eq!(value, FieldValue::Number(1299.5));

        let value = Transform::Number.apply("12.00 EUR", &base()).unwrap();
        assert_eq!(value, FieldValue::Number(12.0));
    }

    #[test]
    fn test_number_rejects_text() {
        assert!(Transform::Number.apply("call for price", &base()).is_err());
    }

    #[test]
    fn test_integer() {
        assert_eq!(
            Transform::Integer.apply("1,024 reviews", &base()).unwrap(),
            FieldValue::Integer(1024)
        );
        assert!(Transform::Integer.apply("4.5", &base()).is_err());
    }

    #[test]
    fn test_url_resolves_relative() {
        let value = Transform::Url.apply("widget-42", &base()).unwrap();
        assert_eq!(
            value,
            FieldValue::Text("https://shop.example.com/items/widget-42".into())
        );
    }

    #[test]
    fn test_regex_first_group_or_whole_match() {
        let sku = Transform::compile(Some(&TransformSpec::Regex(r"SKU:\s*(\w+)".into()))).unwrap();
        assert_eq!(
            sku.apply("SKU: AB12", &base()).unwrap(),
            FieldValue::Text("AB12".into())
        );

        let digits = Transform::compile(Some(&TransformSpec::Regex(r"\d+".into()))).unwrap();
        assert_eq!(
            digits.apply("page 17 of 20", &base()).unwrap(),
            FieldValue::Text("17".into())
        );
        assert!(digits.apply("none", &base()).is_err());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let result = Transform::compile(Some(&TransformSpec::Regex("(".into())));
        assert!(matches!(result, Err(ConfigError::InvalidPattern(_))));
    }
}
