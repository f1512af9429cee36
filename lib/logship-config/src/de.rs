//! Deserialization helpers for flat, string-valued configuration.
//!
//! Every value in the flat source arrives as a string, so these helpers parse from strings only. They are designed to
//! be used with `serde_with`'s `serde_as` attribute.

use std::{collections::HashSet, time::Duration};

use logship_core::LabelSet;
use regex::Regex;
use serde::{
    de::{Error, Unexpected},
    Deserialize as _, Deserializer,
};
use serde_with::DeserializeAs;

/// Permissively deserializes a boolean.
///
/// Accepts `true`/`false`, `t`/`f` and `1`/`0`, case insensitive.
pub struct PermissiveBool;

impl<'de> DeserializeAs<'de, bool> for PermissiveBool {
    fn deserialize_as<D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        parse_bool(&value).ok_or_else(|| Error::invalid_value(Unexpected::Str(&value), &"a boolean"))
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Some(true),
        "false" | "f" | "0" => Some(false),
        _ => None,
    }
}

/// Deserializes a duration from strings like `500ms`, `30s`, `1m30s` or `1.5h`.
///
/// A bare number is interpreted as seconds.
pub struct HumanDuration;

impl<'de> DeserializeAs<'de, Duration> for HumanDuration {
    fn deserialize_as<D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        parse_duration(&value).map_err(Error::custom)
    }
}

pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration '{}': expected a number", s));
        }

        let (number, after_number) = rest.split_at(number_len);
        let number: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration '{}': bad number '{}'", s, number))?;

        let unit_len = after_number
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_number.len());
        let (unit, after_unit) = after_number.split_at(unit_len);

        let unit_secs = match unit.trim() {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "" | "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(format!("invalid duration '{}': unknown unit '{}'", s, other)),
        };

        total += Duration::from_secs_f64(number * unit_secs);
        rest = after_unit;
    }

    Ok(total)
}

/// Deserializes a comma-separated list into a set of trimmed, non-empty values.
pub struct CommaSeparatedSet;

impl<'de> DeserializeAs<'de, HashSet<String>> for CommaSeparatedSet {
    fn deserialize_as<D>(deserializer: D) -> Result<HashSet<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Deserializes a Prometheus-style label set, such as `{app="foo", env="prod"}`.
pub struct LabelSetString;

impl<'de> DeserializeAs<'de, LabelSet> for LabelSetString {
    fn deserialize_as<D>(deserializer: D) -> Result<LabelSet, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        parse_label_set(&value).map_err(Error::custom)
    }
}

pub(crate) fn parse_label_set(s: &str) -> Result<LabelSet, String> {
    let inner = s
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| format!("invalid label set '{}': must be enclosed in braces", s))?;

    // Anchored, so each match has to start exactly where the previous one ended.
    let pair = Regex::new(r#"^\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*=\s*"((?:[^"\\]|\\.)*)"\s*(?:,|$)"#)
        .map_err(|e| e.to_string())?;

    let mut labels = LabelSet::new();
    let mut rest = inner;
    while !rest.trim().is_empty() {
        let captures = pair
            .captures(rest)
            .ok_or_else(|| format!("invalid label set '{}': malformed pair near '{}'", s, rest.trim()))?;
        let value = captures[2].replace("\\\"", "\"").replace("\\\\", "\\");
        labels.insert(&captures[1], value);
        rest = &rest[captures[0].len()..];
    }

    Ok(labels)
}

/// Deserializes a regular expression.
pub struct RegexString;

impl<'de> DeserializeAs<'de, Regex> for RegexString {
    fn deserialize_as<D>(deserializer: D) -> Result<Regex, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Regex::new(&value).map_err(|e| Error::custom(format!("invalid regular expression '{}': {}", value, e)))
    }
}

/// Deserializes a value that is itself JSON-encoded.
pub struct JsonString;

impl<'de> DeserializeAs<'de, serde_json::Value> for JsonString {
    fn deserialize_as<D>(deserializer: D) -> Result<serde_json::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        serde_json::from_str(&value).map_err(|e| Error::custom(format!("invalid JSON '{}': {}", value, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        let cases = [
            ("30s", Duration::from_secs(30)),
            ("500ms", Duration::from_millis(500)),
            ("1m30s", Duration::from_secs(90)),
            ("2h", Duration::from_secs(7200)),
            ("1.5s", Duration::from_millis(1500)),
            ("15", Duration::from_secs(15)),
            ("0s", Duration::ZERO),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_duration(input).unwrap(), expected, "input: {}", input);
        }

        for input in ["", "a", "s", "10 parsecs", "1.2.3s"] {
            assert!(parse_duration(input).is_err(), "input: {}", input);
        }
    }

    #[test]
    fn booleans() {
        for input in ["true", "TRUE", "t", "1", " True "] {
            assert_eq!(parse_bool(input), Some(true), "input: {}", input);
        }
        for input in ["false", "F", "0"] {
            assert_eq!(parse_bool(input), Some(false), "input: {}", input);
        }
        for input in ["3", "a", "yes"] {
            assert_eq!(parse_bool(input), None, "input: {}", input);
        }
    }

    #[test]
    fn label_sets() {
        let labels = parse_label_set(r#"{app="foo", env = "prod,eu"}"#).unwrap();
        assert_eq!(labels.get("app"), Some("foo"));
        assert_eq!(labels.get("env"), Some("prod,eu"));
        assert_eq!(labels.len(), 2);

        let escaped = parse_label_set(r#"{msg="say \"hi\""}"#).unwrap();
        assert_eq!(escaped.get("msg"), Some(r#"say "hi""#));

        assert!(parse_label_set("{}").unwrap().is_empty());
        assert!(parse_label_set("a").is_err());
        assert!(parse_label_set(r#"{app=foo}"#).is_err());
        assert!(parse_label_set(r#"{1app="foo"}"#).is_err());
    }
}
