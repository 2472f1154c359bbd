use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use log::debug;
use rand::Rng;
use serde_json::{Value, json};

use crate::ToolImplementation;
use llmserve_common::{Parameters, Property, Tool};

/// Hours east of UTC for the timezone abbreviations the time tool knows.
const TIMEZONE_OFFSETS: &[(&str, i32)] = &[
    ("UTC", 0),
    ("GMT", 0),
    ("EST", -5),
    ("EDT", -4),
    ("CST", -6),
    ("CDT", -5),
    ("MST", -7),
    ("MDT", -6),
    ("PST", -8),
    ("PDT", -7),
    ("CET", 1),
    ("CEST", 2),
    ("JST", 9),
    ("AEST", 10),
    ("AEDT", 11),
];

fn utc_offset_hours(timezone: &str) -> i32 {
    let timezone = timezone.to_uppercase();
    TIMEZONE_OFFSETS
        .iter()
        .find(|(name, _)| *name == timezone)
        .map_or(0, |(_, hours)| *hours)
}

pub struct CurrentTimeTool;
#[async_trait]
impl ToolImplementation for CurrentTimeTool {
    fn get_definition(&self) -> Tool {
        Tool::function(
            "get_current_time",
            "Get the current date and time in a specific timezone",
            Parameters::from_fields([(
                "timezone",
                Property::string(
                    "Timezone abbreviation (e.g., 'UTC', 'EST', 'JST'). Unknown names fall back to UTC.",
                )
                .with_default("UTC"),
                false,
            )]),
        )
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let timezone = args
            .get("timezone")
            .and_then(Value::as_str)
            .unwrap_or("UTC");

        let offset = FixedOffset::east_opt(utc_offset_hours(timezone) * 3600)
            .context("timezone offset out of range")?;
        let now = Utc::now().with_timezone(&offset);

        Ok(json!(format!(
            "Current time in {timezone}: {}",
            now.format("%Y-%m-%d %H:%M:%S")
        )))
    }
}

fn exchange_rate(from: &str, to: &str) -> Option<f64> {
    let rate = match (from, to) {
        ("USD", "EUR") => 0.85,
        ("USD", "GBP") => 0.73,
        ("USD", "JPY") => 110.0,
        ("USD", "CAD") => 1.25,
        ("USD", "AUD") => 1.35,
        ("EUR", "USD") => 1.18,
        ("EUR", "GBP") => 0.86,
        ("EUR", "JPY") => 129.0,
        ("EUR", "CAD") => 1.47,
        ("EUR", "AUD") => 1.59,
        ("GBP", "USD") => 1.37,
        ("GBP", "EUR") => 1.16,
        ("GBP", "JPY") => 150.0,
        ("GBP", "CAD") => 1.71,
        ("GBP", "AUD") => 1.85,
        ("JPY", "USD") => 0.0091,
        ("JPY", "EUR") => 0.0078,
        ("JPY", "GBP") => 0.0067,
        ("JPY", "CAD") => 0.011,
        ("JPY", "AUD") => 0.012,
        ("CAD", "USD") => 0.80,
        ("CAD", "EUR") => 0.68,
        ("CAD", "GBP") => 0.58,
        ("CAD", "JPY") => 88.0,
        ("CAD", "AUD") => 1.08,
        ("AUD", "USD") => 0.74,
        ("AUD", "EUR") => 0.63,
        ("AUD", "GBP") => 0.54,
        ("AUD", "JPY") => 81.0,
        ("AUD", "CAD") => 0.93,
        _ => return None,
    };
    Some(rate)
}

/// Converts between USD, EUR, GBP, JPY, CAD and AUD using fixed rates.
pub struct CurrencyConverterTool;
#[async_trait]
impl ToolImplementation for CurrencyConverterTool {
    fn get_definition(&self) -> Tool {
        Tool::function(
            "convert_currency",
            "Convert an amount from one currency to another. You MUST use this tool to convert currencies in order to get the latest exchange rate.",
            Parameters::from_fields([
                ("amount", Property::number("Amount to convert"), true),
                (
                    "from_currency",
                    Property::string("Source currency code (e.g., 'USD', 'EUR')"),
                    true,
                ),
                (
                    "to_currency",
                    Property::string("Target currency code (e.g., 'USD', 'EUR')"),
                    true,
                ),
            ]),
        )
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let amount = args
            .get("amount")
            .and_then(Value::as_f64)
            .context("Missing 'amount' parameter")?;
        let from = args
            .get("from_currency")
            .and_then(Value::as_str)
            .context("Missing 'from_currency' parameter")?
            .to_uppercase();
        let to = args
            .get("to_currency")
            .and_then(Value::as_str)
            .context("Missing 'to_currency' parameter")?
            .to_uppercase();

        if from == to {
            return Ok(json!(format!("{amount:.2} {from} = {amount:.2} {to}")));
        }

        let message = match exchange_rate(&from, &to) {
            Some(rate) => {
                let converted = amount * rate;
                format!("{amount:.2} {from} = {converted:.2} {to} (rate: {rate:.4})")
            }
            None => format!("Exchange rate not available for {from} to {to}"),
        };
        Ok(json!(message))
    }
}

pub struct RandomNumberTool;
#[async_trait]
impl ToolImplementation for RandomNumberTool {
    fn get_definition(&self) -> Tool {
        Tool::function(
            "get_random_number",
            "Generate a random number within a specified range",
            Parameters::from_fields([
                (
                    "min_val",
                    Property::integer("Minimum value (default: 1)").with_default(1),
                    false,
                ),
                (
                    "max_val",
                    Property::integer("Maximum value (default: 100)").with_default(100),
                    false,
                ),
            ]),
        )
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let min = args.get("min_val").and_then(Value::as_i64).unwrap_or(1);
        let max = args.get("max_val").and_then(Value::as_i64).unwrap_or(100);

        if min > max {
            bail!("min_val ({min}) must not be greater than max_val ({max})");
        }

        let number = rand::thread_rng().gen_range(min..=max);
        debug!("Drew {number} from [{min}, {max}]");
        Ok(json!(format!(
            "Random number between {min} and {max}: {number}"
        )))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn test_utc_offsets() {
        assert_eq!(utc_offset_hours("UTC"), 0);
        assert_eq!(utc_offset_hours("jst"), 9);
        assert_eq!(utc_offset_hours("PDT"), -7);
        assert_eq!(utc_offset_hours("Mars/Olympus_Mons"), 0);
    }

    #[tokio::test]
    async fn test_current_time_format() {
        let value = CurrentTimeTool
            .execute(&json!({"timezone": "JST"}))
            .await
            .unwrap();
        let text = value.as_str().unwrap();
        assert!(text.starts_with("Current time in JST: "), "{text}");

        let stamp = text.trim_start_matches("Current time in JST: ");
        assert!(chrono::NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").is_ok());
    }

    #[tokio::test]
    async fn test_currency_conversion() {
        let value = CurrencyConverterTool
            .execute(&json!({"amount": 100, "from_currency": "usd", "to_currency": "EUR"}))
            .await
            .unwrap();
        assert_eq!(value, json!("100.00 USD = 85.00 EUR (rate: 0.8500)"));
    }

    #[tokio::test]
    async fn test_currency_same_and_unknown() {
        let same = CurrencyConverterTool
            .execute(&json!({"amount": 12.5, "from_currency": "GBP", "to_currency": "gbp"}))
            .await
            .unwrap();
        assert_eq!(same, json!("12.50 GBP = 12.50 GBP"));

        let unknown = CurrencyConverterTool
            .execute(&json!({"amount": 1, "from_currency": "USD", "to_currency": "CHF"}))
            .await
            .unwrap();
        assert_eq!(unknown, json!("Exchange rate not available for USD to CHF"));
    }

    #[tokio::test]
    async fn test_currency_missing_amount() {
        let err = CurrencyConverterTool
            .execute(&json!({"from_currency": "USD", "to_currency": "EUR"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("amount"));
    }

    #[tokio::test]
    async fn test_random_number_in_range() {
        for _ in 0..20 {
            let value = RandomNumberTool
                .execute(&json!({"min_val": 3, "max_val": 5}))
                .await
                .unwrap();
            let text = value.as_str().unwrap();
            let number: i64 = text
                .trim_start_matches("Random number between 3 and 5: ")
                .parse()
                .unwrap();
            assert!((3..=5).contains(&number));
        }
    }

    #[tokio::test]
    async fn test_random_number_rejects_inverted_range() {
        assert!(
            RandomNumberTool
                .execute(&json!({"min_val": 10, "max_val": 1}))
                .await
                .is_err()
        );
    }
}
