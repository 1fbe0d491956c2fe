use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Account balance as reported by the provider's balance resource.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BalanceSnapshot {
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, rename = "balance", deserialize_with = "lenient_string")]
    pub amount: Option<String>,
}

/// One billing category from the "today" usage records.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UsageRecord {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub usage_unit: Option<String>,
    #[serde(default, rename = "usage", deserialize_with = "lenient_string")]
    pub amount: Option<String>,
}

/// Call resource reduced to the fields the exporter aggregates on.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CallRecord {
    #[serde(default)]
    pub status: Option<String>,
}

/// Message resource reduced to the fields the exporter aggregates on.
///
/// `error_code` is kept in its stringified form; the provider sends an integer or
/// `null`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageRecord {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub error_code: Option<String>,
}

impl BalanceSnapshot {
    pub fn new(currency: &str, amount: &str) -> Self {
        Self {
            currency: Some(currency.to_string()),
            amount: Some(amount.to_string()),
        }
    }
}

impl UsageRecord {
    pub fn new(category: &str, usage_unit: &str, amount: &str) -> Self {
        Self {
            category: Some(category.to_string()),
            usage_unit: Some(usage_unit.to_string()),
            amount: Some(amount.to_string()),
        }
    }
}

impl CallRecord {
    pub fn with_status(status: &str) -> Self {
        Self {
            status: Some(status.to_string()),
        }
    }
}

impl MessageRecord {
    pub fn new(status: &str, error_code: Option<&str>) -> Self {
        Self {
            status: Some(status.to_string()),
            error_code: error_code.map(str::to_string),
        }
    }
}

/// Accepts strings, numbers and `null`, normalising everything to an optional
/// string. Empty strings are treated as absent.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) if !text.is_empty() => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}
