//! Reduction of fetched records into bounded gauge value sets.
//!
//! Each gauge is fed through an explicit [`Dimension`] table, one per labelled
//! field, so only enumerated provider values (currencies, categories, statuses,
//! error codes) ever become label values. Identifiers such as SIDs, phone numbers
//! and timestamps are never read.

use std::collections::BTreeMap;

use crate::gauge::{GaugeDescriptor, GaugeValues};
use crate::types::{BalanceSnapshot, CallRecord, MessageRecord, UsageRecord};
use crate::UNKNOWN_LABEL;

/// A label name paired with the function that extracts its value from a record.
///
/// Returning `None` excludes the record from the breakdown.
pub struct Dimension<R> {
    pub label: &'static str,
    pub extract: fn(&R) -> Option<String>,
}

pub const BALANCE_CURRENCY: Dimension<BalanceSnapshot> = Dimension {
    label: "currency",
    extract: balance_currency,
};

pub const USAGE_CATEGORY: Dimension<UsageRecord> = Dimension {
    label: "category",
    extract: usage_category,
};

pub const USAGE_UNIT: Dimension<UsageRecord> = Dimension {
    label: "usage_unit",
    extract: usage_unit,
};

pub const CALL_STATUS: Dimension<CallRecord> = Dimension {
    label: "status",
    extract: call_status,
};

pub const MESSAGE_STATUS: Dimension<MessageRecord> = Dimension {
    label: "status",
    extract: message_status,
};

pub const MESSAGE_ERROR_CODE: Dimension<MessageRecord> = Dimension {
    label: "error_code",
    extract: message_error_code,
};

pub const ACCOUNT_BALANCE: GaugeDescriptor = GaugeDescriptor {
    name: "twilio_account_balance",
    help: "Current balance of the Twilio account.",
    labels: &[BALANCE_CURRENCY.label],
};

pub const USAGE: GaugeDescriptor = GaugeDescriptor {
    name: "twilio_usage",
    help: "Usage accrued today, summed per category and measured in usage_unit.",
    labels: &[USAGE_CATEGORY.label, USAGE_UNIT.label],
};

pub const CALLS: GaugeDescriptor = GaugeDescriptor {
    name: "twilio_calls",
    help: "Calls in the configured window by status.",
    labels: &[CALL_STATUS.label],
};

pub const MESSAGES: GaugeDescriptor = GaugeDescriptor {
    name: "twilio_messages",
    help: "Messages in the configured window by status.",
    labels: &[MESSAGE_STATUS.label],
};

pub const MESSAGE_ERRORS: GaugeDescriptor = GaugeDescriptor {
    name: "twilio_message_errors",
    help: "Messages in the configured window carrying an error code, by code.",
    labels: &[MESSAGE_ERROR_CODE.label],
};

fn balance_currency(record: &BalanceSnapshot) -> Option<String> {
    Some(record.currency.clone().unwrap_or_default())
}

fn usage_category(record: &UsageRecord) -> Option<String> {
    Some(record.category.clone().unwrap_or_default())
}

fn usage_unit(record: &UsageRecord) -> Option<String> {
    Some(record.usage_unit.clone().unwrap_or_default())
}

fn call_status(record: &CallRecord) -> Option<String> {
    Some(status_or_unknown(record.status.as_deref()))
}

fn message_status(record: &MessageRecord) -> Option<String> {
    Some(status_or_unknown(record.status.as_deref()))
}

fn message_error_code(record: &MessageRecord) -> Option<String> {
    record.error_code.clone().filter(|code| !code.is_empty())
}

fn status_or_unknown(status: Option<&str>) -> String {
    match status {
        Some(status) if !status.is_empty() => status.to_string(),
        _ => UNKNOWN_LABEL.to_string(),
    }
}

/// Parses a provider decimal. Absent, unparseable and non-finite values are `None`.
pub fn parse_amount(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// One series per balance snapshot, labelled by currency.
///
/// Unparseable amounts publish `0.0`, unless `skip_missing` is set, in which case
/// zero and unparseable amounts are omitted.
pub fn balance_values(records: &[BalanceSnapshot], skip_missing: bool) -> GaugeValues {
    let mut values = GaugeValues::new();
    for record in records {
        let amount = parse_amount(record.amount.as_deref());
        if skip_missing && amount.unwrap_or(0.0) == 0.0 {
            continue;
        }
        if let Some(currency) = (BALANCE_CURRENCY.extract)(record) {
            values.insert(vec![currency], amount.unwrap_or(0.0));
        }
    }
    values
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct UsageKey {
    category: String,
    usage_unit: String,
}

/// Sums usage per `(category, usage_unit)`; unparseable amounts contribute zero.
///
/// With `skip_missing`, groups whose total is zero are omitted.
pub fn usage_values(records: &[UsageRecord], skip_missing: bool) -> GaugeValues {
    let mut totals: BTreeMap<UsageKey, f64> = BTreeMap::new();
    for record in records {
        let (Some(category), Some(usage_unit)) =
            ((USAGE_CATEGORY.extract)(record), (USAGE_UNIT.extract)(record))
        else {
            continue;
        };
        let amount = parse_amount(record.amount.as_deref()).unwrap_or(0.0);
        *totals
            .entry(UsageKey {
                category,
                usage_unit,
            })
            .or_insert(0.0) += amount;
    }

    totals
        .into_iter()
        .filter(|(_, total)| !(skip_missing && *total == 0.0))
        .map(|(key, total)| (vec![key.category, key.usage_unit], total))
        .collect()
}

/// Counts records per value of a single dimension.
pub fn count_by<R>(records: &[R], dimension: &Dimension<R>) -> GaugeValues {
    let mut values = GaugeValues::new();
    for record in records {
        if let Some(label) = (dimension.extract)(record) {
            *values.entry(vec![label]).or_insert(0.0) += 1.0;
        }
    }
    values
}

/// Message counts by status and by error code, computed in a single pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBreakdown {
    pub by_status: GaugeValues,
    pub by_error_code: GaugeValues,
}

pub fn message_breakdown(records: &[MessageRecord]) -> MessageBreakdown {
    let mut breakdown = MessageBreakdown::default();
    for record in records {
        if let Some(status) = (MESSAGE_STATUS.extract)(record) {
            *breakdown.by_status.entry(vec![status]).or_insert(0.0) += 1.0;
        }
        if let Some(code) = (MESSAGE_ERROR_CODE.extract)(record) {
            *breakdown.by_error_code.entry(vec![code]).or_insert(0.0) += 1.0;
        }
    }
    breakdown
}
