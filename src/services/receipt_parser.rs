//! Extraction of payment facts from OCR-transcribed Yape receipts.
//!
//! Parsing is heuristic and total: a field that cannot be found is `None`,
//! never an error. Deciding whether the facts are good enough is the
//! validator's job.

use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static OPERATION_NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:operaci[oó]n|n[uú]mero|\bnro\.?|\bn\.?\s?[º°]|\bn\.)\s*:?\s*([0-9]{8,12})\b",
    )
    .unwrap()
});

static AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)S/\.?\s*([0-9]{1,10}(?:[.,][0-9]{1,2})?)").unwrap());

static DATE_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9]{1,2}[/-][0-9]{1,2}[/-][0-9]{2,4}\s+[0-9]{1,2}:[0-9]{2}\b").unwrap()
});

static RECIPIENT_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:para|destinatario|a)\b").unwrap());

static STANDALONE_PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(9[0-9]{8})\b").unwrap());

static STRONG_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:yapear a|destinatario|para)\b\s*:?\s*(\p{Alphabetic}+(?: \p{Alphabetic}+)*)")
        .unwrap()
});

static WEAK_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\ba\b\s*:?\s*(\p{Alphabetic}+(?: \p{Alphabetic}+)*)").unwrap()
});

const DEFAULT_PAYMENT_MARKER: &str = "yape";

/// Structured facts pulled out of a receipt transcription.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptFacts {
    pub operation_number: Option<String>,
    /// Largest currency amount on the receipt
    pub amount: Option<Decimal>,
    /// Raw date/time substring, not normalized
    pub date_time: Option<String>,
    pub contains_payment_marker: bool,
    pub recipient_phone: Option<String>,
    pub recipient_name: Option<String>,
    /// Original transcription, kept for audit notes
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub raw_text: String,
}

impl ReceiptFacts {
    /// True when neither recipient phone nor name could be extracted.
    pub fn recipient_unknown(&self) -> bool {
        self.recipient_phone.is_none() && self.recipient_name.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct ReceiptParser {
    payment_marker: String,
}

impl Default for ReceiptParser {
    fn default() -> Self {
        Self::new(DEFAULT_PAYMENT_MARKER)
    }
}

impl ReceiptParser {
    pub fn new(payment_marker: impl Into<String>) -> Self {
        Self {
            payment_marker: payment_marker.into().to_lowercase(),
        }
    }

    #[instrument(skip_all, fields(len = raw_text.len()))]
    pub fn parse(&self, raw_text: &str) -> ReceiptFacts {
        let text = normalize(raw_text);

        let operation_number = extract_operation_number(&text);
        let facts = ReceiptFacts {
            amount: extract_amount(&text),
            date_time: extract_date_time(&text),
            contains_payment_marker: !self.payment_marker.is_empty()
                && text.to_lowercase().contains(&self.payment_marker),
            recipient_phone: extract_recipient_phone(&text, operation_number.as_deref()),
            recipient_name: extract_recipient_name(&text),
            operation_number,
            raw_text: raw_text.to_string(),
        };

        debug!(
            operation_number = ?facts.operation_number,
            amount = ?facts.amount,
            date_time = ?facts.date_time,
            marker = facts.contains_payment_marker,
            recipient_phone = ?facts.recipient_phone,
            recipient_name = ?facts.recipient_name,
            "parsed receipt"
        );

        facts
    }
}

/// Parses with the default `yape` marker.
pub fn parse(raw_text: &str) -> ReceiptFacts {
    ReceiptParser::default().parse(raw_text)
}

fn normalize(raw: &str) -> String {
    WHITESPACE_RE.replace_all(raw, " ").trim().to_string()
}

fn extract_operation_number(text: &str) -> Option<String> {
    OPERATION_NUMBER_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn extract_amount(text: &str) -> Option<Decimal> {
    AMOUNT_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| Decimal::from_str(&m.as_str().replace(',', ".")).ok())
        .max()
        .filter(|amount| !amount.is_zero())
}

fn extract_date_time(text: &str) -> Option<String> {
    DATE_TIME_RE.find(text).map(|m| m.as_str().to_string())
}

/// First phone after the earliest recipient label, anywhere in between;
/// otherwise the first phone in the whole text.
fn extract_recipient_phone(text: &str, operation_number: Option<&str>) -> Option<String> {
    let first_phone = |haystack: &str| {
        STANDALONE_PHONE_RE
            .captures_iter(haystack)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .find(|candidate| Some(candidate.as_str()) != operation_number)
    };

    RECIPIENT_LABEL_RE
        .find(text)
        .and_then(|label| first_phone(&text[label.end()..]))
        .or_else(|| first_phone(text))
}

fn extract_recipient_name(text: &str) -> Option<String> {
    STRONG_NAME_RE
        .captures(text)
        .or_else(|| WEAK_NAME_RE.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|name| !name.is_empty())
}
