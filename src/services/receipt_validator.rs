//! Fraud-prevention rules applied to parsed receipt facts.
//!
//! The chain is ordered: the first failing rule names the rejection. Every
//! rule is fail-closed except the receipt date, which passes when it cannot
//! be parsed.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::PaymentConfig;
use crate::entities::order::{self, OrderStatus};
use crate::services::receipt_parser::ReceiptFacts;

/// An order that already owns an operation number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundOperation {
    pub order_id: Uuid,
    pub order_number: String,
}

impl From<&order::Model> for BoundOperation {
    fn from(model: &order::Model) -> Self {
        Self {
            order_id: model.id,
            order_number: model.order_number.clone(),
        }
    }
}

/// Outcome of validating a receipt against an order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ValidationDecision {
    Accept { operation_number: String },
    Reject { reason: RejectReason },
}

impl ValidationDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, ValidationDecision::Accept { .. })
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            ValidationDecision::Reject { reason } => Some(reason),
            ValidationDecision::Accept { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    OrderNotPending {
        status: OrderStatus,
    },
    MissingPaymentMarker,
    MissingAmount,
    AmountMismatch {
        found: Decimal,
        expected: Decimal,
        difference: Decimal,
    },
    MissingOperationNumber,
    DuplicateOperationNumber {
        operation_number: String,
        order_number: String,
    },
    OutsideRecencyWindow {
        paid_at: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    RecipientNotIdentified,
    RecipientMismatch {
        phone: Option<String>,
        name: Option<String>,
    },
}

impl RejectReason {
    /// Position of the failing rule in the chain, starting at 1.
    pub fn step(&self) -> u8 {
        match self {
            RejectReason::OrderNotPending { .. } => 1,
            RejectReason::MissingPaymentMarker => 2,
            RejectReason::MissingAmount => 3,
            RejectReason::AmountMismatch { .. } => 4,
            RejectReason::MissingOperationNumber => 5,
            RejectReason::DuplicateOperationNumber { .. } => 6,
            RejectReason::OutsideRecencyWindow { .. } => 7,
            RejectReason::RecipientNotIdentified | RejectReason::RecipientMismatch { .. } => 8,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::OrderNotPending { status } => {
                write!(f, "order is {} and no longer accepts payment proofs", status)
            }
            RejectReason::MissingPaymentMarker => {
                write!(f, "receipt does not look like a Yape payment")
            }
            RejectReason::MissingAmount => write!(f, "no amount found on the receipt"),
            RejectReason::AmountMismatch {
                found,
                expected,
                difference,
            } => write!(
                f,
                "amount mismatch: receipt shows S/ {:.2}, order total is S/ {:.2} (difference S/ {:.2})",
                found, expected, difference
            ),
            RejectReason::MissingOperationNumber => {
                write!(f, "no operation number found on the receipt")
            }
            RejectReason::DuplicateOperationNumber {
                operation_number,
                order_number,
            } => write!(
                f,
                "operation number {} was already used for order {}",
                operation_number, order_number
            ),
            RejectReason::OutsideRecencyWindow { paid_at, now } => write!(
                f,
                "payment date {} is outside the accepted window (checked at {})",
                paid_at.format("%Y-%m-%d %H:%M UTC"),
                now.format("%Y-%m-%d %H:%M UTC")
            ),
            RejectReason::RecipientNotIdentified => {
                write!(f, "payment recipient could not be identified")
            }
            RejectReason::RecipientMismatch { phone, name } => write!(
                f,
                "payment recipient does not match (phone: {}, name: {})",
                phone.as_deref().unwrap_or("-"),
                name.as_deref().unwrap_or("-")
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReceiptValidator {
    config: PaymentConfig,
}

impl ReceiptValidator {
    pub fn new(config: PaymentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PaymentConfig {
        &self.config
    }

    /// Runs the rule chain. `duplicate_check` returns the order that already
    /// owns an operation number, if any.
    #[instrument(skip_all, fields(order_id = %order.id))]
    pub fn validate<F>(
        &self,
        facts: &ReceiptFacts,
        order: &order::Model,
        duplicate_check: F,
        now: DateTime<Utc>,
    ) -> ValidationDecision
    where
        F: FnOnce(&str) -> Option<BoundOperation>,
    {
        let decision = match self.check(facts, order, duplicate_check, now) {
            Ok(operation_number) => ValidationDecision::Accept { operation_number },
            Err(reason) => ValidationDecision::Reject { reason },
        };
        debug!(?decision, "receipt validated");
        decision
    }

    fn check<F>(
        &self,
        facts: &ReceiptFacts,
        order: &order::Model,
        duplicate_check: F,
        now: DateTime<Utc>,
    ) -> Result<String, RejectReason>
    where
        F: FnOnce(&str) -> Option<BoundOperation>,
    {
        if order.status != OrderStatus::Pending {
            return Err(RejectReason::OrderNotPending {
                status: order.status,
            });
        }

        if !facts.contains_payment_marker {
            return Err(RejectReason::MissingPaymentMarker);
        }

        let amount = facts.amount.ok_or(RejectReason::MissingAmount)?;
        let difference = (amount - order.total).abs();
        if difference > self.config.amount_tolerance {
            return Err(RejectReason::AmountMismatch {
                found: amount,
                expected: order.total,
                difference,
            });
        }

        let operation_number = facts
            .operation_number
            .clone()
            .ok_or(RejectReason::MissingOperationNumber)?;

        if let Some(bound) = duplicate_check(&operation_number) {
            if bound.order_id != order.id {
                return Err(RejectReason::DuplicateOperationNumber {
                    operation_number,
                    order_number: bound.order_number,
                });
            }
        }

        if let Some(paid_at) = facts
            .date_time
            .as_deref()
            .and_then(|raw| self.parse_receipt_time(raw))
        {
            let earliest = now - self.config.recency_window();
            let latest = now + self.config.future_skew();
            if paid_at < earliest || paid_at > latest {
                return Err(RejectReason::OutsideRecencyWindow { paid_at, now });
            }
        }

        self.check_recipient(facts)?;

        Ok(operation_number)
    }

    fn check_recipient(&self, facts: &ReceiptFacts) -> Result<(), RejectReason> {
        if facts.recipient_unknown() {
            return Err(RejectReason::RecipientNotIdentified);
        }

        let phone_matches = facts.recipient_phone.as_deref()
            == Some(self.config.expected_recipient_phone.as_str());

        let name_matches = match (
            facts.recipient_name.as_deref(),
            self.config.expected_recipient_name.split_whitespace().next(),
        ) {
            (Some(name), Some(first_name)) => name
                .to_lowercase()
                .contains(&first_name.to_lowercase()),
            _ => false,
        };

        if phone_matches || name_matches {
            Ok(())
        } else {
            Err(RejectReason::RecipientMismatch {
                phone: facts.recipient_phone.clone(),
                name: facts.recipient_name.clone(),
            })
        }
    }

    /// Interprets a raw `d/m/y H:M` receipt timestamp in the receipt's local
    /// offset. Two- and four-digit years are accepted; anything else is
    /// treated as unparseable.
    pub fn parse_receipt_time(&self, raw: &str) -> Option<DateTime<Utc>> {
        let normalized = raw.trim().replace('-', "/");
        let date_part = normalized.split_whitespace().next()?;
        let year_digits = date_part.rsplit('/').next()?.len();
        let layout = match year_digits {
            2 => "%d/%m/%y %H:%M",
            4 => "%d/%m/%Y %H:%M",
            _ => return None,
        };

        let naive = NaiveDateTime::parse_from_str(&normalized, layout).ok()?;
        self.config
            .receipt_offset()
            .from_local_datetime(&naive)
            .single()
            .map(|local| local.with_timezone(&Utc))
    }
}
