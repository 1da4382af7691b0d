use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    commands::{
        orders::{
            find_bound_operation, load_order_with_items, ApplyProofDecisionCommand,
            CreateOrderRequest, DeleteOrderCommand, SetOrderStatusCommand, SubmitOrderCommand,
        },
        Command,
    },
    config::{PaymentConfig, RejectionPolicy},
    db::DbPool,
    entities::{order, OrderStatus, OrderWithItems},
    errors::ServiceError,
    events::EventSender,
    services::{
        ocr::{OcrClient, ProofImage},
        receipt_parser::{ReceiptFacts, ReceiptParser},
        receipt_validator::{BoundOperation, ReceiptValidator, RejectReason, ValidationDecision},
        storage::ObjectStorage,
    },
};

const MAX_PER_PAGE: u64 = 100;

/// Result of running a payment proof through parsing, validation and
/// fulfillment.
#[derive(Clone, Debug, Serialize)]
pub struct ProofOutcome {
    pub order: OrderWithItems,
    pub decision: ValidationDecision,
    pub facts: ReceiptFacts,
}

impl ProofOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.decision.is_accept() && self.order.status() == OrderStatus::Confirmed
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        self.decision.reject_reason()
    }

    /// Converts a rejection into `ServiceError::ValidationRejected`.
    pub fn into_result(self) -> Result<OrderWithItems, ServiceError> {
        match self.decision {
            ValidationDecision::Accept { .. } => Ok(self.order),
            ValidationDecision::Reject { reason } => Err(ServiceError::ValidationRejected(reason)),
        }
    }
}

/// Filters for order listings. Empty fields do not filter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    /// Substring of the customer phone
    pub customer_phone: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Service for submitting orders and driving them through payment
/// confirmation and fulfillment.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    parser: ReceiptParser,
    validator: ReceiptValidator,
    ocr: Option<Arc<dyn OcrClient>>,
    storage: Option<Arc<dyn ObjectStorage>>,
}

impl OrderService {
    /// Creates a new order service instance
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        payment: PaymentConfig,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            parser: ReceiptParser::new(payment.payment_marker.clone()),
            validator: ReceiptValidator::new(payment),
            ocr: None,
            storage: None,
        }
    }

    /// Attaches the OCR and object-storage collaborators used by the image
    /// pipeline.
    pub fn with_collaborators(
        mut self,
        ocr: Arc<dyn OcrClient>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        self.ocr = Some(ocr);
        self.storage = Some(storage);
        self
    }

    fn payment(&self) -> &PaymentConfig {
        self.validator.config()
    }

    /// Creates a Pending order numbered for the current business day.
    #[instrument(skip(self, request), fields(customer = %request.customer_name, lines = request.items.len()))]
    pub async fn submit_order(&self, request: CreateOrderRequest) -> Result<OrderWithItems, ServiceError> {
        let business_date = Utc::now()
            .with_timezone(&self.payment().business_offset())
            .date_naive();
        SubmitOrderCommand::new(request, business_date)
            .execute(self.db_pool.clone(), self.event_sender.clone())
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        load_order_with_items(self.db_pool.as_ref(), order_id).await
    }

    /// Lists orders newest first. `page` starts at 1.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        filter: OrderFilter,
        page: u64,
        per_page: u64,
    ) -> Result<Page<order::Model>, ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError("Page numbers start at 1".to_string()));
        }
        let per_page = per_page.clamp(1, MAX_PER_PAGE);

        let mut condition = Condition::all();
        if let Some(status) = filter.status {
            condition = condition.add(order::Column::Status.eq(status));
        }
        if let Some(phone) = filter.customer_phone.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            condition = condition.add(order::Column::CustomerPhone.contains(phone));
        }
        if let Some(from) = filter.created_from {
            condition = condition.add(order::Column::CreatedAt.gte(from));
        }
        if let Some(to) = filter.created_to {
            condition = condition.add(order::Column::CreatedAt.lte(to));
        }

        let paginator = order::Entity::find()
            .filter(condition)
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::OrderNumber)
            .paginate(self.db_pool.as_ref(), per_page);

        let total = paginator.num_items().await.map_err(|e| {
            error!(error = %e, "Failed to count orders");
            ServiceError::DatabaseError(e)
        })?;
        let items = paginator.fetch_page(page - 1).await.map_err(|e| {
            error!(error = %e, page, per_page, "Failed to fetch orders page");
            ServiceError::DatabaseError(e)
        })?;

        info!(total, page, per_page, returned_count = items.len(), "Orders listed");
        Ok(Page {
            items,
            total,
            page,
            per_page,
        })
    }

    /// Validates an OCR transcription against the order and applies the
    /// decision.
    pub async fn process_payment_proof(
        &self,
        order_id: Uuid,
        raw_text: &str,
    ) -> Result<ProofOutcome, ServiceError> {
        self.process_payment_proof_at(order_id, raw_text, Utc::now()).await
    }

    /// Same as [`Self::process_payment_proof`] with an explicit clock.
    pub async fn process_payment_proof_at(
        &self,
        order_id: Uuid,
        raw_text: &str,
        now: DateTime<Utc>,
    ) -> Result<ProofOutcome, ServiceError> {
        self.run_proof(order_id, raw_text, None, now).await
    }

    /// Stores the receipt image, transcribes it and processes the text.
    #[instrument(skip(self, image), fields(order_id = %order_id, file = %image.file_name))]
    pub async fn process_payment_proof_image(
        &self,
        order_id: Uuid,
        image: ProofImage,
    ) -> Result<ProofOutcome, ServiceError> {
        let (ocr, storage) = match (&self.ocr, &self.storage) {
            (Some(ocr), Some(storage)) => (ocr.clone(), storage.clone()),
            _ => {
                return Err(ServiceError::InternalError(
                    "OCR and storage collaborators are not configured".to_string(),
                ))
            }
        };
        image.validate()?;

        let current = self.get_order(order_id).await?;
        if current.status() != OrderStatus::Pending {
            return Err(ServiceError::Conflict(format!(
                "payment proofs can only be uploaded for pending orders; order {} is {}",
                current.order.order_number,
                current.status()
            )));
        }

        let reference = storage.upload(&image).await?;
        info!(order_id = %order_id, %reference, "Payment proof stored");

        let text = match ocr.extract_text(&image).await {
            Ok(text) => text,
            Err(e) => {
                self.discard_proof(storage.as_ref(), &reference).await;
                return Err(e);
            }
        };

        match self
            .run_proof(order_id, &text, Some(reference.clone()), Utc::now())
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.discard_proof(storage.as_ref(), &reference).await;
                Err(e)
            }
        }
    }

    /// Administrator confirmation with an operation number read off the proof
    /// by hand.
    #[instrument(skip(self))]
    pub async fn validate_proof_manually(
        &self,
        order_id: Uuid,
        operation_number: &str,
    ) -> Result<OrderWithItems, ServiceError> {
        let current = self.get_order(order_id).await?;
        if current.status() != OrderStatus::Pending {
            return Err(ServiceError::Conflict(format!(
                "order {} is {} and cannot be validated",
                current.order.order_number,
                current.status()
            )));
        }

        SetOrderStatusCommand::new(order_id, OrderStatus::Confirmed)
            .with_operation_number(operation_number)
            .with_note("Payment proof validated manually by administrator")
            .execute(self.db_pool.clone(), self.event_sender.clone())
            .await
    }

    /// Administrative transition. Confirming requires `operation_number`.
    #[instrument(skip(self))]
    pub async fn set_order_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        operation_number: Option<String>,
    ) -> Result<OrderWithItems, ServiceError> {
        let mut command = SetOrderStatusCommand::new(order_id, new_status);
        command.operation_number = operation_number;
        command
            .execute(self.db_pool.clone(), self.event_sender.clone())
            .await
    }

    /// Deletes an order, restocking it first when Confirmed. The stored proof
    /// image is removed on a best-effort basis.
    #[instrument(skip(self))]
    pub async fn delete_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let deleted = DeleteOrderCommand { order_id }
            .execute(self.db_pool.clone(), self.event_sender.clone())
            .await?;

        if let (Some(storage), Some(reference)) =
            (&self.storage, deleted.order.payment_proof_ref.as_deref())
        {
            self.discard_proof(storage.as_ref(), reference).await;
        }

        Ok(deleted)
    }

    async fn run_proof(
        &self,
        order_id: Uuid,
        raw_text: &str,
        payment_proof_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ProofOutcome, ServiceError> {
        let db = self.db_pool.as_ref();
        let current = load_order_with_items(db, order_id).await?;
        let facts = self.parser.parse(raw_text);

        let bound = match facts.operation_number.as_deref() {
            Some(operation_number) => find_bound_operation(db, operation_number, order_id)
                .await?
                .map(|owner| BoundOperation::from(&owner)),
            None => None,
        };

        let decision = self
            .validator
            .validate(&facts, &current.order, |_| bound, now);
        let note = self.decision_note(&decision, &facts);

        let order = ApplyProofDecisionCommand {
            order_id,
            decision: decision.clone(),
            note,
            payment_proof_ref,
        }
        .execute(self.db_pool.clone(), self.event_sender.clone())
        .await?;

        Ok(ProofOutcome {
            order,
            decision,
            facts,
        })
    }

    fn decision_note(&self, decision: &ValidationDecision, facts: &ReceiptFacts) -> String {
        match decision {
            ValidationDecision::Accept { .. } => format!(
                "Payment proof validated automatically. Date/time: {}",
                facts.date_time.as_deref().unwrap_or("not found")
            ),
            ValidationDecision::Reject { reason } => match self.payment().rejection_policy {
                RejectionPolicy::Strict => format!(
                    "Payment proof rejected: {}. Extracted text: {}",
                    reason, facts.raw_text
                ),
                RejectionPolicy::ManualReview => format!(
                    "Payment proof uploaded but could not be validated automatically ({}). Requires manual review. Extracted text: {}",
                    reason, facts.raw_text
                ),
            },
        }
    }

    async fn discard_proof(&self, storage: &dyn ObjectStorage, reference: &str) {
        if let Err(e) = storage.delete(reference).await {
            warn!(%reference, error = %e, "Failed to delete stored payment proof");
        }
    }
}
