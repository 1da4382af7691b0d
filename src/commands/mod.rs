use crate::{db::DbPool, errors::ServiceError, events::EventSender};
use async_trait::async_trait;
use std::sync::Arc;

/// Command trait for implementing the Command Pattern
///
/// Each command encapsulates one unit of work against the order store,
/// executes it atomically and publishes the resulting domain events.
#[async_trait]
pub trait Command: Send + Sync {
    /// The return type of the command when executed successfully
    type Result;

    /// Execute the command with the given dependencies
    ///
    /// # Arguments
    /// * `db_pool` - Database connection pool for persistence operations
    /// * `event_sender` - Channel to publish domain events, if any listener exists
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Result<Self::Result, ServiceError>;
}

pub mod orders;
