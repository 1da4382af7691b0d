//! Object-storage collaborator for payment proof images.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::services::ocr::ProofImage;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores the image and returns a public reference to it.
    async fn upload(&self, image: &ProofImage) -> Result<String, ServiceError>;

    /// Removes a stored object. Callers treat failures as best-effort.
    async fn delete(&self, reference: &str) -> Result<(), ServiceError>;
}

/// Process-local storage, used by the CLI and in tests.
#[derive(Debug, Default)]
pub struct InMemoryObjectStorage {
    objects: DashMap<String, ProofImage>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.objects.contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn upload(&self, image: &ProofImage) -> Result<String, ServiceError> {
        let reference = format!("memory://payment-proofs/{}.{}", Uuid::new_v4(), image.format());
        self.objects.insert(reference.clone(), image.clone());
        debug!(%reference, "stored payment proof");
        Ok(reference)
    }

    async fn delete(&self, reference: &str) -> Result<(), ServiceError> {
        self.objects
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound(format!("Object {} not found", reference)))
    }
}
