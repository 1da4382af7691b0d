//! OCR collaborator: turns a receipt screenshot into raw text.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use tracing::{error, info, instrument};

use crate::config::OcrConfig;
use crate::errors::ServiceError;

/// OCR.space rejects uploads above this size.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// An uploaded receipt image.
#[derive(Clone, Debug)]
pub struct ProofImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ProofImage {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }

    /// Image subtype inferred from the file extension; `jpeg` when unknown.
    pub fn format(&self) -> &'static str {
        let extension = self
            .file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "png" => "png",
            "gif" => "gif",
            "bmp" => "bmp",
            "tif" | "tiff" => "tiff",
            _ => "jpeg",
        }
    }

    pub fn content_type(&self) -> String {
        format!("image/{}", self.format())
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.bytes.is_empty() {
            return Err(ServiceError::ValidationError(
                "The payment proof image is required".to_string(),
            ));
        }
        if self.bytes.len() > MAX_IMAGE_BYTES {
            return Err(ServiceError::ValidationError(
                "The payment proof image must not exceed 5MB".to_string(),
            ));
        }
        Ok(())
    }

    fn data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type(),
            STANDARD.encode(&self.bytes)
        )
    }
}

#[async_trait]
pub trait OcrClient: Send + Sync {
    /// Returns the recognized text. Failures are transient and surfaced as
    /// `ExternalServiceError`.
    async fn extract_text(&self, image: &ProofImage) -> Result<String, ServiceError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OcrSpaceResponse {
    #[serde(default)]
    parsed_results: Option<Vec<OcrSpaceParsedResult>>,
    #[serde(default)]
    is_errored_on_processing: bool,
    #[serde(default)]
    error_message: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OcrSpaceParsedResult {
    #[serde(default)]
    parsed_text: String,
}

fn error_message_text(value: Option<serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(message)) => message,
        Some(serde_json::Value::Array(messages)) => messages
            .iter()
            .filter_map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join("; "),
        _ => "unknown error".to_string(),
    }
}

/// Client for the OCR.space `parse/image` endpoint.
#[derive(Clone, Debug)]
pub struct OcrSpaceClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OcrSpaceClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("Failed to build OCR client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    /// Builds a client from configuration; `None` when no API key is set.
    pub fn from_config(config: &OcrConfig) -> Result<Option<Self>, ServiceError> {
        match config.api_key.as_deref().filter(|key| !key.is_empty()) {
            Some(key) => Ok(Some(Self::new(
                config.endpoint.clone(),
                key,
                Duration::from_secs(config.timeout_secs),
            )?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OcrClient for OcrSpaceClient {
    #[instrument(skip(self, image), fields(file = %image.file_name, bytes = image.bytes.len()))]
    async fn extract_text(&self, image: &ProofImage) -> Result<String, ServiceError> {
        image.validate()?;

        let form = [
            ("base64Image", image.data_uri()),
            ("language", "spa".to_string()),
            ("isOverlayRequired", "false".to_string()),
            ("detectOrientation", "true".to_string()),
            ("scale", "true".to_string()),
            ("OCREngine", "2".to_string()),
        ];

        let response = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "OCR request failed");
                ServiceError::ExternalServiceError(format!("OCR request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            error!(%status, "OCR service returned an error status");
            return Err(ServiceError::ExternalServiceError(format!(
                "OCR service returned status {}",
                status
            )));
        }

        let body: OcrSpaceResponse = response.json().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!("Invalid OCR response: {}", e))
        })?;

        if body.is_errored_on_processing {
            let message = error_message_text(body.error_message);
            error!(%message, "OCR processing failed");
            return Err(ServiceError::ExternalServiceError(format!(
                "OCR processing failed: {}",
                message
            )));
        }

        let text = body
            .parsed_results
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|result| result.parsed_text)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::ExternalServiceError(
                    "No text could be extracted from the image".to_string(),
                )
            })?;

        info!(chars = text.len(), "OCR text extracted");
        Ok(text)
    }
}
