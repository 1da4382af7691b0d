use std::time::Duration;

use assert_matches::assert_matches;
use order_proof::{
    services::ocr::{OcrClient, OcrSpaceClient, ProofImage},
    ServiceError,
};
use serde_json::json;
use wiremock::{
    matchers::{body_string_contains, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn client_for(server: &MockServer) -> OcrSpaceClient {
    OcrSpaceClient::new(
        format!("{}/parse/image", server.uri()),
        "test-key",
        Duration::from_secs(5),
    )
    .expect("build OCR client")
}

fn image() -> ProofImage {
    ProofImage::new("yape.png", vec![0x89, 0x50, 0x4e, 0x47])
}

#[tokio::test]
async fn returns_the_first_parsed_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/parse/image"))
        .and(header("apikey", "test-key"))
        .and(body_string_contains("language=spa"))
        .and(body_string_contains("OCREngine=2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ParsedResults": [
                { "ParsedText": "¡Yapeaste!\r\nS/ 45.00\r\n" },
                { "ParsedText": "second page" }
            ],
            "IsErroredOnProcessing": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let text = client_for(&server).extract_text(&image()).await.unwrap();
    assert_eq!(text, "¡Yapeaste!\r\nS/ 45.00\r\n");
}

#[tokio::test]
async fn processing_errors_surface_the_service_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/parse/image"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ParsedResults": null,
            "IsErroredOnProcessing": true,
            "ErrorMessage": ["Unable to recognize the file type"]
        })))
        .mount(&server)
        .await;

    let result = client_for(&server).extract_text(&image()).await;
    assert_matches!(
        result,
        Err(ServiceError::ExternalServiceError(msg)) if msg.contains("Unable to recognize the file type")
    );
}

#[tokio::test]
async fn blank_text_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/parse/image"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ParsedResults": [{ "ParsedText": "  \r\n" }],
            "IsErroredOnProcessing": false
        })))
        .mount(&server)
        .await;

    let result = client_for(&server).extract_text(&image()).await;
    assert_matches!(result, Err(ServiceError::ExternalServiceError(_)));
}

#[tokio::test]
async fn error_status_is_an_external_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/parse/image"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = client_for(&server).extract_text(&image()).await;
    assert_matches!(result, Err(ServiceError::ExternalServiceError(msg)) if msg.contains("500"));
}

#[tokio::test]
async fn empty_images_never_reach_the_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let result = client_for(&server)
        .extract_text(&ProofImage::new("yape.png", Vec::new()))
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}
