// Payment-proof pipeline
pub mod receipt_parser;
pub mod receipt_validator;

// Stock ledger and order service
pub mod inventory;
pub mod orders;

// External collaborators
pub mod ocr;
pub mod storage;
