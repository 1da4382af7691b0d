//! Order Proof Library
//!
//! Payment-proof validation and order fulfillment: extraction of payment
//! facts from OCR-transcribed Yape receipts, an ordered anti-fraud rule chain,
//! and an order state machine that keeps product stock consistent with order
//! status under concurrent requests.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod commands;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod services;

pub use errors::ServiceError;
pub use services::orders::{OrderFilter, OrderService, Page, ProofOutcome};
