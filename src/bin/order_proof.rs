use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use order_proof::{
    config::{self, AppConfig},
    db,
    entities::{order, OrderStatus},
    events,
    services::{
        orders::{OrderFilter, OrderService},
        receipt_parser::{ReceiptFacts, ReceiptParser},
        receipt_validator::{ReceiptValidator, ValidationDecision},
    },
};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "order-proof", about = "Payment-proof validation and order fulfillment", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the facts extracted from a receipt transcription
    Parse {
        /// Text file with the OCR output
        file: PathBuf,
    },
    /// Run the validation rules for a receipt against an order total
    Check(CheckArgs),
    /// Apply pending database migrations
    Migrate,
    #[command(subcommand)]
    Orders(OrdersCommands),
}

#[derive(Args)]
struct CheckArgs {
    file: PathBuf,
    /// Expected order total
    #[arg(long)]
    total: Decimal,
    /// Evaluation time (RFC 3339); defaults to now
    #[arg(long)]
    now: Option<DateTime<Utc>>,
}

#[derive(Subcommand)]
enum OrdersCommands {
    /// List orders, newest first
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 20)]
        per_page: u64,
    },
    /// Show an order with its items
    Show { id: Uuid },
    /// Process a payment proof from its OCR transcription
    Proof {
        id: Uuid,
        /// Text file with the OCR output
        file: PathBuf,
    },
    /// Confirm an order with an operation number read by an administrator
    Validate { id: Uuid, operation_number: String },
    /// Change an order status
    Status {
        id: Uuid,
        status: String,
        #[arg(long)]
        operation_number: Option<String>,
    },
    /// Delete an order, restocking it when confirmed
    Delete { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    match cli.command {
        Commands::Parse { file } => {
            let text = read_text(&file)?;
            let facts = ReceiptParser::new(cfg.payment.payment_marker.clone()).parse(&text);
            print_json(&facts)
        }
        Commands::Check(args) => check(&cfg, args),
        Commands::Migrate => {
            let pool = db::establish_connection_from_app_config(&cfg).await?;
            db::run_migrations(&pool).await?;
            println!("Migrations applied");
            Ok(())
        }
        Commands::Orders(command) => handle_orders_command(&cfg, command).await,
    }
}

fn check(cfg: &AppConfig, args: CheckArgs) -> Result<()> {
    let text = read_text(&args.file)?;
    let facts = ReceiptParser::new(cfg.payment.payment_marker.clone()).parse(&text);
    let now = args.now.unwrap_or_else(Utc::now);

    let probe = order::Model {
        id: Uuid::nil(),
        order_number: "CHECK".to_string(),
        customer_name: String::new(),
        customer_phone: String::new(),
        customer_email: None,
        customer_address: None,
        customer_city: None,
        payment_method: None,
        total: args.total,
        status: OrderStatus::Pending,
        operation_number: None,
        payment_proof_ref: None,
        notes: None,
        created_at: now,
        updated_at: None,
        version: 1,
    };

    let decision = ReceiptValidator::new(cfg.payment.clone()).validate(&facts, &probe, |_| None, now);

    #[derive(Serialize)]
    struct Report<'a> {
        facts: &'a ReceiptFacts,
        decision: &'a ValidationDecision,
        message: Option<String>,
    }
    print_json(&Report {
        facts: &facts,
        decision: &decision,
        message: decision.reject_reason().map(ToString::to_string),
    })
}

async fn handle_orders_command(cfg: &AppConfig, command: OrdersCommands) -> Result<()> {
    let pool = db::establish_connection_from_app_config(cfg).await?;
    if cfg.auto_migrate {
        db::run_migrations(&pool).await?;
    }

    let (sender, receiver) = events::channel(cfg.event_channel_capacity);
    let consumer = tokio::spawn(events::process_events(receiver));

    // Image proofs need durable object storage, which this binary does not
    // configure; it takes transcriptions only.
    let service = OrderService::new(Arc::new(pool), Some(Arc::new(sender)), cfg.payment.clone());

    let result = run_orders_command(&service, command).await;

    drop(service);
    consumer.await.context("event consumer stopped unexpectedly")?;
    result
}

async fn run_orders_command(service: &OrderService, command: OrdersCommands) -> Result<()> {
    match command {
        OrdersCommands::List {
            status,
            phone,
            page,
            per_page,
        } => {
            let status = status.as_deref().map(parse_status).transpose()?;
            let filter = OrderFilter {
                status,
                customer_phone: phone,
                ..Default::default()
            };
            print_json(&service.list_orders(filter, page, per_page).await?)
        }
        OrdersCommands::Show { id } => print_json(&service.get_order(id).await?),
        OrdersCommands::Proof { id, file } => {
            print_json(&service.process_payment_proof(id, &read_text(&file)?).await?)
        }
        OrdersCommands::Validate {
            id,
            operation_number,
        } => print_json(&service.validate_proof_manually(id, &operation_number).await?),
        OrdersCommands::Status {
            id,
            status,
            operation_number,
        } => {
            let status = parse_status(&status)?;
            print_json(&service.set_order_status(id, status, operation_number).await?)
        }
        OrdersCommands::Delete { id } => print_json(&service.delete_order(id).await?),
    }
}

fn parse_status(raw: &str) -> Result<OrderStatus> {
    OrderStatus::from_str(raw).map_err(|_| anyhow!("unknown order status '{}'", raw))
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
