//! Draftline CLI - recalculate and save customer order drafts.
//!
//! Drafts are stored as context snapshots, so an unsaved order keeps its
//! change tracking between runs.

use clap::{Parser, Subcommand};
use draftline_client::{ClientError, Config, HttpEndpoint, Orchestrator, RoundTripOutcome, SerdeCodec};
use draftline_engine::{
    presets::{customer_order_schema, CUSTOMER_ORDER},
    ContextSnapshot, Document, Entity, ReconciliationContext,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "draftline", version, about = "Reconcile customer order drafts with the order service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a blank order draft with a pickup and a delivery stop
    New {
        draft: PathBuf,
        /// Make the order a template, which saves its schedules
        #[arg(long)]
        template: bool,
    },
    /// Recalculate the draft without saving it
    Recalculate { draft: PathBuf },
    /// Recalculate and let the server plan transport
    AutoPlan { draft: PathBuf },
    /// Save the draft
    Save { draft: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "draftline=debug,draftline_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::New { draft, template } => {
            let ctx = ReconciliationContext::new_document(customer_order_schema(), blank_order(template))?;
            store(&draft, &ctx).await?;
            tracing::info!(path = %draft.display(), id = %ctx.document().id(), "created draft");
        }
        Command::Recalculate { draft } => run(&draft, Action::Recalculate).await?,
        Command::AutoPlan { draft } => run(&draft, Action::AutoPlan).await?,
        Command::Save { draft } => run(&draft, Action::Save).await?,
    }

    Ok(())
}

enum Action {
    Recalculate,
    AutoPlan,
    Save,
}

fn blank_order(template: bool) -> Document {
    let stop = |order_by: u32| {
        Entity::new(uuid::Uuid::new_v4().to_string(), "Stop").with_scalar("order_by", json!(order_by))
    };
    Document::new(
        Entity::new(uuid::Uuid::new_v4().to_string(), CUSTOMER_ORDER)
            .with_scalar("phase", json!("draft"))
            .with_scalar("is_template", json!(template))
            .with_child("stops", stop(0))
            .with_child("stops", stop(1)),
    )
}

async fn load(path: &Path) -> Result<ReconciliationContext, Box<dyn std::error::Error>> {
    let json = tokio::fs::read_to_string(path).await?;
    let snapshot = ContextSnapshot::from_json(&json)?;
    Ok(ReconciliationContext::restore(customer_order_schema(), snapshot)?)
}

async fn store(path: &Path, ctx: &ReconciliationContext) -> Result<(), Box<dyn std::error::Error>> {
    tokio::fs::write(path, ctx.snapshot().to_json_pretty()?).await?;
    Ok(())
}

async fn run(path: &Path, action: Action) -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let ctx = load(path).await?;
    tracing::info!(endpoint = %config.endpoint_url, id = %ctx.document().id(), "loaded draft");

    let orchestrator = Orchestrator::new(
        ctx,
        HttpEndpoint::from_config(&config)?,
        SerdeCodec,
        config.throttle,
    );

    let result = match action {
        Action::Recalculate => orchestrator.recalculate_now().await,
        Action::AutoPlan => orchestrator.auto_plan().await,
        Action::Save => orchestrator.save().await,
    };

    match &result {
        Ok(RoundTripOutcome::Applied(applied)) => {
            tracing::info!(sequence = applied.round_trip.sequence, "draft updated");
        }
        Ok(outcome) => tracing::info!(?outcome, "nothing applied"),
        Err(ClientError::Validation(errors)) => {
            for error in errors {
                let target = error.entity_id.as_deref().unwrap_or("order");
                let field = error.field.as_deref().unwrap_or("-");
                eprintln!("{target} {field}: {}", error.message);
            }
        }
        Err(_) => {}
    }

    // Validation errors leave the draft as it was; store it either way.
    store(path, &orchestrator.into_context()).await?;
    result?;
    Ok(())
}
