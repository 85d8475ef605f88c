//! Unitflow Development Runner
//!
//! Loads configuration, wires a manager with the built-in lifetime hooks and
//! runs scripted scenarios against in-memory features:
//! - nested scopes (join and suppress)
//! - an independent `RequiresNew` scope inside a failing parent
//! - a commit failure after the first feature committed
//! - soft deletion and audit stamping through the standard pipeline

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::{error, info, warn};

use uf_config::{ConfigLoader, UnitflowConfig};
use uf_uow::{
    standard_pipeline, CancellationToken, EventEnvelope, ExecutionContext, FeaturePhase,
    InMemoryFeature, TracingDispatcher, TrackedEntity, UnitOfWorkManager, UnitOfWorkOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Nested,
    RequiresNew,
    PartialCommit,
    Pipeline,
    All,
}

/// Unitflow Development Runner
#[derive(Parser, Debug)]
#[command(name = "uf-dev")]
#[command(about = "Run unit-of-work scenarios against in-memory features")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "UNITFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Scenario to run
    #[arg(long, value_enum, default_value = "all")]
    scenario: Scenario,

    /// Principal the flow runs as
    #[arg(long, env = "UNITFLOW_PRINCIPAL", default_value = "dev-user")]
    principal: String,

    /// Print an example configuration file and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_example_config {
        println!("{}", UnitflowConfig::example_toml());
        return Ok(());
    }

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("loading configuration")?;
    uf_common::logging::init_logging_with("uf-dev", config.logging.format, &config.logging.level);

    let pipeline = standard_pipeline(&config.pipeline, Arc::new(TracingDispatcher)).build();
    info!(
        pre_save = ?pipeline.pre_save_names(),
        post_save = ?pipeline.post_save_names(),
        operations = config.operations.len(),
        "Starting Unitflow dev runner"
    );
    let manager = UnitOfWorkManager::from_config(&config, pipeline)?;

    let scenarios = match args.scenario {
        Scenario::All => vec![
            Scenario::Nested,
            Scenario::RequiresNew,
            Scenario::PartialCommit,
            Scenario::Pipeline,
        ],
        one => vec![one],
    };

    let mut failed = 0;
    for scenario in scenarios {
        let ctx = ExecutionContext::create(args.principal.as_str());
        let outcome = manager
            .flow(ctx, run_scenario(&manager, scenario))
            .await;
        match outcome {
            Ok(()) => info!(?scenario, "Scenario finished"),
            Err(e) => {
                failed += 1;
                error!(?scenario, error = %e, "Scenario failed");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} scenario(s) failed");
    }
    Ok(())
}

async fn run_scenario(manager: &UnitOfWorkManager, scenario: Scenario) -> Result<()> {
    match scenario {
        Scenario::Nested => nested(manager).await,
        Scenario::RequiresNew => requires_new(manager).await,
        Scenario::PartialCommit => partial_commit(manager).await,
        Scenario::Pipeline => pipeline(manager).await,
        Scenario::All => Ok(()),
    }
}

/// Outer scope with F1, a suppressed block with F2, a joined block with F3.
/// One commit each for F1 and F3, nothing for F2.
async fn nested(manager: &UnitOfWorkManager) -> Result<()> {
    let cancel = CancellationToken::new();
    let f1 = InMemoryFeature::new("F1");
    let f2 = InMemoryFeature::new("F2");
    let f3 = InMemoryFeature::new("F3");

    let mut a = manager.create(UnitOfWorkOptions::required())?;
    a.enlist("F1", f1.clone()).await?;

    let mut b = manager.create(UnitOfWorkOptions::suppress())?;
    b.enlist("F2", f2.clone()).await?;
    b.dispose().await?;

    let mut c = manager.create(UnitOfWorkOptions::required())?;
    c.enlist("F3", f3.clone()).await?;
    c.save_changes(&cancel).await?;
    c.dispose().await?;

    a.save_changes(&cancel).await?;
    a.dispose().await?;

    info!(
        f1_committed = f1.was_committed(),
        f2_calls = f2.calls().len(),
        f3_committed = f3.was_committed(),
        "Nested scopes committed"
    );
    Ok(())
}

/// The child's audit record survives although the parent rolls back.
async fn requires_new(manager: &UnitOfWorkManager) -> Result<()> {
    let cancel = CancellationToken::new();
    let orders = InMemoryFeature::new("orders");
    let audit = InMemoryFeature::new("audit");

    let mut parent = manager.create(UnitOfWorkOptions::required())?;
    parent.track(
        "orders",
        orders.clone(),
        TrackedEntity::added("Order", "o-1", json!({ "total": 120 })),
    )?;

    let mut child = manager.create(UnitOfWorkOptions::requires_new())?;
    child.track(
        "audit",
        audit.clone(),
        TrackedEntity::added("AuditLog", "a-1", json!({ "operation": "PlaceOrder" })),
    )?;
    child.save_changes(&cancel).await?;
    child.dispose().await?;

    // Parent is abandoned: disposing without saving rolls it back
    parent.dispose().await?;

    info!(
        audit_rows = audit.committed_entities().len(),
        order_rows = orders.committed_entities().len(),
        "Independent scope committed inside a rolled back parent"
    );
    Ok(())
}

/// The second commit fails after the first succeeded.
async fn partial_commit(manager: &UnitOfWorkManager) -> Result<()> {
    let cancel = CancellationToken::new();
    let ledger = InMemoryFeature::new("ledger");
    let search = InMemoryFeature::new("search-index");
    search.fail_on(FeaturePhase::Commit);

    let mut handle = manager.create(UnitOfWorkOptions::required())?;
    handle.enlist("ledger", ledger.clone()).await?;
    handle.enlist("search-index", search.clone()).await?;

    match handle.save_changes(&cancel).await {
        Ok(()) => warn!("Expected a partial completion"),
        Err(e) if e.is_partial() => {
            info!(error = %e, code = e.code(), state = ?handle.state(), "Partial completion reported")
        }
        Err(e) => return Err(e.into()),
    }
    handle.dispose().await?;
    Ok(())
}

/// Audit stamps, soft deletion and events through the configured pipeline.
async fn pipeline(manager: &UnitOfWorkManager) -> Result<()> {
    let cancel = CancellationToken::new();
    let db = InMemoryFeature::new("db");

    let mut handle = manager.create_for("orders.place")?;
    handle.track(
        "db",
        db.clone(),
        TrackedEntity::added("Order", "o-2", json!({ "total": 42 })).with_domain_event(
            EventEnvelope::new("shop:orders:order:placed", "orders.order.o-2", json!({ "total": 42 })),
        ),
    )?;
    handle.track("db", db.clone(), TrackedEntity::deleted("Customer", "c-9"))?;
    handle.save_changes(&cancel).await?;
    handle.dispose().await?;

    for entity in db.committed_entities() {
        info!(
            entity = %entity.label(),
            state = %entity.state,
            data = %entity.data,
            "Persisted"
        );
    }
    Ok(())
}
