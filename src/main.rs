use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vpn_checkout::application::checkout::PurchaseRequest;
use vpn_checkout::application::engine::PaymentEngine;
use vpn_checkout::config::Config;
use vpn_checkout::domain::payment::{Intent, PaymentId, PaymentMethod, PaymentStatus, UserId};
use vpn_checkout::domain::ports::{AccountServiceRef, KeyStoreRef, PaymentStoreRef};
use vpn_checkout::infrastructure::in_memory::{InMemoryKeyStore, InMemoryPaymentStore};
use vpn_checkout::infrastructure::marzban::MarzbanClient;
use vpn_checkout::infrastructure::providers::{ProviderRegistry, http_client};
#[cfg(feature = "storage-rocksdb")]
use vpn_checkout::infrastructure::rocksdb::RocksDBStore;
use vpn_checkout::interfaces::csv::payment_writer::PaymentWriter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the payment methods currently enabled
    Methods,
    /// Create a payment and print the invoice
    Checkout {
        #[arg(long)]
        user: UserId,
        /// new, renew or key
        #[arg(long)]
        intent: Intent,
        #[arg(long)]
        amount: Decimal,
        #[arg(long, default_value_t = 1)]
        months: u32,
        /// Subscription to extend (renewals only)
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        method: PaymentMethod,
    },
    /// Verify one payment with its processor and fulfill or reject it
    Check { id: PaymentId },
    /// Re-check every pending payment
    Reconcile {
        /// Keep running, sweeping every N seconds
        #[arg(long)]
        every: Option<u64>,
    },
    /// Print one payment record as JSON
    Show { id: PaymentId },
    /// Print payments as CSV
    List {
        #[arg(long)]
        status: Option<PaymentStatus>,
    },
    /// Print counts per status and approved revenue
    Stats,
    /// Redeem an activation key
    Redeem {
        code: String,
        #[arg(long)]
        user: UserId,
        /// Existing subscription to extend instead of opening a new one
        #[arg(long)]
        account: Option<String>,
    },
    /// Issue an activation key
    IssueKey {
        #[arg(long)]
        months: u32,
        #[arg(long, default_value_t = 1)]
        uses: u32,
    },
}

fn open_stores(db_path: Option<PathBuf>) -> Result<(PaymentStoreRef, KeyStoreRef)> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(db_path) = db_path {
        let store = RocksDBStore::open(db_path).into_diagnostic()?;
        return Ok((Arc::new(store.clone()), Arc::new(store)));
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    if db_path.is_some() {
        tracing::warn!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }

    Ok((
        Arc::new(InMemoryPaymentStore::new()),
        Arc::new(InMemoryKeyStore::new()),
    ))
}

async fn reconcile_once(engine: &PaymentEngine) -> Result<()> {
    for (id, outcome) in engine.reconcile().await.into_diagnostic()? {
        match outcome {
            Ok(reply) => println!("#{id}: {reply}"),
            Err(e) => eprintln!("#{id}: {e}"),
        }
    }
    Ok(())
}

/// One pass of the `--every` loop. A failed pass is logged and the loop goes on.
async fn sweep(engine: &PaymentEngine) -> bool {
    match reconcile_once(engine).await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Reconciliation sweep failed");
            false
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().into_diagnostic()?;

    let (store, keys) = open_stores(cli.db_path)?;
    let marzban = MarzbanClient::new(
        http_client(config.http_timeout).into_diagnostic()?,
        &config.account_service,
    );
    let accounts: AccountServiceRef = Arc::new(marzban.clone());
    let providers = ProviderRegistry::from_config(&config).into_diagnostic()?;
    let engine = PaymentEngine::new(store, keys, accounts, providers, config.fulfillment_lease);

    match cli.command {
        Command::Methods => {
            for method in engine.available_methods() {
                println!("{}\t{}", method, method.display_name());
            }
        }
        Command::Checkout {
            user,
            intent,
            amount,
            months,
            target,
            method,
        } => {
            let request = PurchaseRequest {
                user_id: user,
                intent,
                amount,
                duration_months: months,
                target_account: target,
            };
            let reply = engine.checkout(request, method).await.into_diagnostic()?;
            println!("{reply}");
        }
        Command::Check { id } => {
            let reply = engine.check(id).await.into_diagnostic()?;
            println!("{reply}");
        }
        Command::Reconcile { every: None } => reconcile_once(&engine).await?,
        Command::Reconcile { every: Some(secs) } => {
            let _refresher = marzban.spawn_token_refresher();
            let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
            info!(every = secs, "Reconciling until interrupted");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&engine).await;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutting down");
                        break;
                    }
                }
            }
        }
        Command::Show { id } => {
            let record = engine.payment(id).await.into_diagnostic()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&record).into_diagnostic()?
            );
        }
        Command::List { status } => {
            let records = engine.list(status).await.into_diagnostic()?;
            let stdout = io::stdout();
            let mut writer = PaymentWriter::new(stdout.lock());
            writer.write_payments(&records).into_diagnostic()?;
        }
        Command::Stats => {
            let summary = engine.summary().await.into_diagnostic()?;
            println!("total: {}", summary.total());
            println!("pending: {}", summary.pending);
            println!("approved: {}", summary.approved);
            println!("rejected: {}", summary.rejected);
            println!("revenue: {}", summary.revenue);
        }
        Command::Redeem {
            code,
            user,
            account,
        } => {
            let reply = engine
                .redeem(&code, user, account.as_deref())
                .await
                .into_diagnostic()?;
            println!("{reply}");
        }
        Command::IssueKey { months, uses } => {
            let key = engine.issue_key(months, uses).await.into_diagnostic()?;
            println!("{}", key.code);
        }
    }

    Ok(())
}
