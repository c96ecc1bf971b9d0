//! Simulated page: wallets and consumer libraries loading in arbitrary order.
//!
//! ```text
//! cargo run --example page -- --wallets 3 --consumers 2 --order interleaved
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use wallet_discovery::{
    Announcer, Capability, LocalMedium, ProviderInfo, ProviderRegistry, RegistryConfig,
};

const ICON: &str = "data:image/svg+xml;base64,PHN2ZyB4bWxucz0iaHR0cDovL3d3dy53My5vcmcvMjAwMC9zdmciLz4=";

#[derive(Parser)]
#[clap(name = "page")]
#[clap(about = "Simulate wallet discovery between injected wallets and consumer libraries")]
struct Args {
    /// Number of wallet providers injected into the page
    #[clap(long, default_value = "3")]
    wallets: usize,

    /// Number of consumer libraries discovering wallets
    #[clap(long, default_value = "2")]
    consumers: usize,

    /// Load order of wallets relative to consumers
    #[clap(long, value_enum, default_value = "interleaved")]
    order: LoadOrder,

    /// Inject the first wallet twice (same walletId, different instance)
    #[clap(long)]
    duplicate: bool,

    /// Enable verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum LoadOrder {
    WalletsFirst,
    ConsumersFirst,
    Interleaved,
}

/// What a real wallet would expose to dapps.
#[derive(Debug)]
struct DemoProvider {
    accounts: Vec<String>,
}

fn wallet_info(index: usize) -> ProviderInfo {
    ProviderInfo::new(
        format!("io.demo.wallet{index}"),
        format!("Demo Wallet {index}"),
        ICON,
    )
}

fn spawn_wallet(medium: &Arc<LocalMedium>, index: usize) -> Result<Announcer> {
    let provider = DemoProvider {
        accounts: vec![format!("0x{index:040x}")],
    };
    Announcer::initialize(medium.clone(), wallet_info(index), Capability::new(provider))
        .with_context(|| format!("wallet {index} failed to initialize"))
}

fn spawn_consumer(medium: &Arc<LocalMedium>, index: usize) -> Result<ProviderRegistry> {
    let registry = ProviderRegistry::with_config(medium.clone(), RegistryConfig::default())
        .with_context(|| format!("consumer {index} failed to initialize"))?;
    registry.on_change(move |change| {
        info!(
            consumer = index,
            kind = ?change.kind,
            total = change.providers.len(),
            "provider set changed"
        );
    });
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    let medium = Arc::new(LocalMedium::new());
    let mut wallets = Vec::new();
    let mut consumers = Vec::new();

    match args.order {
        LoadOrder::WalletsFirst => {
            for i in 0..args.wallets {
                wallets.push(spawn_wallet(&medium, i)?);
            }
            for i in 0..args.consumers {
                consumers.push(spawn_consumer(&medium, i)?);
            }
        }
        LoadOrder::ConsumersFirst => {
            for i in 0..args.consumers {
                consumers.push(spawn_consumer(&medium, i)?);
            }
            for i in 0..args.wallets {
                wallets.push(spawn_wallet(&medium, i)?);
            }
        }
        LoadOrder::Interleaved => {
            for i in 0..args.wallets.max(args.consumers) {
                if i < args.wallets {
                    wallets.push(spawn_wallet(&medium, i)?);
                }
                if i < args.consumers {
                    consumers.push(spawn_consumer(&medium, i)?);
                }
            }
        }
    }

    if args.duplicate && args.wallets > 0 {
        info!("injecting a duplicate copy of wallet 0");
        wallets.push(spawn_wallet(&medium, 0)?);
    }

    for (index, registry) in consumers.iter().enumerate() {
        if let Ok(Some(first)) = tokio::time::timeout(Duration::from_millis(100), registry.first()).await {
            info!(consumer = index, wallet = %first.info().name, "first provider available");
        }

        println!("consumer {index}: {} provider(s)", registry.len());
        for record in registry.providers() {
            let accounts = record
                .capability()
                .downcast_ref::<DemoProvider>()
                .map(|p| p.accounts.join(","))
                .unwrap_or_default();
            println!(
                "  {} [{}] instance={} vector_icon={} accounts={}",
                record.info().name,
                record.info().wallet_id,
                record.instance_id(),
                record.info().icon_is_vector(),
                accounts,
            );
        }
    }

    Ok(())
}
