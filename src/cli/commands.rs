//! CLI command implementations

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dialoguer::Confirm;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::listener::{LoggingListener, LoggingSubscriber};
use crate::amount::Amount;
use crate::config::Config;
use crate::engine::simulated::SimulatedEngine;
use crate::manager::WalletManager;
use crate::system::{DispatchingListener, System, SystemListener};
use crate::transfer::{ReplaceOptions, Transfer, TransferState};
use crate::wallet::Wallet;

const FAUCET_AMOUNT: &str = "0.5";
const SEND_AMOUNT: &str = "0.1";
const BLOCK_INTERVAL: Duration = Duration::from_millis(250);

/// Run a scripted session against the simulated engine
pub async fn simulate(config: &Config, blocks: u64, paper_key: &str, yes: bool) -> Result<()> {
    info!("Starting simulation over {} networks", config.networks.len());

    let logger = Arc::new(LoggingListener::default());
    let (listener, consumer) = DispatchingListener::spawn(
        logger.clone() as Arc<dyn SystemListener>,
        config.dispatch.channel_capacity,
        config.dispatch.drop_policy.into(),
    );
    let engine = Arc::new(SimulatedEngine::new());
    let system = System::from_config(
        config,
        engine.clone(),
        &listener,
        Some(Arc::new(LoggingSubscriber)),
    );

    let mut managers = Vec::new();
    for network in system.networks() {
        let manager = system
            .create_wallet_manager(&network, config.manager.default_mode)
            .with_context(|| format!("Failed to create wallet manager for {}", network))?;
        managers.push(manager);
    }
    system.process_pending();

    if config.manager.connect_on_start {
        system.start();
        system.process_pending();
        for manager in &managers {
            manager.sync();
        }
        system.process_pending();
    }

    for manager in &managers {
        let wallet = manager
            .primary_wallet()
            .with_context(|| format!("{} has no primary wallet", manager.handle()))?;
        fund(&system, &engine, &wallet)?;

        let Some(transfer) = send(&system, manager, &wallet, paper_key, yes)? else {
            continue;
        };
        if transfer.state() == TransferState::Submitted {
            replace(&system, &engine, manager, &wallet, &transfer, paper_key)?;
        }
    }

    // Let blocks arrive through the event loop
    let cancel = CancellationToken::new();
    let pump = tokio::spawn({
        let system = system.clone();
        let cancel = cancel.clone();
        async move { system.run(cancel).await }
    });
    let mut interval = tokio::time::interval(BLOCK_INTERVAL);
    for _ in 0..blocks {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping block production");
                break;
            }
            _ = interval.tick() => {
                for manager in &managers {
                    engine.advance_height(manager.handle(), manager.height() + 1);
                }
            }
        }
    }
    // Give the loop a moment to drain the last blocks
    tokio::time::sleep(BLOCK_INTERVAL).await;
    cancel.cancel();
    pump.await.context("Event loop task failed")?;
    system.process_pending();

    print_summary(&system);

    system.stop();
    system.process_pending();
    listener.close();
    consumer.await.context("Dispatch task failed")?;
    info!(
        "Simulation finished: {} events, {} dropped",
        logger.count(),
        listener.dropped_count()
    );
    Ok(())
}

/// Receive funds from a faucet and include them at the current height
fn fund(system: &System, engine: &SimulatedEngine, wallet: &Arc<Wallet>) -> Result<()> {
    let amount = Amount::create_string(FAUCET_AMOUNT, wallet.unit())
        .with_context(|| format!("Invalid faucet amount for {}", wallet.name()))?;
    let from = SimulatedEngine::counterparty(wallet.network(), "faucet");
    let handle = engine
        .receive(wallet.handle(), &from, amount.value())
        .with_context(|| format!("Engine refused to fund {}", wallet))?;
    engine.include(
        handle,
        wallet.network().height(),
        0,
        chrono::Utc::now().timestamp().max(0) as u64,
    );
    system.process_pending();
    info!("Funded {} with {}", wallet, amount);
    Ok(())
}

/// Build, confirm and submit a payment to a merchant
fn send(
    system: &System,
    manager: &Arc<WalletManager>,
    wallet: &Arc<Wallet>,
    paper_key: &str,
    yes: bool,
) -> Result<Option<Arc<Transfer>>> {
    let amount = Amount::create_string(SEND_AMOUNT, wallet.unit())
        .with_context(|| format!("Invalid send amount for {}", wallet.name()))?;
    let target = SimulatedEngine::counterparty(wallet.network(), "merchant");
    let fee = wallet.estimate_fee(&amount, None);

    let Some(transfer) = wallet.create_transfer(&target, &amount, None) else {
        warn!("{} could not build a transfer of {} to {}", wallet, amount, target);
        return Ok(None);
    };
    system.process_pending();

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Send {} to {} (fee {})? This cannot be undone.",
                amount, target, fee
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cancelled.");
            return Ok(None);
        }
    }

    manager.submit(&transfer, paper_key);
    system.process_pending();
    info!("{} is {}", transfer.handle(), transfer.state());
    Ok(Some(transfer))
}

/// Speed up `original` with a higher fee and include the replacement
fn replace(
    system: &System,
    engine: &SimulatedEngine,
    manager: &Arc<WalletManager>,
    wallet: &Arc<Wallet>,
    original: &Arc<Transfer>,
    paper_key: &str,
) -> Result<()> {
    let options = ReplaceOptions {
        update_gas_price: true,
        ..ReplaceOptions::default()
    };
    let Some(replacement) = wallet.create_transfer_to_replace(original, options) else {
        warn!("{} could not be replaced", original.handle());
        return Ok(());
    };
    system.process_pending();
    manager.submit(&replacement, paper_key);
    system.process_pending();

    engine.include(
        replacement.handle(),
        manager.height(),
        1,
        chrono::Utc::now().timestamp().max(0) as u64,
    );
    system.process_pending();
    info!(
        "{} replaced by {} ({})",
        original.handle(),
        replacement.handle(),
        original.state()
    );
    Ok(())
}

fn print_summary(system: &System) {
    println!("\n=== WALLETS ===\n");
    for manager in system.managers() {
        println!(
            "{} [{}] height {}",
            manager.network(),
            manager.state(),
            manager.height()
        );
        for wallet in manager.wallets() {
            println!(
                "  {} {} balance {}",
                wallet.handle(),
                wallet.source().map(|a| a.to_string()).unwrap_or_default(),
                wallet.balance()
            );
            for transfer in wallet.transfers() {
                println!(
                    "    {} {:<9} {:>24} fee {} confirmations {}",
                    transfer.handle(),
                    transfer.state().name(),
                    transfer.directed_amount().to_string(),
                    transfer.fee(),
                    transfer
                        .confirmations()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".into())
                );
            }
        }
    }
}

/// List the configured networks
pub fn networks(config: &Config) -> Result<()> {
    println!("\n=== NETWORKS ===\n");
    for network in &config.networks {
        let built = network.build();
        let currency = built.currency();
        println!(
            "{:<20} {:<18} {:<8} {} ({}), units {} / {} ({} decimals), final after {}",
            built.uids(),
            built.name(),
            if built.is_mainnet() { "mainnet" } else { "testnet" },
            currency.name(),
            currency.code(),
            network.base_unit,
            network.default_unit,
            network.decimals,
            built.confirmations_until_final()
        );
    }
    Ok(())
}

/// Show current configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.summary());
    Ok(())
}
