use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    path::PathBuf,
};

use anyhow::{Result, anyhow};
use clap::Parser;
use itertools::Itertools;
use tracing::*;
use tracing_subscriber::EnvFilter;
use xnft::{
    account::Signer,
    cfg::{NftDialect, read_config},
    fake::FakeNetwork,
    ledger::Ledger,
    registry,
    token::Collection,
    transfer,
};

/// Brings up a simulated relay chain and its parachains, connects the parachains to each other and registers their
/// currencies with one another.
#[derive(Parser, Debug)]
struct Args {
    #[clap(long, short, default_values = ["workshop.toml"])]
    config_file: Vec<PathBuf>,
    #[clap(long, default_value = "false")]
    log_json: bool,
    /// Also send an NFT from a foreign-assets ledger to an xnft ledger and back.
    #[clap(long, default_value = "false")]
    round_trip: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.log_json);
    log_panics();

    let config = read_config(&args.config_file)?;
    if config.parachains.len() < 2 {
        return Err(anyhow!("at least two parachains must be configured"));
    }
    let sudo = Signer::from_uri(
        config
            .accounts
            .first()
            .ok_or_else(|| anyhow!("at least one account must be configured"))?,
    );

    let network = FakeNetwork::start(&config)?;
    let relay = network.relay().await?;
    let parachains = network.parachains().await?;

    relay.wait_for_parachains_start().await?;

    for (first, second) in parachains.iter().tuple_combinations() {
        let (Some(a), Some(b)) = (first.para_id(), second.para_id()) else {
            return Err(anyhow!("{} and {} must both have a parachain ID", first.name(), second.name()));
        };
        relay.force_open_hrmp_duplex(&sudo, a, b).await?;
    }

    for (ledger, other) in parachains.iter().cartesian_product(&parachains) {
        if ledger.name() == other.name() || ledger.nft().is_err() {
            continue;
        }
        registry::register_foreign_currency(ledger, &sudo, other.native_currency()).await?;
    }
    info!(parachains = %parachains.iter().map(Ledger::name).join(", "), "workshop is ready");

    if args.round_trip {
        round_trip(&config.accounts, &parachains).await?;
    }

    Ok(())
}

/// Sends a freshly minted NFT from the first foreign-assets ledger to the first xnft ledger and back again.
async fn round_trip(accounts: &[String], parachains: &[Ledger]) -> Result<()> {
    let dialect = |ledger: &&Ledger, dialect| ledger.nft().is_ok_and(|nft| nft.dialect == dialect);
    let reserve = parachains
        .iter()
        .find(|l| dialect(l, NftDialect::ForeignAssets))
        .ok_or_else(|| anyhow!("no foreign-assets ledger is configured"))?;
    let other = parachains
        .iter()
        .find(|l| dialect(l, NftDialect::Xnft))
        .ok_or_else(|| anyhow!("no xnft ledger is configured"))?;
    let [alice, bob] = [0, 1].map(|i| accounts.get(i).map(|uri| Signer::from_uri(uri)));
    let (Some(alice), Some(bob)) = (alice, bob) else {
        return Err(anyhow!("the round trip needs two accounts"));
    };

    let collection = Collection::create(reserve, &alice).await?;
    let token = collection.mint(&alice, alice.account()).await?;
    registry::register_foreign_asset(other, &alice, &token.asset_id()?, "xNFT round trip").await?;

    let fee = reserve.native_currency().as_multiasset(1)?;
    let derivative = transfer::transfer(reserve, &alice, &token, fee, other, bob.account()).await?;
    info!(%token, %derivative, "NFT arrived");

    let fee = other.native_currency().as_multiasset(1)?;
    transfer::transfer(other, &bob, &token, fee, reserve, alice.account()).await?;
    info!(%token, "NFT is back home");
    Ok(())
}

fn init_logging(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .with_ansi(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Records panics as `tracing` events at the `ERROR` level, so they reach the same sink as the rest of the run.
fn log_panics() {
    std::panic::set_hook(Box::new(|panic| {
        let message = panic_message(panic.payload());
        let thread = std::thread::current();
        let location = panic.location();
        let backtrace = Backtrace::capture();
        let backtrace = (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());

        error!(
            thread_name = thread.name().unwrap_or("<unnamed>"),
            message,
            panic.file = location.map(|l| l.file()),
            panic.line = location.map(|l| l.line()),
            panic.column = location.map(|l| l.column()),
            backtrace,
        );
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>")
}
