use alloy_primitives::{Address, B256, hex};
use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use dn_amount::{format_optional, format_smallest_unit};
use dn_chain_client::TxReceipt;
use dn_chain_memory::InMemoryChain;
use dn_chain_rpc::{DEFAULT_RPC_URL, JsonRpcChain};
use dn_core::{Capabilities, ConfigError, DappConfig, DonationDapp, TracingNotifier};
use dn_types::{ChainId, EventKind, EventRecord, short_address};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "donation-cli",
    version,
    about = "Inspect and interact with the charity donation contract"
)]
struct Cli {
    /// JSON-RPC endpoint of the wallet node.
    #[arg(long, env = "DONATION_RPC_URL", default_value = DEFAULT_RPC_URL, value_name = "URL")]
    rpc_url: String,

    /// Interval for receipt, log and account polling.
    #[arg(long, env = "DONATION_POLL_MS", default_value_t = 1_000, value_name = "MS")]
    poll_ms: u64,

    /// Run against a seeded in-process chain instead of a node.
    #[arg(long)]
    simulate: bool,

    /// Print machine-readable output.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the connection, contract totals and charity list.
    Status,
    /// Donate to a charity (the selected one by default).
    Donate {
        #[arg(long, value_name = "ETH")]
        amount: String,
        #[arg(long, value_name = "ADDRESS")]
        charity: Option<String>,
    },
    /// Owner only: move funds out of the contract.
    Withdraw {
        #[arg(long, value_name = "ADDRESS")]
        to: String,
        #[arg(long, value_name = "ETH")]
        amount: String,
    },
    /// Follow contract events until interrupted.
    Watch,
}

#[derive(Debug, Serialize)]
struct CharityView {
    address: Address,
    name: String,
    allocated: String,
    selected: bool,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    status: String,
    account: Option<Address>,
    chain_id: Option<ChainId>,
    owner: Address,
    is_owner: bool,
    min_donation: String,
    total_donated: String,
    my_donated: String,
    contract_balance: String,
    charities: Vec<CharityView>,
}

#[derive(Debug, Serialize)]
struct TxReport {
    kind: &'static str,
    tx_hash: B256,
    block_number: u64,
}

#[derive(Debug, Serialize)]
struct EventView {
    kind: String,
    actor: Address,
    amount: String,
    tx_hash: B256,
}

impl From<&EventRecord> for EventView {
    fn from(record: &EventRecord) -> Self {
        Self {
            kind: record.kind.to_string(),
            actor: record.actor,
            amount: format_smallest_unit(record.amount_wei),
            tx_hash: record.tx_hash,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let dapp = Arc::new(build_dapp(&cli)?);

    let outcome = run(&cli, &dapp).await;
    dapp.shutdown().await;
    outcome
}

fn build_dapp(cli: &Cli) -> anyhow::Result<DonationDapp> {
    let notifier = Arc::new(TracingNotifier);

    if cli.simulate {
        let config = simulate_config(DappConfig::from_env()).context("loading simulate configuration")?;
        info!(chain_id = %config.required_chain_id, "using simulated chain");
        let chain = InMemoryChain::demo(config.required_chain_id);
        return Ok(DonationDapp::new(config, Capabilities::from_chain(chain), notifier));
    }

    let config = DappConfig::from_env().context("loading donation contract configuration")?;
    let chain = JsonRpcChain::new(Some(cli.rpc_url.clone()), config.contract_address)
        .with_poll_interval(Duration::from_millis(cli.poll_ms));
    info!(
        endpoint = chain.endpoint(),
        contract = %config.contract_address,
        chain_id = %config.required_chain_id,
        "using json-rpc chain"
    );
    Ok(DonationDapp::new(config, Capabilities::from_chain(chain), notifier))
}

/// Unset variables fall back to a fixed demo contract; malformed ones are
/// still an error.
fn simulate_config(loaded: Result<DappConfig, ConfigError>) -> Result<DappConfig, ConfigError> {
    match loaded {
        Err(ConfigError::MissingVar(_)) => Ok(DappConfig {
            contract_address: Address::repeat_byte(0xdc),
            required_chain_id: ChainId(1),
        }),
        other => other,
    }
}

async fn run(cli: &Cli, dapp: &Arc<DonationDapp>) -> anyhow::Result<()> {
    match &cli.command {
        Command::Status => {
            // a failed connect still leaves a status worth printing
            if let Err(err) = dapp.connect().await {
                warn!("connect failed: {err}");
            }
            print_status(dapp, cli.json).await
        }
        Command::Donate { amount, charity } => {
            dapp.connect().await?;
            let receipt = match charity {
                Some(charity) => dapp.donate(charity, amount).await?,
                None => dapp.donate_to_selected(amount).await?,
            };
            print_receipt("donate", &receipt, cli.json)
        }
        Command::Withdraw { to, amount } => {
            dapp.connect().await?;
            let receipt = dapp.withdraw(to, amount).await?;
            print_receipt("withdraw", &receipt, cli.json)
        }
        Command::Watch => watch(dapp, cli).await,
    }
}

async fn print_status(dapp: &DonationDapp, json: bool) -> anyhow::Result<()> {
    let state = dapp.session().state().await;
    let snapshot = dapp.snapshot().await;
    let selected = dapp.selected_charity().await;
    let report = StatusReport {
        status: dapp.session().status_text().await,
        account: state.account,
        chain_id: state.chain_id,
        owner: snapshot.owner,
        is_owner: dapp.is_owner().await,
        min_donation: format_smallest_unit(snapshot.min_donation_wei),
        total_donated: format_smallest_unit(snapshot.total_donated_wei),
        my_donated: format_smallest_unit(snapshot.my_donated_wei),
        contract_balance: format_smallest_unit(snapshot.contract_balance_wei),
        charities: dapp
            .charities()
            .await
            .into_iter()
            .map(|entity| CharityView {
                selected: Some(entity.address) == selected,
                address: entity.address,
                name: entity.name,
                allocated: format_optional(entity.allocated_wei),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Status:           {}", report.status);
    if let Some(account) = report.account {
        println!("Account:          {}", account.to_checksum(None));
    }
    println!("Owner:            {}", short_address(&report.owner));
    println!("Minimum donation: {} ETH", report.min_donation);
    println!("Total donated:    {} ETH", report.total_donated);
    println!("You donated:      {} ETH", report.my_donated);
    println!("Contract balance: {} ETH", report.contract_balance);
    println!("Charities:");
    for charity in &report.charities {
        let marker = if charity.selected { "*" } else { " " };
        println!(
            " {marker} {:<24} {}  {} ETH",
            charity.name,
            charity.address.to_checksum(None),
            charity.allocated
        );
    }
    Ok(())
}

fn print_receipt(kind: &'static str, receipt: &TxReceipt, json: bool) -> anyhow::Result<()> {
    let report = TxReport {
        kind,
        tx_hash: receipt.tx_hash,
        block_number: receipt.block_number,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{kind} confirmed in block {}: {}",
            report.block_number,
            hex::encode_prefixed(report.tx_hash)
        );
    }
    Ok(())
}

async fn watch(dapp: &Arc<DonationDapp>, cli: &Cli) -> anyhow::Result<()> {
    let Some(mut notifications) = dapp.subscribe_notifications() else {
        bail!("no wallet provider available");
    };
    if let Err(err) = dapp.connect().await {
        warn!("connect failed: {err}; waiting for the wallet to change");
    }

    let mut last_printed = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(cli.poll_ms.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping watch");
                return Ok(());
            }
            notification = notifications.recv() => {
                let Some(notification) = notification else {
                    bail!("wallet provider went away");
                };
                dapp.handle_notification(notification).await;
                last_printed = None;
                if let Err(err) = dapp.connect().await {
                    warn!("reconnect failed: {err}");
                }
            }
            _ = ticker.tick() => {
                let entries = dapp.events().await;
                for record in unseen_events(&entries, last_printed) {
                    print_event(record, cli.json)?;
                }
                if let Some(newest) = entries.first() {
                    last_printed = Some((newest.kind, newest.tx_hash));
                }
            }
        }
    }
}

/// Entries newer than `last_printed`, oldest first. `entries` is the
/// newest-first event log; if the marker has been evicted every entry is new.
fn unseen_events(
    entries: &[EventRecord],
    last_printed: Option<(EventKind, B256)>,
) -> impl Iterator<Item = &EventRecord> {
    let fresh = entries
        .iter()
        .position(|record| Some((record.kind, record.tx_hash)) == last_printed)
        .unwrap_or(entries.len());
    entries[..fresh].iter().rev()
}

fn print_event(record: &EventRecord, json: bool) -> anyhow::Result<()> {
    let view = EventView::from(record);
    if json {
        println!("{}", serde_json::to_string(&view)?);
    } else {
        println!(
            "{:<9} {} {} ETH  {}",
            view.kind,
            short_address(&view.actor),
            view.amount,
            hex::encode_prefixed(view.tx_hash)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    fn record(kind: EventKind, n: u8) -> EventRecord {
        EventRecord {
            kind,
            actor: Address::repeat_byte(n),
            amount_wei: U256::from(n),
            tx_hash: B256::repeat_byte(n),
        }
    }

    fn hashes<'a>(records: impl Iterator<Item = &'a EventRecord>) -> Vec<B256> {
        records.map(|record| record.tx_hash).collect()
    }

    #[test]
    fn simulate_falls_back_only_when_variables_are_unset() {
        let config = simulate_config(Err(ConfigError::MissingVar("DONATION_CONTRACT_ADDRESS"))).unwrap();
        assert_eq!(config.required_chain_id, ChainId(1));

        let err = simulate_config(DappConfig::parse("0x1234", "1")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidContractAddress(_)));

        let explicit = DappConfig::parse(&Address::repeat_byte(0x42).to_checksum(None), "5").unwrap();
        let config = simulate_config(Ok(explicit)).unwrap();
        assert_eq!(config.required_chain_id, ChainId(5));
    }

    #[test]
    fn watch_prints_only_entries_newer_than_the_marker() {
        // newest first, like the event log
        let entries = vec![
            record(EventKind::Withdrawn, 3),
            record(EventKind::Donated, 2),
            record(EventKind::Donated, 1),
        ];

        assert_eq!(
            hashes(unseen_events(&entries, None)),
            vec![B256::repeat_byte(1), B256::repeat_byte(2), B256::repeat_byte(3)]
        );
        assert_eq!(
            hashes(unseen_events(&entries, Some((EventKind::Donated, B256::repeat_byte(1))))),
            vec![B256::repeat_byte(2), B256::repeat_byte(3)]
        );
        assert!(unseen_events(&entries, Some((EventKind::Withdrawn, B256::repeat_byte(3)))).next().is_none());

        // marker already evicted from the log
        assert_eq!(
            hashes(unseen_events(&entries, Some((EventKind::Donated, B256::repeat_byte(9))))).len(),
            3
        );
    }
}
