use alloy_primitives::{Address, B256, U256, hex};
use alloy_sol_types::{SolCall, SolEvent, sol};
use async_trait::async_trait;
use dn_chain_client::{
    ChainError, ChainResult, ContractEvent, ContractEvents, ContractReader, ContractWriter,
    PendingTransaction, ProviderNotification, Subscription, TxReceipt, WalletProvider,
};
use dn_types::ChainId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_RPC_URL: &str = "http://localhost:8545";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// EIP-1193 code for a request the user refused in their wallet.
const USER_REJECTED_CODE: i64 = 4001;
/// JSON-RPC code most nodes use for an `eth_call` that reverted.
const EXECUTION_REVERTED_CODE: i64 = 3;

sol! {
    #[derive(Debug)]
    interface CharityDonation {
        function owner() external view returns (address);
        function minDonationWei() external view returns (uint256);
        function totalDonated() external view returns (uint256);
        function donatedBy(address account) external view returns (uint256);
        function charitiesCount() external view returns (uint256);
        function charities(uint256 index) external view returns (address);
        function charityName(address charity) external view returns (string);
        function charityBalanceWei(address charity) external view returns (uint256);
        function donateToCharity(address charity) external payable;
        function withdraw(address to, uint256 amount) external;

        event Donated(address indexed donor, uint256 amount);
        event Withdrawn(address indexed recipient, uint256 amount);
    }
}

// Deployments that emit the actor as a data word instead of a topic. Same
// signatures, so same topic0.
sol! {
    interface UnindexedEvents {
        event Donated(address donor, uint256 amount);
        event Withdrawn(address recipient, uint256 amount);
    }
}

/// Donation contract and node-managed wallet over Ethereum JSON-RPC.
///
/// Reads `DONATION_RPC_URL` from environment at construction time
/// (default: `http://localhost:8545`). Signing is delegated to the node
/// (`eth_sendTransaction`), which suits dev nodes with unlocked accounts.
#[derive(Clone)]
pub struct JsonRpcChain {
    endpoint: String,
    contract: Address,
    http: reqwest::Client,
    poll_interval: Duration,
    request_id: Arc<AtomicU64>,
}

impl JsonRpcChain {
    pub fn new(endpoint: Option<String>, contract: Address) -> Self {
        let endpoint = endpoint
            .or_else(|| std::env::var("DONATION_RPC_URL").ok())
            .unwrap_or_else(|| DEFAULT_RPC_URL.to_string());
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            contract,
            http: reqwest::Client::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Interval for receipt, log and identity polling.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request_optional<T: DeserializeOwned>(&self, method: &str, params: Value) -> ChainResult<Option<T>> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        debug!(method, id, "json-rpc request");

        let body = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| ChainError::Rpc(format!("{method} transport: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChainError::Rpc(format!("{method} HTTP {status}: {text}")));
        }

        let envelope: RpcResponse<T> = response
            .json()
            .await
            .map_err(|err| ChainError::Rpc(format!("{method} parse: {err}")))?;

        if let Some(error) = envelope.error {
            return Err(map_rpc_error(method, error));
        }
        Ok(envelope.result)
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> ChainResult<T> {
        self.request_optional(method, params)
            .await?
            .ok_or_else(|| ChainError::Rpc(format!("{method} returned no result")))
    }

    /// `eth_call` against the contract, decoding the return data as `C`'s
    /// return type.
    async fn call<C: SolCall>(&self, call: C) -> ChainResult<C::Return> {
        let params = json!([
            {
                "to": self.contract.to_checksum(None),
                "data": hex::encode_prefixed(call.abi_encode()),
            },
            "latest"
        ]);

        let result: String = self.request("eth_call", params).await.map_err(|err| match err {
            ChainError::Rpc(message) => ChainError::CallFailed(format!("{}: {message}", C::SIGNATURE)),
            other => other,
        })?;
        decode_returns::<C>(&decode_hex(&result)?)
    }

    async fn block_number(&self) -> ChainResult<u64> {
        let result: String = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity_u64(&result)
    }

    async fn accounts(&self) -> ChainResult<Vec<Address>> {
        let raw: Vec<String> = self.request("eth_accounts", json!([])).await?;
        parse_accounts(&raw)
    }

    async fn send_transaction(&self, from: Address, value: U256, data: Vec<u8>) -> ChainResult<Box<dyn PendingTransaction>> {
        let params = json!([{
            "from": from.to_checksum(None),
            "to": self.contract.to_checksum(None),
            "value": format!("0x{value:x}"),
            "data": hex::encode_prefixed(&data),
        }]);

        let raw: String = self.request("eth_sendTransaction", params).await?;
        let tx_hash: B256 = raw
            .parse()
            .map_err(|_| ChainError::Rpc(format!("eth_sendTransaction returned invalid hash {raw:?}")))?;
        debug!(%tx_hash, "transaction submitted");

        Ok(Box::new(RpcPendingTx {
            chain: self.clone(),
            tx_hash,
        }))
    }

    /// Both event kinds in one query, in chain order.
    async fn fetch_logs(&self, from_block: u64, to_block: u64) -> ChainResult<Vec<ContractEvent>> {
        let params = json!([{
            "address": self.contract.to_checksum(None),
            "topics": [[
                hex::encode_prefixed(CharityDonation::Donated::SIGNATURE_HASH),
                hex::encode_prefixed(CharityDonation::Withdrawn::SIGNATURE_HASH),
            ]],
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
        }]);

        let mut logs: Vec<LogResponse> = self.request("eth_getLogs", params).await?;
        logs.sort_by_key(LogResponse::position);
        Ok(logs.iter().filter_map(decode_rpc_log).collect())
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReceiptResponse {
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogResponse {
    topics: Vec<String>,
    data: String,
    #[serde(rename = "transactionHash")]
    transaction_hash: Option<String>,
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
    #[serde(rename = "logIndex")]
    log_index: Option<String>,
}

impl LogResponse {
    /// Chain position; entries missing either field sort last.
    fn position(&self) -> (u64, u64) {
        let quantity = |raw: &Option<String>| {
            raw.as_deref()
                .and_then(|raw| parse_quantity_u64(raw).ok())
                .unwrap_or(u64::MAX)
        };
        (quantity(&self.block_number), quantity(&self.log_index))
    }
}

fn map_rpc_error(method: &str, error: RpcErrorObject) -> ChainError {
    match error.code {
        USER_REJECTED_CODE => ChainError::UserRejected,
        EXECUTION_REVERTED_CODE => ChainError::CallFailed(error.message),
        code => ChainError::Rpc(format!("{method}: {} (code {code})", error.message)),
    }
}

fn decode_hex(raw: &str) -> ChainResult<Vec<u8>> {
    hex::decode(raw).map_err(|err| ChainError::Rpc(format!("invalid hex payload: {err}")))
}

fn parse_quantity_u64(raw: &str) -> ChainResult<u64> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|_| ChainError::Rpc(format!("invalid quantity {raw:?}")))
}

fn parse_quantity_u256(raw: &str) -> ChainResult<U256> {
    U256::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|_| ChainError::Rpc(format!("invalid quantity {raw:?}")))
}

fn parse_accounts(raw: &[String]) -> ChainResult<Vec<Address>> {
    raw.iter()
        .map(|account| {
            account
                .parse::<Address>()
                .map_err(|_| ChainError::Rpc(format!("invalid account {account:?}")))
        })
        .collect()
}

fn decode_returns<C: SolCall>(data: &[u8]) -> ChainResult<C::Return> {
    C::abi_decode_returns(data, true).map_err(|err| ChainError::CallFailed(format!("{}: {err}", C::SIGNATURE)))
}

/// Decodes one `eth_getLogs` entry. Logs that cannot be attributed to a
/// transaction or do not match either event are skipped.
fn decode_rpc_log(log: &LogResponse) -> Option<ContractEvent> {
    let Some(tx_hash) = log.transaction_hash.as_deref().and_then(|raw| raw.parse::<B256>().ok()) else {
        warn!(topics = ?log.topics, "skipping log without a transaction hash");
        return None;
    };
    let topics = match log
        .topics
        .iter()
        .map(|topic| topic.parse::<B256>())
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(topics) => topics,
        Err(err) => {
            warn!(%tx_hash, "skipping log with malformed topic: {err}");
            return None;
        }
    };
    let data = match hex::decode(&log.data) {
        Ok(data) => data,
        Err(err) => {
            warn!(%tx_hash, "skipping log with malformed data: {err}");
            return None;
        }
    };

    match decode_event(&topics, &data, tx_hash) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(%tx_hash, "skipping undecodable log: {err}");
            None
        }
    }
}

fn decode_event(topics: &[B256], data: &[u8], tx_hash: B256) -> Result<ContractEvent, alloy_sol_types::Error> {
    let topic0 = topics.first().copied().unwrap_or_default();
    let topics = topics.iter().copied();

    if topic0 == CharityDonation::Donated::SIGNATURE_HASH {
        let (donor, amount) = match CharityDonation::Donated::decode_raw_log(topics.clone(), data, true) {
            Ok(event) => (event.donor, event.amount),
            Err(_) => {
                let event = UnindexedEvents::Donated::decode_raw_log(topics, data, true)?;
                (event.donor, event.amount)
            }
        };
        Ok(ContractEvent::Donated { donor, amount, tx_hash })
    } else if topic0 == CharityDonation::Withdrawn::SIGNATURE_HASH {
        let (recipient, amount) = match CharityDonation::Withdrawn::decode_raw_log(topics.clone(), data, true) {
            Ok(event) => (event.recipient, event.amount),
            Err(_) => {
                let event = UnindexedEvents::Withdrawn::decode_raw_log(topics, data, true)?;
                (event.recipient, event.amount)
            }
        };
        Ok(ContractEvent::Withdrawn {
            recipient,
            amount,
            tx_hash,
        })
    } else {
        Err(alloy_sol_types::Error::custom(format!("unknown event topic {topic0}")))
    }
}

struct RpcPendingTx {
    chain: JsonRpcChain,
    tx_hash: B256,
}

#[async_trait]
impl PendingTransaction for RpcPendingTx {
    fn tx_hash(&self) -> B256 {
        self.tx_hash
    }

    async fn wait(&self) -> ChainResult<TxReceipt> {
        loop {
            let receipt: Option<ReceiptResponse> = self
                .chain
                .request_optional("eth_getTransactionReceipt", json!([hex::encode_prefixed(self.tx_hash)]))
                .await?;

            if let Some(receipt) = receipt {
                if let Some(block) = receipt.block_number.as_deref() {
                    let block_number = parse_quantity_u64(block)?;
                    return match receipt.status.as_deref() {
                        Some("0x1") | None => Ok(TxReceipt {
                            tx_hash: self.tx_hash,
                            block_number,
                        }),
                        Some(_) => Err(ChainError::Reverted(format!(
                            "transaction {} reverted in block {block_number}",
                            self.tx_hash
                        ))),
                    };
                }
            }

            tokio::time::sleep(self.chain.poll_interval).await;
        }
    }
}

#[async_trait]
impl WalletProvider for JsonRpcChain {
    async fn request_accounts(&self) -> ChainResult<Vec<Address>> {
        match self.request::<Vec<String>>("eth_requestAccounts", json!([])).await {
            Ok(raw) => parse_accounts(&raw),
            // plain nodes do not implement the EIP-1102 method
            Err(ChainError::Rpc(message)) => {
                debug!("eth_requestAccounts unavailable ({message}); using eth_accounts");
                self.accounts().await
            }
            Err(err) => Err(err),
        }
    }

    async fn chain_id(&self) -> ChainResult<ChainId> {
        let raw: String = self.request("eth_chainId", json!([])).await?;
        parse_quantity_u64(&raw).map(ChainId)
    }

    async fn signer(&self) -> ChainResult<Address> {
        self.accounts()
            .await?
            .first()
            .copied()
            .ok_or_else(|| ChainError::Rpc("node exposes no unlocked account".to_owned()))
    }

    fn subscribe_notifications(&self) -> Subscription<ProviderNotification> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let chain = self.clone();

        let handle = tokio::spawn(async move {
            let mut last_chain = chain.chain_id().await.ok();
            let mut last_accounts = chain.accounts().await.ok();

            loop {
                tokio::time::sleep(chain.poll_interval).await;

                match chain.chain_id().await {
                    Ok(current) if last_chain != Some(current) => {
                        last_chain = Some(current);
                        if sender.send(ProviderNotification::ChainChanged(current)).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!("chain id poll failed: {err}"),
                }

                match chain.accounts().await {
                    Ok(current) if last_accounts.as_ref() != Some(&current) => {
                        last_accounts = Some(current.clone());
                        if sender.send(ProviderNotification::AccountsChanged(current)).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!("accounts poll failed: {err}"),
                }
            }
        });

        Subscription::new(receiver, move || handle.abort())
    }
}

#[async_trait]
impl ContractReader for JsonRpcChain {
    async fn owner(&self) -> ChainResult<Address> {
        Ok(self.call(CharityDonation::ownerCall {}).await?._0)
    }

    async fn min_donation_wei(&self) -> ChainResult<U256> {
        Ok(self.call(CharityDonation::minDonationWeiCall {}).await?._0)
    }

    async fn total_donated(&self) -> ChainResult<U256> {
        Ok(self.call(CharityDonation::totalDonatedCall {}).await?._0)
    }

    async fn donated_by(&self, account: Address) -> ChainResult<U256> {
        Ok(self.call(CharityDonation::donatedByCall { account }).await?._0)
    }

    async fn charities_count(&self) -> ChainResult<u64> {
        let count = self.call(CharityDonation::charitiesCountCall {}).await?._0;
        u64::try_from(count).map_err(|_| {
            ChainError::CallFailed(format!("{}: count {count} out of range", CharityDonation::charitiesCountCall::SIGNATURE))
        })
    }

    async fn charity_at(&self, index: u64) -> ChainResult<Address> {
        let call = CharityDonation::charitiesCall {
            index: U256::from(index),
        };
        Ok(self.call(call).await?._0)
    }

    async fn charity_name(&self, charity: Address) -> ChainResult<String> {
        Ok(self.call(CharityDonation::charityNameCall { charity }).await?._0)
    }

    async fn charity_balance_wei(&self, charity: Address) -> ChainResult<U256> {
        Ok(self.call(CharityDonation::charityBalanceWeiCall { charity }).await?._0)
    }

    async fn contract_balance(&self) -> ChainResult<U256> {
        let raw: String = self
            .request("eth_getBalance", json!([self.contract.to_checksum(None), "latest"]))
            .await?;
        parse_quantity_u256(&raw)
    }
}

#[async_trait]
impl ContractWriter for JsonRpcChain {
    async fn donate_to_charity(
        &self,
        from: Address,
        charity: Address,
        value: U256,
    ) -> ChainResult<Box<dyn PendingTransaction>> {
        let data = CharityDonation::donateToCharityCall { charity }.abi_encode();
        self.send_transaction(from, value, data).await
    }

    async fn withdraw(
        &self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> ChainResult<Box<dyn PendingTransaction>> {
        let data = CharityDonation::withdrawCall { to, amount }.abi_encode();
        self.send_transaction(from, U256::ZERO, data).await
    }
}

#[async_trait]
impl ContractEvents for JsonRpcChain {
    async fn subscribe_events(&self) -> ChainResult<Subscription<ContractEvent>> {
        let start = self.block_number().await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let chain = self.clone();

        let handle = tokio::spawn(async move {
            let mut next_block = start.saturating_add(1);
            loop {
                tokio::time::sleep(chain.poll_interval).await;

                let latest = match chain.block_number().await {
                    Ok(latest) => latest,
                    Err(err) => {
                        warn!("block number poll failed: {err}");
                        continue;
                    }
                };
                if latest < next_block {
                    continue;
                }

                match chain.fetch_logs(next_block, latest).await {
                    Ok(events) => {
                        for event in events {
                            if sender.send(event).is_err() {
                                return;
                            }
                        }
                        next_block = latest + 1;
                    }
                    Err(err) => warn!("contract log poll failed: {err}"),
                }
            }
        });

        Ok(Subscription::new(receiver, move || handle.abort()))
    }
}
