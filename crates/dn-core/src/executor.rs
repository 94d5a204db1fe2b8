use crate::aggregator::ContractStateAggregator;
use crate::error::DappError;
use crate::notify::{Notice, NoticeLevel, Notifier};
use crate::session::Identity;
use alloy_primitives::{Address, U256, hex};
use dn_amount::{format_smallest_unit, parse_display_amount};
use dn_chain_client::{ContractWriter, PendingTransaction, TxReceipt};
use dn_types::{TxKind, parse_address};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// A validated write, ready to be signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionRequest {
    pub kind: TxKind,
    pub amount: U256,
    /// Charity for a donation, recipient for a withdrawal.
    pub target: Address,
}

struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool, kind: TxKind) -> Result<Self, DappError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DappError::TransactionInFlight(kind))?;
        Ok(Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct TransactionExecutor {
    writer: Arc<dyn ContractWriter>,
    aggregator: Arc<ContractStateAggregator>,
    notifier: Arc<dyn Notifier>,
    donate_in_flight: AtomicBool,
    withdraw_in_flight: AtomicBool,
}

impl TransactionExecutor {
    pub fn new(
        writer: Arc<dyn ContractWriter>,
        aggregator: Arc<ContractStateAggregator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            writer,
            aggregator,
            notifier,
            donate_in_flight: AtomicBool::new(false),
            withdraw_in_flight: AtomicBool::new(false),
        }
    }

    pub fn in_flight(&self, kind: TxKind) -> bool {
        self.flag(kind).load(Ordering::Acquire)
    }

    /// Validates and submits a payable donation to `charity`, then waits for
    /// one confirmation.
    pub async fn donate(
        &self,
        identity: &Identity,
        charity: &str,
        amount: &str,
    ) -> Result<TxReceipt, DappError> {
        let amount = positive_amount(amount)?;
        let minimum = self.aggregator.snapshot().await.min_donation_wei;
        if !minimum.is_zero() && amount < minimum {
            return Err(DappError::BelowMinimumDonation { minimum, amount });
        }
        let target = parse_address(charity).ok_or_else(|| DappError::InvalidAddress(charity.to_owned()))?;

        self.execute(
            identity,
            TransactionRequest {
                kind: TxKind::Donate,
                amount,
                target,
            },
        )
        .await
    }

    /// Owner-only transfer of `amount` from the contract to `recipient`.
    pub async fn withdraw(
        &self,
        identity: &Identity,
        recipient: &str,
        amount: &str,
    ) -> Result<TxReceipt, DappError> {
        if !self.aggregator.is_owner(identity.account).await {
            return Err(DappError::NotOwner);
        }
        let target =
            parse_address(recipient).ok_or_else(|| DappError::InvalidAddress(recipient.to_owned()))?;
        let amount = positive_amount(amount)?;

        self.execute(
            identity,
            TransactionRequest {
                kind: TxKind::Withdraw,
                amount,
                target,
            },
        )
        .await
    }

    async fn execute(
        &self,
        identity: &Identity,
        request: TransactionRequest,
    ) -> Result<TxReceipt, DappError> {
        let guard = InFlightGuard::acquire(self.flag(request.kind), request.kind)?;
        let key = request.kind.as_str();
        let epoch = self.aggregator.epoch();

        let outcome = self.submit_and_confirm(identity, &request).await;
        drop(guard);

        match outcome {
            Ok(receipt) => {
                info!(
                    kind = %request.kind,
                    tx_hash = %hex::encode_prefixed(receipt.tx_hash),
                    block = receipt.block_number,
                    "transaction confirmed"
                );
                self.notifier.notify(Notice::keyed(
                    key,
                    NoticeLevel::Success,
                    format!("{} confirmed", label(request.kind)),
                ));
                if self.aggregator.epoch() != epoch {
                    info!(kind = %request.kind, "wallet identity changed while confirming; refresh skipped");
                } else if let Err(err) = self.aggregator.refresh_all_at(identity, epoch).await {
                    self.notifier.notify(Notice::new(
                        NoticeLevel::Warning,
                        format!("{} confirmed but data refresh failed: {err}", label(request.kind)),
                    ));
                }
                Ok(receipt)
            }
            Err(cause) => {
                warn!(kind = %request.kind, "transaction failed: {cause}");
                self.notifier.notify(Notice::keyed(
                    key,
                    NoticeLevel::Error,
                    format!("{} failed: {cause}", label(request.kind)),
                ));
                Err(DappError::TransactionFailed(cause))
            }
        }
    }

    async fn submit_and_confirm(
        &self,
        identity: &Identity,
        request: &TransactionRequest,
    ) -> Result<TxReceipt, String> {
        let pending: Box<dyn PendingTransaction> = match request.kind {
            TxKind::Donate => {
                self.writer
                    .donate_to_charity(identity.account, request.target, request.amount)
                    .await
            }
            TxKind::Withdraw => {
                self.writer
                    .withdraw(identity.account, request.target, request.amount)
                    .await
            }
        }
        .map_err(|err| err.to_string())?;

        let tx_hash = hex::encode_prefixed(pending.tx_hash());
        info!(
            kind = %request.kind,
            %tx_hash,
            amount = %format_smallest_unit(request.amount),
            target = %request.target,
            "transaction submitted"
        );
        self.notifier.notify(Notice::keyed(
            request.kind.as_str(),
            NoticeLevel::Loading,
            format!("{} pending ({tx_hash})", label(request.kind)),
        ));

        pending.wait().await.map_err(|err| err.to_string())
    }

    fn flag(&self, kind: TxKind) -> &AtomicBool {
        match kind {
            TxKind::Donate => &self.donate_in_flight,
            TxKind::Withdraw => &self.withdraw_in_flight,
        }
    }
}

fn positive_amount(input: &str) -> Result<U256, DappError> {
    let amount = parse_display_amount(input)?;
    if amount.is_zero() {
        return Err(DappError::InvalidAmountFormat(format!(
            "{:?} must be greater than zero",
            input.trim()
        )));
    }
    Ok(amount)
}

fn label(kind: TxKind) -> &'static str {
    match kind {
        TxKind::Donate => "Donation",
        TxKind::Withdraw => "Withdrawal",
    }
}
