use alloy_primitives::U256;
use dn_amount::AmountError;
use dn_types::{ChainId, TxKind};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DappError {
    #[error("no wallet provider detected")]
    NoWalletProvider,
    #[error("wallet connection was declined")]
    UserDeclinedConnection,
    #[error("wrong network (need {required}, got {actual})")]
    WrongNetwork { required: ChainId, actual: ChainId },
    #[error("invalid amount: {0}")]
    InvalidAmountFormat(String),
    #[error("donation too small: {amount} wei is below the minimum of {minimum} wei")]
    BelowMinimumDonation { minimum: U256, amount: U256 },
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("only the contract owner can withdraw")]
    NotOwner,
    #[error("wallet is not connected to the required network")]
    NotConnectedOrWrongNetwork,
    #[error("a {0} transaction is already awaiting confirmation")]
    TransactionInFlight(TxKind),
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    #[error("refresh failed: {0}")]
    RefreshFailed(String),
    #[error("wallet provider error: {0}")]
    ProviderFailed(String),
}

impl From<AmountError> for DappError {
    fn from(err: AmountError) -> Self {
        match err {
            AmountError::InvalidFormat(reason) => DappError::InvalidAmountFormat(reason),
        }
    }
}
