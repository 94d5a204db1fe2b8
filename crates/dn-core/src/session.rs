use crate::error::DappError;
use alloy_primitives::Address;
use dn_chain_client::{ChainError, ProviderNotification, Subscription, WalletProvider};
use dn_types::ChainId;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    WrongNetwork,
    Failed(String),
}

/// Connected account on the required chain. Only handed out while the
/// session is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub account: Address,
    pub chain_id: ChainId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub status: SessionStatus,
    pub account: Option<Address>,
    pub chain_id: Option<ChainId>,
    generation: u64,
}

impl SessionState {
    fn enabled(&self, required: ChainId) -> bool {
        self.account.is_some() && self.chain_id == Some(required)
    }
}

pub struct WalletSession {
    wallet: Option<Arc<dyn WalletProvider>>,
    required_chain_id: ChainId,
    state: RwLock<SessionState>,
}

impl WalletSession {
    pub fn new(wallet: Option<Arc<dyn WalletProvider>>, required_chain_id: ChainId) -> Self {
        Self {
            wallet,
            required_chain_id,
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn has_provider(&self) -> bool {
        self.wallet.is_some()
    }

    pub fn required_chain_id(&self) -> ChainId {
        self.required_chain_id
    }

    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn enabled(&self) -> bool {
        self.state.read().await.enabled(self.required_chain_id)
    }

    pub async fn identity(&self) -> Option<Identity> {
        let state = self.state.read().await;
        if !state.enabled(self.required_chain_id) {
            return None;
        }
        Some(Identity {
            account: state.account?,
            chain_id: state.chain_id?,
        })
    }

    pub async fn status_text(&self) -> String {
        let state = self.state.read().await;
        match &state.status {
            SessionStatus::Disconnected => "Not connected".to_owned(),
            SessionStatus::Connecting => "Connecting...".to_owned(),
            SessionStatus::Connected => "Connected".to_owned(),
            SessionStatus::WrongNetwork => format!(
                "Wrong network (need {}, got {})",
                self.required_chain_id,
                state
                    .chain_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "unknown".to_owned())
            ),
            SessionStatus::Failed(message) => message.clone(),
        }
    }

    pub fn subscribe_notifications(&self) -> Option<Subscription<ProviderNotification>> {
        self.wallet.as_ref().map(|wallet| wallet.subscribe_notifications())
    }

    /// Requests account access and validates the network. Safe to call again
    /// while connected; the session is re-validated from scratch.
    pub async fn connect(&self) -> Result<Identity, DappError> {
        let Some(wallet) = self.wallet.clone() else {
            let err = DappError::NoWalletProvider;
            self.fail(None, &err).await;
            return Err(err);
        };

        let generation = {
            let mut state = self.state.write().await;
            state.status = SessionStatus::Connecting;
            state.account = None;
            state.generation
        };

        let accounts = match wallet.request_accounts().await {
            Ok(accounts) if !accounts.is_empty() => accounts,
            Ok(_) => return self.abort(generation, DappError::UserDeclinedConnection).await,
            Err(err) => return self.abort(generation, connect_error(err)).await,
        };

        let chain_id = match wallet.chain_id().await {
            Ok(chain_id) => chain_id,
            Err(err) => return self.abort(generation, connect_error(err)).await,
        };
        {
            let mut state = self.state.write().await;
            if state.generation != generation {
                return Err(DappError::NotConnectedOrWrongNetwork);
            }
            state.chain_id = Some(chain_id);
        }

        let account = match wallet.signer().await {
            Ok(account) => account,
            Err(err) => return self.abort(generation, connect_error(err)).await,
        };

        let mut state = self.state.write().await;
        if state.generation != generation {
            // identity changed underneath us; the reset wins
            return Err(DappError::NotConnectedOrWrongNetwork);
        }
        state.account = Some(account);

        if chain_id != self.required_chain_id {
            state.status = SessionStatus::WrongNetwork;
            warn!(
                %account,
                required = %self.required_chain_id,
                actual = %chain_id,
                "wallet is on the wrong network"
            );
            return Err(DappError::WrongNetwork {
                required: self.required_chain_id,
                actual: chain_id,
            });
        }

        state.status = SessionStatus::Connected;
        info!(%account, %chain_id, accounts = accounts.len(), "wallet connected");
        Ok(Identity { account, chain_id })
    }

    /// Drops all identity; the consumer must call [`Self::connect`] again.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let generation = state.generation.wrapping_add(1);
        *state = SessionState {
            generation,
            ..SessionState::default()
        };
        info!("wallet session reset");
    }

    async fn abort(&self, generation: u64, err: DappError) -> Result<Identity, DappError> {
        self.fail(Some(generation), &err).await;
        Err(err)
    }

    async fn fail(&self, generation: Option<u64>, err: &DappError) {
        let mut state = self.state.write().await;
        if generation.is_some_and(|generation| generation != state.generation) {
            return;
        }
        state.status = SessionStatus::Failed(err.to_string());
        state.account = None;
        warn!("wallet connection failed: {err}");
    }
}

fn connect_error(err: ChainError) -> DappError {
    match err {
        ChainError::NoProvider => DappError::NoWalletProvider,
        ChainError::UserRejected => DappError::UserDeclinedConnection,
        other => DappError::ProviderFailed(other.to_string()),
    }
}
