use crate::session::Identity;
use alloy_primitives::{Address, U256};
use dn_chain_memory::InMemoryChain;
use dn_types::ChainId;
use std::future::Future;
use std::time::Duration;

pub(crate) const CHAIN: ChainId = ChainId(1);

pub(crate) fn account() -> Address {
    Address::repeat_byte(0xa1)
}

pub(crate) fn charity(n: u8) -> Address {
    Address::repeat_byte(n)
}

pub(crate) fn identity() -> Identity {
    Identity {
        account: account(),
        chain_id: CHAIN,
    }
}

/// Chain owned by [`account`] with `count` charities named "Charity N",
/// each holding `N * 100` wei.
pub(crate) fn chain_with_charities(count: u8) -> InMemoryChain {
    let chain = InMemoryChain::new(CHAIN, account());
    for n in 1..=count {
        chain.add_charity(
            charity(n),
            Some(&format!("Charity {n}")),
            U256::from(u64::from(n) * 100),
        );
    }
    chain
}

/// Polls `check` until it holds or a second has passed.
pub(crate) async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    polled.is_ok()
}
