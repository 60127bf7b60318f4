//! The wallet: encrypted seed, keychain-backed output ownership, and the
//! interactive slate protocol.
//!
//! The wallet talks to a node only through [`NodeClient`], a read/push
//! abstraction satisfied in-process by the chain or remotely over RPC.

pub mod builder;
pub mod seed;
pub mod slate;

use thiserror::Error;

use crate::chain::Chain;
use crate::core::transaction::{Transaction, TxError};
use crate::crypto::commitment::Commitment;
use crate::crypto::CryptoError;
use crate::pool::PoolError;
use crate::store::OutputPos;

/// Wallet failures.
#[derive(Clone, Debug, Error)]
pub enum WalletError {
    #[error("insufficient funds: {available} available, {needed} needed")]
    InsufficientFunds { available: u64, needed: u64 },
    #[error("slate version {got} not supported (max {max})")]
    SlateVersionMismatch { max: u16, got: u16 },
    #[error("participant partial signature does not verify")]
    PartialSignatureInvalid,
    #[error("aggregated kernel signature does not verify")]
    KernelSignatureInvalid,
    #[error("slate has too many participants")]
    TooManyParticipants,
    #[error("slate is missing participant {0}")]
    MissingParticipant(u64),
    #[error("malformed slate: {0}")]
    Slate(String),
    #[error("seed storage failed: {0}")]
    Seed(String),
    #[error("node client failed: {0}")]
    NodeClient(String),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// An output this wallet can spend.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OwnedOutput {
    /// Keychain derivation index of the blinding factor.
    pub key_index: u32,
    pub value: u64,
    pub commitment: Commitment,
}

/// The wallet's window onto a node.
pub trait NodeClient: Send + Sync {
    fn head_height(&self) -> Result<u64, WalletError>;
    /// Confirmation check: position and height if the output is unspent.
    fn get_unspent(&self, commitment: &Commitment) -> Result<Option<OutputPos>, WalletError>;
    fn push_transaction(&self, tx: &Transaction) -> Result<(), WalletError>;
}

/// In-process node client backed directly by the chain and pool.
pub struct LocalNodeClient {
    pub chain: std::sync::Arc<Chain>,
    pub pool: std::sync::Arc<crate::pool::TransactionPool>,
}

impl NodeClient for LocalNodeClient {
    fn head_height(&self) -> Result<u64, WalletError> {
        self.chain
            .head()
            .map(|tip| tip.height)
            .map_err(|e| WalletError::NodeClient(e.to_string()))
    }

    fn get_unspent(&self, commitment: &Commitment) -> Result<Option<OutputPos>, WalletError> {
        self.chain
            .get_unspent(commitment)
            .map_err(|e| WalletError::NodeClient(e.to_string()))
    }

    fn push_transaction(&self, tx: &Transaction) -> Result<(), WalletError> {
        match self.pool.add_to_mempool(tx.clone()) {
            Ok(_) | Err(PoolError::Duplicate) => Ok(()),
            Err(e) => Err(WalletError::NodeClient(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::pool::{PoolConfig, TransactionPool};
    use crate::store::ChainStore;
    use crate::txhashset::TxHashSet;
    use std::sync::Arc;

    fn local_client() -> LocalNodeClient {
        let store = Arc::new(ChainStore::open_temporary().unwrap());
        let chain = Arc::new(Chain::init(store, TxHashSet::in_memory().unwrap()).unwrap());
        let pool = Arc::new(TransactionPool::new(chain.clone(), PoolConfig::default()));
        LocalNodeClient { chain, pool }
    }

    #[test]
    fn local_client_reports_head() {
        let client = local_client();
        assert_eq!(client.head_height().unwrap(), 0);
    }

    #[test]
    fn unknown_output_is_unconfirmed() {
        let client = local_client();
        let commitment = Commitment::from_bytes([7u8; 32]);
        assert!(client.get_unspent(&commitment).unwrap().is_none());

        // Confirmation filtering drops outputs the chain does not know.
        let phantom = OwnedOutput {
            key_index: 0,
            value: 100,
            commitment,
        };
        let confirmed = crate::wallet::builder::confirm_outputs(&client, &[phantom]).unwrap();
        assert!(confirmed.is_empty());
    }

    #[test]
    fn push_of_unresolvable_transaction_fails() {
        use crate::core::transaction::test_util::build_tx;
        use crate::crypto::commitment::BlindingFactor;

        let client = local_client();
        let tx = build_tx(
            1_000_000,
            &BlindingFactor::from_bytes([1u8; 32]),
            &BlindingFactor::from_bytes([2u8; 32]),
            40_000,
        );
        assert!(client.push_transaction(&tx).is_err());
    }
}
