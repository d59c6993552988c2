//! Lottery Settlement Engine
//!
//! Participants buy tokens at a fixed price, spend one token per guess on a
//! number in a small range, and once the owner closes the round the engine
//! draws a winning value, reimburses unspent tokens and pays the pool to the
//! first matching guess. All ledger state lives in a pluggable key-value store
//! (in memory or RocksDB) and every mutation commits as one atomic batch.

pub mod accounts;
pub mod config;
pub mod distributor;
pub mod engine;
pub mod entropy;
pub mod errors;
pub mod guesses;
pub mod ledger_store;
pub mod metrics;
pub mod round;
pub mod storage;
pub mod transfer;
pub mod types;
pub mod winner;

pub use config::EngineConfig;
pub use engine::LotteryEngine;
pub use entropy::{EntropySource, FixedEntropy, VrfEntropy};
pub use errors::{LotteryError, LotteryResult, StorageError, TransferError};
pub use storage::{KvStore, MemoryStore, RocksStore};
pub use transfer::{PayableLedger, ValueTransfer};
pub use types::{
    format_ether, parse_ether, Account, AccountId, Guess, NoWinnerPolicy, Round, RoundOutcome, RoundState,
    TieBreak, TransferIntent, TransferKind, TransferRecord, Wei, WEI_PER_ETHER,
};
