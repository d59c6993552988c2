//! Ledger records and their key layout in the durable store.
//!
//! Key layout:
//! - `meta:current_round`                 -> u64 (le)
//! - `account:{id}`                       -> Account (json)
//! - `round:{round:020}`                  -> Round (json)
//! - `guess:{round:020}:{seq:020}`        -> Guess (bincode), the submission log
//! - `guesses:{round:020}:{id}`           -> Vec<Guess> (bincode), per-account view
//! - `transfer:{round:020}:{kind}:{id}`   -> TransferRecord (json), doubles as completion marker
//! - `pending:{key}`                      -> TransferIntent (json), announced but unconfirmed transfer
//!
//! Zero-padded numbers keep prefix scans in numeric order.

use crate::{
    errors::{LotteryError, LotteryResult, StorageError},
    storage::{KvStore, WriteBatch},
    types::{Account, AccountId, Guess, Round, TransferIntent, TransferKind, TransferRecord},
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

const CURRENT_ROUND_KEY: &[u8] = b"meta:current_round";
const ACCOUNT_PREFIX: &str = "account:";
const ROUND_PREFIX: &str = "round:";
const GUESS_LOG_PREFIX: &str = "guess:";
const ACCOUNT_GUESSES_PREFIX: &str = "guesses:";
const TRANSFER_PREFIX: &str = "transfer:";
const PENDING_PREFIX: &str = "pending:";

fn account_key(id: &AccountId) -> Vec<u8> {
    format!("{}{}", ACCOUNT_PREFIX, id).into_bytes()
}

fn round_key(round_id: u64) -> Vec<u8> {
    format!("{}{:020}", ROUND_PREFIX, round_id).into_bytes()
}

fn guess_log_prefix(round_id: u64) -> Vec<u8> {
    format!("{}{:020}:", GUESS_LOG_PREFIX, round_id).into_bytes()
}

fn guess_log_key(round_id: u64, seq: u64) -> Vec<u8> {
    let mut key = guess_log_prefix(round_id);
    key.extend_from_slice(format!("{:020}", seq).as_bytes());
    key
}

fn account_guesses_key(round_id: u64, id: &AccountId) -> Vec<u8> {
    format!("{}{:020}:{}", ACCOUNT_GUESSES_PREFIX, round_id, id).into_bytes()
}

fn transfer_prefix(round_id: u64) -> Vec<u8> {
    format!("{}{:020}:", TRANSFER_PREFIX, round_id).into_bytes()
}

fn transfer_key(round_id: u64, kind: TransferKind, id: &AccountId) -> Vec<u8> {
    let mut key = transfer_prefix(round_id);
    key.extend_from_slice(format!("{}:{}", kind, id).as_bytes());
    key
}

fn pending_key(key: &str) -> Vec<u8> {
    format!("{}{}", PENDING_PREFIX, key).into_bytes()
}

/// Idempotency key of the outgoing `kind` transfer to `id` in a round
pub fn settlement_key(round_id: u64, kind: TransferKind, id: &AccountId) -> String {
    format!("{:020}:{}:{}", round_id, kind, id)
}

/// Idempotency key of an account's `seq`-th purchase in a round
pub fn purchase_key(round_id: u64, id: &AccountId, seq: u64) -> String {
    format!("{:020}:{}:{}:{}", round_id, TransferKind::Purchase, id, seq)
}

fn parse_u64_le(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_le_bytes(arr))
}

fn decode_json<T: serde::de::DeserializeOwned>(bytes: &[u8], what: &str) -> LotteryResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        LotteryError::Storage(StorageError::CorruptedData(format!(
            "Failed to decode {}: {}",
            what, e
        )))
    })
}

fn encode_json<T: serde::Serialize>(value: &T, what: &str) -> LotteryResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        LotteryError::Storage(StorageError::WriteFailed(format!(
            "Failed to encode {}: {}",
            what, e
        )))
    })
}

/// Typed access to the ledger records held in a [`KvStore`]
#[derive(Clone)]
pub struct LedgerStore {
    kv: Arc<dyn KvStore>,
}

impl LedgerStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn current_round_id(&self) -> LotteryResult<Option<u64>> {
        Ok(self
            .kv
            .get(CURRENT_ROUND_KEY)?
            .and_then(|b| parse_u64_le(&b)))
    }

    pub fn load_account(&self, id: &AccountId) -> LotteryResult<Option<Account>> {
        match self.kv.get(&account_key(id))? {
            Some(bytes) => Ok(Some(decode_json(&bytes, "account")?)),
            None => Ok(None),
        }
    }

    pub fn load_accounts(&self) -> LotteryResult<Vec<Account>> {
        self.kv
            .scan_prefix(ACCOUNT_PREFIX.as_bytes())?
            .iter()
            .map(|(_, v)| decode_json(v, "account"))
            .collect()
    }

    pub fn load_round(&self, round_id: u64) -> LotteryResult<Option<Round>> {
        match self.kv.get(&round_key(round_id))? {
            Some(bytes) => Ok(Some(decode_json(&bytes, "round")?)),
            None => Ok(None),
        }
    }

    /// Guesses of one account in submission order
    pub fn load_guesses_of(&self, round_id: u64, id: &AccountId) -> LotteryResult<Vec<Guess>> {
        match self.kv.get(&account_guesses_key(round_id, id))? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// The full submission log of a round
    pub fn load_round_guesses(&self, round_id: u64) -> LotteryResult<Vec<Guess>> {
        self.kv
            .scan_prefix(&guess_log_prefix(round_id))?
            .iter()
            .map(|(_, v)| bincode::deserialize(v).map_err(LotteryError::from))
            .collect()
    }

    pub fn load_transfers(&self, round_id: u64) -> LotteryResult<Vec<TransferRecord>> {
        let mut records: Vec<TransferRecord> = self
            .kv
            .scan_prefix(&transfer_prefix(round_id))?
            .iter()
            .map(|(_, v)| decode_json(v, "transfer record"))
            .collect::<LotteryResult<_>>()?;
        records.sort_by_key(|r| r.completed_at);
        Ok(records)
    }

    pub fn has_transfer(&self, round_id: u64, kind: TransferKind, id: &AccountId) -> LotteryResult<bool> {
        Ok(self.kv.get(&transfer_key(round_id, kind, id))?.is_some())
    }

    pub fn load_intent(&self, key: &str) -> LotteryResult<Option<TransferIntent>> {
        match self.kv.get(&pending_key(key))? {
            Some(bytes) => Ok(Some(decode_json(&bytes, "transfer intent")?)),
            None => Ok(None),
        }
    }

    /// Unconfirmed transfers of a round, in key order
    pub fn load_intents(&self, round_id: u64) -> LotteryResult<Vec<TransferIntent>> {
        let prefix = pending_key(&format!("{:020}:", round_id));
        self.kv
            .scan_prefix(&prefix)?
            .iter()
            .map(|(_, v)| decode_json(v, "transfer intent"))
            .collect()
    }

    /// Start staging a set of mutations that commit together
    pub fn begin(&self) -> LedgerTxn<'_> {
        LedgerTxn {
            store: self,
            batch: WriteBatch::new(),
            accounts: HashMap::new(),
            account_guesses: HashMap::new(),
        }
    }
}

/// Staged mutations; nothing is visible to readers until [`LedgerTxn::commit`]
///
/// Reads through the transaction observe its own staged accounts, so one
/// operation can touch the same account twice.
pub struct LedgerTxn<'a> {
    store: &'a LedgerStore,
    batch: WriteBatch,
    accounts: HashMap<AccountId, Account>,
    account_guesses: HashMap<(u64, AccountId), Vec<Guess>>,
}

impl<'a> LedgerTxn<'a> {
    pub fn account(&self, id: &AccountId) -> LotteryResult<Option<Account>> {
        match self.accounts.get(id) {
            Some(account) => Ok(Some(account.clone())),
            None => self.store.load_account(id),
        }
    }

    pub fn put_account(&mut self, account: Account) {
        self.accounts.insert(account.id.clone(), account);
    }

    pub fn current_round(&self) -> LotteryResult<Round> {
        let round_id = self
            .store
            .current_round_id()?
            .ok_or_else(|| StorageError::InvariantViolated("no round has been opened".to_string()))?;
        self.round(round_id)
    }

    pub fn round(&self, round_id: u64) -> LotteryResult<Round> {
        self.store
            .load_round(round_id)?
            .ok_or(LotteryError::RoundNotFound(round_id))
    }

    pub fn put_round(&mut self, round: &Round) -> LotteryResult<()> {
        self.batch.put(round_key(round.round_id), encode_json(round, "round")?);
        Ok(())
    }

    pub fn set_current_round(&mut self, round_id: u64) {
        self.batch.put(CURRENT_ROUND_KEY.to_vec(), round_id.to_le_bytes().to_vec());
    }

    /// Stage a guess in both the round log and the account's own sequence
    pub fn append_guess(&mut self, guess: Guess) -> LotteryResult<()> {
        let slot = (guess.round_id, guess.account.clone());
        if !self.account_guesses.contains_key(&slot) {
            let existing = self.store.load_guesses_of(guess.round_id, &guess.account)?;
            self.account_guesses.insert(slot.clone(), existing);
        }
        self.batch.put(
            guess_log_key(guess.round_id, guess.seq),
            bincode::serialize(&guess)?,
        );
        if let Some(seq) = self.account_guesses.get_mut(&slot) {
            seq.push(guess);
        }
        Ok(())
    }

    pub fn put_transfer(&mut self, record: &TransferRecord) -> LotteryResult<()> {
        self.batch.put(
            transfer_key(record.round_id, record.kind, &record.account),
            encode_json(record, "transfer record")?,
        );
        Ok(())
    }

    pub fn put_intent(&mut self, intent: &TransferIntent) -> LotteryResult<()> {
        self.batch
            .put(pending_key(&intent.key), encode_json(intent, "transfer intent")?);
        Ok(())
    }

    /// Drop the intent in the same batch that records the transfer's effect
    pub fn clear_intent(&mut self, key: &str) {
        self.batch.delete(pending_key(key));
    }

    /// Write every staged mutation in one atomic batch
    pub fn commit(mut self) -> LotteryResult<()> {
        for account in self.accounts.values() {
            self.batch.put(account_key(&account.id), encode_json(account, "account")?);
        }
        for ((round_id, id), guesses) in &self.account_guesses {
            self.batch
                .put(account_guesses_key(*round_id, id), bincode::serialize(guesses)?);
        }
        if self.batch.is_empty() {
            return Ok(());
        }
        tracing::trace!(ops = self.batch.len(), "Committing ledger batch");
        self.store.kv.write(self.batch)
    }
}

/// SHA-256 over the submission log, hex encoded
pub fn guess_log_digest(guesses: &[Guess]) -> String {
    let mut hasher = Sha256::new();
    for guess in guesses {
        hasher.update(guess.seq.to_be_bytes());
        hasher.update(guess.account.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update([guess.value]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{NoWinnerPolicy, RoundRules, TieBreak};

    fn ledger() -> LedgerStore {
        LedgerStore::new(Arc::new(MemoryStore::new()))
    }

    fn rules() -> RoundRules {
        RoundRules {
            price_per_token: 10,
            min_guess: 1,
            max_guess: 10,
            owner: AccountId::from("owner"),
            tie_break: TieBreak::FirstMatch,
            no_winner_policy: NoWinnerPolicy::CarryOver,
        }
    }

    fn guess(seq: u64, account: &str, value: u8) -> Guess {
        Guess {
            round_id: 1,
            seq,
            account: AccountId::from(account),
            value,
        }
    }

    #[test]
    fn test_staged_writes_invisible_until_commit() {
        let ledger = ledger();
        let mut txn = ledger.begin();
        txn.put_account(Account::new(AccountId::from("0xa"), true));

        assert!(txn.account(&AccountId::from("0xa")).unwrap().is_some());
        assert!(ledger.load_account(&AccountId::from("0xa")).unwrap().is_none());

        txn.commit().unwrap();
        assert!(ledger.load_account(&AccountId::from("0xa")).unwrap().is_some());
    }

    #[test]
    fn test_dropped_txn_leaves_store_untouched() {
        let ledger = ledger();
        {
            let mut txn = ledger.begin();
            txn.put_account(Account::new(AccountId::from("0xa"), true));
            txn.set_current_round(7);
        }
        assert!(ledger.load_accounts().unwrap().is_empty());
        assert_eq!(ledger.current_round_id().unwrap(), None);
    }

    #[test]
    fn test_guess_log_order_and_account_view() {
        let ledger = ledger();
        let mut txn = ledger.begin();
        txn.append_guess(guess(0, "0xa", 3)).unwrap();
        txn.append_guess(guess(1, "0xb", 7)).unwrap();
        txn.commit().unwrap();

        let mut txn = ledger.begin();
        txn.append_guess(guess(2, "0xa", 5)).unwrap();
        txn.commit().unwrap();

        let log = ledger.load_round_guesses(1).unwrap();
        assert_eq!(log.iter().map(|g| g.seq).collect::<Vec<_>>(), vec![0, 1, 2]);

        let mine = ledger.load_guesses_of(1, &AccountId::from("0xa")).unwrap();
        assert_eq!(mine.iter().map(|g| g.value).collect::<Vec<_>>(), vec![3, 5]);
        assert!(ledger.load_guesses_of(2, &AccountId::from("0xa")).unwrap().is_empty());
    }

    #[test]
    fn test_round_roundtrip_and_current_pointer() {
        let ledger = ledger();
        let round = Round::open(1, rules(), 0);
        let mut txn = ledger.begin();
        txn.put_round(&round).unwrap();
        txn.set_current_round(1);
        txn.commit().unwrap();

        let txn = ledger.begin();
        assert_eq!(txn.current_round().unwrap(), round);
        assert!(matches!(txn.round(2), Err(LotteryError::RoundNotFound(2))));
    }

    #[test]
    fn test_intent_cleared_with_completion() {
        let ledger = ledger();
        let id = AccountId::from("0xa");
        let key = settlement_key(1, TransferKind::Payout, &id);
        let intent = TransferIntent {
            key: key.clone(),
            round_id: 1,
            kind: TransferKind::Payout,
            account: id.clone(),
            amount: 30,
            tokens: 0,
            created_at: chrono::Utc::now(),
        };
        let mut txn = ledger.begin();
        txn.put_intent(&intent).unwrap();
        txn.commit().unwrap();
        assert_eq!(ledger.load_intent(&key).unwrap(), Some(intent.clone()));
        assert_eq!(ledger.load_intents(1).unwrap().len(), 1);
        assert!(ledger.load_intents(2).unwrap().is_empty());

        let mut txn = ledger.begin();
        txn.clear_intent(&key);
        txn.commit().unwrap();
        assert_eq!(ledger.load_intent(&key).unwrap(), None);
    }

    #[test]
    fn test_transfer_keys_are_round_scoped() {
        let id = AccountId::from("0xa");
        assert_ne!(purchase_key(1, &id, 0), purchase_key(1, &id, 1));
        assert_ne!(purchase_key(1, &id, 0), purchase_key(2, &id, 0));
        assert!(settlement_key(3, TransferKind::Reimbursement, &id).starts_with("00000000000000000003:"));
    }

    #[test]
    fn test_digest_depends_on_order() {
        let a = vec![guess(0, "0xa", 3), guess(1, "0xb", 7)];
        let b = vec![guess(0, "0xb", 7), guess(1, "0xa", 3)];
        assert_ne!(guess_log_digest(&a), guess_log_digest(&b));
        assert_eq!(guess_log_digest(&a).len(), 64);
    }
}
