//! The lottery engine: single entry point for participants, the owner and settlement.
//!
//! Every mutating operation runs under one write lock and commits its effects
//! as a single write batch. Queries never take the lock; each one reads a
//! single record or a single prefix scan, so it observes either all or none of
//! any mutation.

use crate::{
    accounts,
    config::{EngineConfig, StorageBackend},
    distributor,
    entropy::{DrawRequest, EntropySource, VrfEntropy},
    errors::{LotteryError, LotteryResult},
    guesses,
    ledger_store::{guess_log_digest, purchase_key, LedgerStore},
    metrics::EngineMetrics,
    round,
    storage::{KvStore, MemoryStore, RocksStore},
    transfer::ValueTransfer,
    types::{
        Account, AccountId, Guess, Round, RoundOutcome, RoundState, TransferIntent, TransferKind, TransferRecord,
        Wei,
    },
    winner,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub struct LotteryEngine {
    ledger: LedgerStore,
    config: EngineConfig,
    write_lock: Mutex<()>,
    transfer: Arc<dyn ValueTransfer>,
    entropy: Arc<dyn EntropySource>,
    metrics: EngineMetrics,
}

impl LotteryEngine {
    /// Build an engine over `kv`, opening round 1 if the store has no round yet
    pub fn new(
        config: EngineConfig,
        kv: Arc<dyn KvStore>,
        transfer: Arc<dyn ValueTransfer>,
        entropy: Arc<dyn EntropySource>,
    ) -> LotteryResult<Self> {
        config.validate()?;
        let engine = Self {
            ledger: LedgerStore::new(kv),
            config,
            write_lock: Mutex::new(()),
            transfer,
            entropy,
            metrics: EngineMetrics::new()?,
        };

        match engine.ledger.current_round_id()? {
            Some(round_id) => {
                info!(round_id, "Resuming existing ledger");
                engine.metrics.current_round.set(round_id as i64);
            }
            None => {
                let first = Round::open(1, engine.config.game.rules(), 0);
                let mut txn = engine.ledger.begin();
                txn.put_round(&first)?;
                txn.set_current_round(first.round_id);
                txn.commit()?;
                engine.metrics.current_round.set(1);
                info!(
                    round_id = first.round_id,
                    owner = %first.rules.owner,
                    price = %first.rules.price_per_token,
                    "Opened first round"
                );
            }
        }
        Ok(engine)
    }

    /// Build an engine over the storage backend named in the configuration
    pub fn open(
        config: EngineConfig,
        transfer: Arc<dyn ValueTransfer>,
        entropy: Arc<dyn EntropySource>,
    ) -> LotteryResult<Self> {
        let kv: Arc<dyn KvStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Rocksdb => Arc::new(RocksStore::open_with_config(
                &config.storage.data_directory,
                &config.storage,
            )?),
        };
        Self::new(config, kv, transfer, entropy)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Metrics in text exposition format, if enabled
    pub fn metrics_text(&self) -> Option<String> {
        self.config
            .monitoring
            .enable_metrics
            .then(|| self.metrics.gather_text())
    }

    fn write(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe<T>(&self, operation: &'static str, result: LotteryResult<T>) -> LotteryResult<T> {
        if let Err(e) = &result {
            warn!(operation, kind = e.kind(), error = %e, "Operation rejected");
            self.metrics.record_rejection(operation, e.kind());
            if let LotteryError::TransferFailed { kind, .. } = e {
                self.metrics.record_transfer_failure(*kind);
            }
        }
        result
    }

    // ---- participant operations ----

    pub fn register(&self, id: &AccountId) -> LotteryResult<Account> {
        let _guard = self.write();
        let result: LotteryResult<Account> = (|| {
            let mut txn = self.ledger.begin();
            let account = accounts::register(&mut txn, id)?;
            txn.commit()?;
            Ok(account)
        })();
        self.observe("register", result)
    }

    /// Buy `tokens` in the current round, paying exactly `paid` wei.
    ///
    /// The payment is announced as a pending intent before the collaborator is
    /// asked to receive it. If the tokens are not committed afterwards, the same
    /// purchase retried later reuses the key and is not charged twice.
    pub fn credit(&self, id: &AccountId, tokens: u64, paid: Wei) -> LotteryResult<Account> {
        let _guard = self.write();
        let result: LotteryResult<Account> = (|| {
            let mut txn = self.ledger.begin();
            let mut round = txn.current_round()?;
            let seq = txn.account(id)?.map(|a| a.purchases).unwrap_or(0);
            let account = accounts::credit(&mut txn, &mut round, id, tokens, paid)?;
            let key = purchase_key(round.round_id, id, seq);

            match self.ledger.load_intent(&key)? {
                Some(pending) if pending.amount != paid || pending.tokens != tokens => {
                    return Err(LotteryError::invalid_amount(format!(
                        "earlier purchase of {} tokens for {} wei is unresolved",
                        pending.tokens, pending.amount
                    )));
                }
                Some(_) => info!(round_id = round.round_id, key = %key, "Resuming unconfirmed purchase"),
                None => {
                    let mut announce = self.ledger.begin();
                    announce.put_intent(&TransferIntent {
                        key: key.clone(),
                        round_id: round.round_id,
                        kind: TransferKind::Purchase,
                        account: id.clone(),
                        amount: paid,
                        tokens,
                        created_at: chrono::Utc::now(),
                    })?;
                    announce.commit()?;
                }
            }

            let receipt = match self.transfer.receive(&key, id, paid) {
                Ok(receipt) => receipt,
                Err(source) => {
                    // Permanent refusals move nothing.
                    if !source.is_transient() {
                        let mut abandon = self.ledger.begin();
                        abandon.clear_intent(&key);
                        abandon.commit()?;
                    }
                    return Err(LotteryError::TransferFailed {
                        kind: TransferKind::Purchase,
                        account: id.clone(),
                        amount: paid,
                        source,
                    });
                }
            };

            txn.put_round(&round)?;
            txn.clear_intent(&key);
            txn.commit()?;
            self.metrics.tokens_sold.inc_by(tokens);
            self.metrics.record_transfer(TransferKind::Purchase, paid);
            debug!(
                round_id = round.round_id,
                account = %id,
                tokens,
                balance = account.token_balance,
                transfer_id = %receipt.transfer_id,
                "Tokens credited"
            );
            Ok(account)
        })();
        self.observe("credit", result)
    }

    /// Remove `n` tokens from an account without a guess; their value stays in the pool
    pub fn debit(&self, id: &AccountId, n: u64) -> LotteryResult<Account> {
        let _guard = self.write();
        let result: LotteryResult<Account> = (|| {
            let mut txn = self.ledger.begin();
            let mut round = txn.current_round()?;
            let account = accounts::burn(&mut txn, &mut round, id, n)?;
            txn.put_round(&round)?;
            txn.commit()?;
            debug!(round_id = round.round_id, account = %id, tokens = n, "Tokens debited");
            Ok(account)
        })();
        self.observe("debit", result)
    }

    /// Spend one token on a guess in the current round
    pub fn submit_guess(&self, id: &AccountId, value: i64) -> LotteryResult<Guess> {
        let _guard = self.write();
        let result: LotteryResult<Guess> = (|| {
            let mut txn = self.ledger.begin();
            let mut round = txn.current_round()?;
            let guess = guesses::submit_guess(&mut txn, &mut round, id, value)?;
            txn.put_round(&round)?;
            txn.commit()?;
            self.metrics.guesses_accepted.inc();
            debug!(
                round_id = guess.round_id,
                seq = guess.seq,
                account = %id,
                value = guess.value,
                "Guess recorded"
            );
            Ok(guess)
        })();
        self.observe("submit_guess", result)
    }

    // ---- owner operations ----

    /// Close the current round to purchases and guesses
    pub fn close(&self, caller: &AccountId) -> LotteryResult<Round> {
        let _guard = self.write();
        let result: LotteryResult<Round> = (|| {
            let mut txn = self.ledger.begin();
            let mut current = txn.current_round()?;
            let log = self.ledger.load_round_guesses(current.round_id)?;
            round::close(&mut current, caller, &log)?;
            txn.put_round(&current)?;
            txn.commit()?;
            let unresolved = self.ledger.load_intents(current.round_id)?;
            if !unresolved.is_empty() {
                warn!(
                    round_id = current.round_id,
                    pending = unresolved.len(),
                    "Round closed with unconfirmed transfers"
                );
            }
            info!(
                round_id = current.round_id,
                guesses = current.guess_count,
                pool = %current.contract_balance,
                "Round closed"
            );
            Ok(current)
        })();
        self.observe("close", result)
    }

    /// Open a fresh round once the current one is settled
    pub fn open_next_round(&self, caller: &AccountId) -> LotteryResult<Round> {
        let _guard = self.write();
        let result: LotteryResult<Round> = (|| {
            let mut txn = self.ledger.begin();
            let previous = txn.current_round()?;
            let next = round::open_next(&previous, caller, self.config.game.rules())?;
            txn.put_round(&next)?;
            txn.set_current_round(next.round_id);
            txn.commit()?;
            self.metrics.current_round.set(next.round_id as i64);
            info!(
                round_id = next.round_id,
                carried_in = %next.carried_in,
                "Opened next round"
            );
            Ok(next)
        })();
        self.observe("open_next_round", result)
    }

    // ---- settlement ----

    pub fn compute_winner(&self, round_id: u64) -> LotteryResult<RoundOutcome> {
        let _guard = self.write();
        let result = self.compute_winner_locked(round_id);
        self.observe("compute_winner", result)
    }

    pub fn reimburse(&self, round_id: u64) -> LotteryResult<Vec<TransferRecord>> {
        let _guard = self.write();
        let result = self.reimburse_locked(round_id);
        self.observe("reimburse", result)
    }

    pub fn payout(&self, round_id: u64) -> LotteryResult<Option<TransferRecord>> {
        let _guard = self.write();
        let result = self.payout_locked(round_id);
        self.observe("payout", result)
    }

    pub fn finalize(&self, round_id: u64) -> LotteryResult<Round> {
        let _guard = self.write();
        let result = self.finalize_locked(round_id);
        self.observe("finalize", result)
    }

    /// Run every remaining settlement step for a closed round.
    ///
    /// Steps already done by an earlier attempt are skipped, so this can be
    /// called again after a transfer failure.
    pub fn settle(&self, round_id: u64) -> LotteryResult<Round> {
        let _guard = self.write();
        let result: LotteryResult<Round> = (|| {
            let current = self.load_round(round_id)?;
            if current.state == RoundState::Settled {
                return Ok(current);
            }
            round::require_settling(&current)?;
            if current.outcome.is_none() {
                self.compute_winner_locked(round_id)?;
            }
            self.reimburse_locked(round_id)?;
            self.payout_locked(round_id)?;
            self.finalize_locked(round_id)
        })();
        self.observe("settle", result)
    }

    fn compute_winner_locked(&self, round_id: u64) -> LotteryResult<RoundOutcome> {
        let mut txn = self.ledger.begin();
        let mut current = txn.round(round_id)?;
        let log = self.ledger.load_round_guesses(round_id)?;
        let outcome = winner::compute_winner(&mut current, &log, self.entropy.as_ref())?;
        txn.put_round(&current)?;
        txn.commit()?;
        info!(
            round_id,
            winning_value = outcome.winning_value,
            winner = ?outcome.winner.as_ref().map(AccountId::as_str),
            "Winner computed"
        );
        Ok(outcome)
    }

    fn reimburse_locked(&self, round_id: u64) -> LotteryResult<Vec<TransferRecord>> {
        let mut current = self.load_round(round_id)?;
        let records = distributor::reimburse(&self.ledger, &mut current, self.transfer.as_ref())?;
        for record in &records {
            self.metrics.record_transfer(record.kind, record.amount);
        }
        Ok(records)
    }

    fn payout_locked(&self, round_id: u64) -> LotteryResult<Option<TransferRecord>> {
        let mut current = self.load_round(round_id)?;
        let record = distributor::payout(&self.ledger, &mut current, self.transfer.as_ref())?;
        if let Some(record) = &record {
            self.metrics.record_transfer(record.kind, record.amount);
        }
        Ok(record)
    }

    fn finalize_locked(&self, round_id: u64) -> LotteryResult<Round> {
        let mut txn = self.ledger.begin();
        let mut current = txn.round(round_id)?;
        if round::finalize(&mut current)? {
            txn.put_round(&current)?;
            txn.commit()?;
            self.metrics.rounds_settled.inc();
            info!(
                round_id,
                carried_out = %current.carried_out,
                remaining = %current.contract_balance,
                "Round settled"
            );
        }
        Ok(current)
    }

    fn load_round(&self, round_id: u64) -> LotteryResult<Round> {
        self.ledger
            .load_round(round_id)?
            .ok_or(LotteryError::RoundNotFound(round_id))
    }

    // ---- queries ----

    /// Token balance; unknown accounts read as zero
    pub fn balance_of(&self, id: &AccountId) -> LotteryResult<u64> {
        accounts::balance_of(&self.ledger, id)
    }

    pub fn guesses_of(&self, id: &AccountId, round_id: u64) -> LotteryResult<Vec<Guess>> {
        guesses::guesses_of(&self.ledger, id, round_id)
    }

    pub fn all_guesses(&self, round_id: u64) -> LotteryResult<Vec<(AccountId, u8)>> {
        guesses::all_guesses(&self.ledger, round_id)
    }

    pub fn account(&self, id: &AccountId) -> LotteryResult<Option<Account>> {
        self.ledger.load_account(id)
    }

    pub fn current_round(&self) -> LotteryResult<Round> {
        let round_id = self
            .ledger
            .current_round_id()?
            .ok_or(LotteryError::RoundNotFound(0))?;
        self.load_round(round_id)
    }

    pub fn round(&self, round_id: u64) -> LotteryResult<Round> {
        self.load_round(round_id)
    }

    /// Owner of the current round
    pub fn owner(&self) -> LotteryResult<AccountId> {
        Ok(self.current_round()?.rules.owner)
    }

    /// Pool currently held for the current round
    pub fn contract_balance(&self) -> LotteryResult<Wei> {
        Ok(self.current_round()?.contract_balance)
    }

    pub fn winning_value(&self, round_id: u64) -> LotteryResult<Option<u8>> {
        Ok(self.load_round(round_id)?.winning_value())
    }

    pub fn winner(&self, round_id: u64) -> LotteryResult<Option<AccountId>> {
        Ok(self.load_round(round_id)?.winner().cloned())
    }

    /// Outgoing transfers recorded for a round, oldest first
    pub fn transfers(&self, round_id: u64) -> LotteryResult<Vec<TransferRecord>> {
        self.ledger.load_transfers(round_id)
    }

    /// Transfers of a round that were announced but never confirmed
    pub fn pending_transfers(&self, round_id: u64) -> LotteryResult<Vec<TransferIntent>> {
        self.ledger.load_intents(round_id)
    }

    /// Re-check a round's draw against its stored guess log.
    ///
    /// `Ok(false)` means the log no longer matches the digest frozen at close,
    /// or the entropy proof does not yield the recorded winning value.
    pub fn verify_entropy(&self, round_id: u64) -> LotteryResult<bool> {
        let current = self.load_round(round_id)?;
        let outcome = current
            .outcome
            .as_ref()
            .ok_or(LotteryError::WinnerNotComputed { round_id })?;

        let log = self.ledger.load_round_guesses(round_id)?;
        let digest = guess_log_digest(&log);
        if current.guess_log_digest.as_deref() != Some(digest.as_str()) {
            warn!(round_id, "Guess log does not match digest fixed at close");
            return Ok(false);
        }

        let request = DrawRequest {
            round_id,
            min: current.rules.min_guess,
            max: current.rules.max_guess,
            guess_log_digest: digest,
        };
        let expected_input = request.input_message();
        let proof = &outcome.entropy;

        let verified = match proof.source.as_str() {
            "vrf" => VrfEntropy::verify(proof, &expected_input, request.min, request.max)
                .map_err(|e| LotteryError::InvalidEntropy(e.to_string()))?
                .map_or(false, |value| value == outcome.winning_value),
            _ => {
                proof.input_message == expected_input
                    && proof.output == hex::encode([outcome.winning_value])
            }
        };
        Ok(verified)
    }
}
