//! Value-transfer collaborator.
//!
//! The engine never moves value itself. Incoming purchase payments and
//! outgoing reimbursements/payouts go through a [`ValueTransfer`]. Failures are
//! surfaced to the caller and never retried automatically.
//!
//! Every call carries an idempotency key. An implementation must move value at
//! most once per key and answer a repeated key with the original receipt.

use crate::errors::TransferError;
use crate::types::{AccountId, TransferKind, TransferReceipt, Wei};
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub trait ValueTransfer: Send + Sync {
    /// Accept `amount` paid in by `from` for a purchase
    fn receive(&self, key: &str, from: &AccountId, amount: Wei) -> Result<TransferReceipt, TransferError>;

    /// Pay `amount` out of the contract to `to`
    fn pay(&self, key: &str, to: &AccountId, amount: Wei, kind: TransferKind)
        -> Result<TransferReceipt, TransferError>;
}

/// In-process payable ledger.
///
/// Tracks each identity's external payable balance and everything paid in.
/// Failures can be scripted to exercise retry paths.
#[derive(Clone, Default)]
pub struct PayableLedger {
    payable: Arc<DashMap<AccountId, Wei>>,
    received: Arc<DashMap<AccountId, Wei>>,
    scripted_failures: Arc<Mutex<VecDeque<TransferError>>>,
    payments: Arc<Mutex<Vec<(AccountId, Wei, TransferKind)>>>,
    completed: Arc<DashMap<String, TransferReceipt>>,
}

impl PayableLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value paid out to `account` so far
    pub fn payable_of(&self, account: &AccountId) -> Wei {
        self.payable.get(account).map(|v| *v).unwrap_or(0)
    }

    /// Value paid in by `account` so far
    pub fn received_from(&self, account: &AccountId) -> Wei {
        self.received.get(account).map(|v| *v).unwrap_or(0)
    }

    pub fn total_paid_out(&self) -> Wei {
        self.payable.iter().map(|e| *e.value()).sum()
    }

    pub fn total_received(&self) -> Wei {
        self.received.iter().map(|e| *e.value()).sum()
    }

    /// Every successful outgoing payment in order
    pub fn payments(&self) -> Vec<(AccountId, Wei, TransferKind)> {
        self.payments.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Make the next transfer attempt (in either direction) fail with `error`
    pub fn fail_next(&self, error: TransferError) {
        if let Ok(mut queue) = self.scripted_failures.lock() {
            queue.push_back(error);
        }
    }

    fn take_failure(&self) -> Option<TransferError> {
        self.scripted_failures.lock().ok().and_then(|mut q| q.pop_front())
    }

    /// Run `apply` once per key; a replay returns the first receipt untouched
    fn once(
        &self,
        key: &str,
        account: &AccountId,
        amount: Wei,
        apply: impl FnOnce(),
    ) -> Result<TransferReceipt, TransferError> {
        match self.completed.entry(key.to_string()) {
            Entry::Occupied(done) => {
                let receipt = done.get();
                if receipt.account != *account || receipt.amount != amount {
                    return Err(TransferError::Permanent(format!(
                        "key {} already used for {} to {}",
                        key, receipt.amount, receipt.account
                    )));
                }
                tracing::debug!(key = %key, "Replayed transfer key, no value moved");
                Ok(receipt.clone())
            }
            Entry::Vacant(slot) => {
                if let Some(err) = self.take_failure() {
                    return Err(err);
                }
                apply();
                let receipt = TransferReceipt {
                    transfer_id: Uuid::new_v4().to_string(),
                    account: account.clone(),
                    amount,
                };
                slot.insert(receipt.clone());
                Ok(receipt)
            }
        }
    }
}

impl ValueTransfer for PayableLedger {
    fn receive(&self, key: &str, from: &AccountId, amount: Wei) -> Result<TransferReceipt, TransferError> {
        self.once(key, from, amount, || {
            *self.received.entry(from.clone()).or_insert(0) += amount;
        })
    }

    fn pay(
        &self,
        key: &str,
        to: &AccountId,
        amount: Wei,
        kind: TransferKind,
    ) -> Result<TransferReceipt, TransferError> {
        self.once(key, to, amount, || {
            *self.payable.entry(to.clone()).or_insert(0) += amount;
            if let Ok(mut payments) = self.payments.lock() {
                payments.push((to.clone(), amount, kind));
            }
            tracing::debug!(account = %to, amount = %amount, kind = %kind, "Value transferred");
        })
    }
}
