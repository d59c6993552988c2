//! Funds distribution for a settling round.
//!
//! Each outgoing transfer runs in three steps: a pending intent is committed
//! under a deterministic key, the collaborator is called with that key, and the
//! transfer's effect (zeroed balance, reduced contract balance, audit record)
//! is committed together with the intent's removal. A crash or failed commit
//! between the last two steps leaves the intent behind, and the retry replays
//! the same key so the collaborator moves value at most once.

use crate::{
    errors::{LotteryError, LotteryResult, StorageError},
    ledger_store::{settlement_key, LedgerStore},
    round::require_settling,
    transfer::ValueTransfer,
    types::{AccountId, NoWinnerPolicy, Round, TransferIntent, TransferKind, TransferRecord, Wei},
};
use chrono::Utc;

fn invariant(msg: String) -> LotteryError {
    LotteryError::Storage(StorageError::InvariantViolated(msg))
}

fn send(
    ledger: &LedgerStore,
    transfer: &dyn ValueTransfer,
    round: &Round,
    to: &AccountId,
    amount: Wei,
    tokens: u64,
    kind: TransferKind,
) -> LotteryResult<TransferRecord> {
    let key = settlement_key(round.round_id, kind, to);
    match ledger.load_intent(&key)? {
        Some(intent) if intent.amount != amount || intent.tokens != tokens => {
            return Err(invariant(format!(
                "pending {} to {} was for {} ({} tokens), now {} ({} tokens)",
                kind, to, intent.amount, intent.tokens, amount, tokens
            )));
        }
        Some(_) => {
            tracing::info!(round_id = round.round_id, key = %key, "Resuming unconfirmed transfer");
        }
        None => {
            let mut txn = ledger.begin();
            txn.put_intent(&TransferIntent {
                key: key.clone(),
                round_id: round.round_id,
                kind,
                account: to.clone(),
                amount,
                tokens,
                created_at: Utc::now(),
            })?;
            txn.commit()?;
        }
    }

    let receipt = transfer.pay(&key, to, amount, kind).map_err(|source| {
        tracing::warn!(
            round_id = round.round_id,
            account = %to,
            amount = %amount,
            kind = %kind,
            transient = source.is_transient(),
            error = %source,
            "Outgoing transfer failed"
        );
        LotteryError::TransferFailed {
            kind,
            account: to.clone(),
            amount,
            source,
        }
    })?;

    Ok(TransferRecord {
        round_id: round.round_id,
        kind,
        account: to.clone(),
        amount,
        tokens,
        transfer_id: receipt.transfer_id,
        key,
        completed_at: Utc::now(),
    })
}

/// Convert every remaining token balance back to value and pay it out.
///
/// No-op once the round is marked reimbursed.
pub fn reimburse(
    ledger: &LedgerStore,
    round: &mut Round,
    transfer: &dyn ValueTransfer,
) -> LotteryResult<Vec<TransferRecord>> {
    if round.reimbursed {
        return Ok(Vec::new());
    }
    require_settling(round)?;

    let mut records = Vec::new();
    for mut account in ledger.load_accounts()? {
        if account.token_balance == 0 {
            continue;
        }
        if ledger.has_transfer(round.round_id, TransferKind::Reimbursement, &account.id)? {
            return Err(invariant(format!(
                "{} already reimbursed in round {} but holds {} tokens",
                account.id, round.round_id, account.token_balance
            )));
        }
        let tokens = account.token_balance;
        let amount = round
            .rules
            .value_of(tokens)
            .ok_or_else(|| invariant(format!("reimbursement for {} overflows", account.id)))?;
        let remaining = round.contract_balance.checked_sub(amount).ok_or_else(|| {
            invariant(format!(
                "reimbursing {} to {} exceeds contract balance {}",
                amount, account.id, round.contract_balance
            ))
        })?;
        let reimbursed_tokens = round
            .tokens_reimbursed
            .checked_add(tokens)
            .ok_or_else(|| invariant(format!("reimbursed token count overflows at {}", account.id)))?;

        let record = send(ledger, transfer, round, &account.id, amount, tokens, TransferKind::Reimbursement)?;

        account.token_balance = 0;
        round.contract_balance = remaining;
        round.tokens_reimbursed = reimbursed_tokens;

        let mut txn = ledger.begin();
        txn.put_account(account);
        txn.put_round(round)?;
        txn.put_transfer(&record)?;
        txn.clear_intent(&record.key);
        txn.commit()?;

        tracing::debug!(
            round_id = round.round_id,
            account = %record.account,
            tokens,
            amount = %amount,
            "Reimbursed unspent tokens"
        );
        records.push(record);
    }

    round.reimbursed = true;
    let mut txn = ledger.begin();
    txn.put_round(round)?;
    txn.commit()?;

    tracing::info!(
        round_id = round.round_id,
        accounts = records.len(),
        "Reimbursement complete"
    );
    Ok(records)
}

/// Pay the pool to the winner, or apply the no-winner policy.
///
/// The pool is the contract balance minus whatever is still owed for
/// unreimbursed tokens, so this is safe to run before or after `reimburse`.
/// No-op once the round is marked paid out.
pub fn payout(
    ledger: &LedgerStore,
    round: &mut Round,
    transfer: &dyn ValueTransfer,
) -> LotteryResult<Option<TransferRecord>> {
    if round.paid_out {
        return Ok(None);
    }
    require_settling(round)?;

    let outcome = round
        .outcome
        .clone()
        .ok_or(LotteryError::WinnerNotComputed {
            round_id: round.round_id,
        })?;

    let liability = round
        .rules
        .value_of(round.outstanding_tokens())
        .ok_or_else(|| invariant("outstanding token liability overflows".to_string()))?;
    let pool = round.contract_balance.checked_sub(liability).ok_or_else(|| {
        invariant(format!(
            "contract balance {} below outstanding liability {}",
            round.contract_balance, liability
        ))
    })?;

    let recipient = match (&outcome.winner, round.rules.no_winner_policy) {
        (Some(winner), _) => Some((winner.clone(), TransferKind::Payout)),
        (None, NoWinnerPolicy::ReturnToOwner) => Some((round.rules.owner.clone(), TransferKind::PoolReturn)),
        (None, NoWinnerPolicy::CarryOver) => None,
    };

    let record = match &recipient {
        Some((to, kind)) if pool > 0 => Some(send(ledger, transfer, round, to, pool, 0, *kind)?),
        Some(_) => None,
        None => {
            round.carried_out = pool;
            None
        }
    };
    round.contract_balance -= pool;
    round.paid_out = true;

    let mut txn = ledger.begin();
    txn.put_round(round)?;
    if let Some(record) = &record {
        txn.put_transfer(record)?;
        txn.clear_intent(&record.key);
    }
    txn.commit()?;

    match &record {
        Some(r) => tracing::info!(
            round_id = round.round_id,
            account = %r.account,
            amount = %r.amount,
            kind = %r.kind,
            "Pool distributed"
        ),
        None => tracing::info!(
            round_id = round.round_id,
            carried = %round.carried_out,
            "No pool transfer this round"
        ),
    }
    Ok(record)
}
