//! Account ledger: token balances and the only place tokens are minted or burned.

use crate::{
    errors::{LotteryError, LotteryResult},
    ledger_store::{LedgerStore, LedgerTxn},
    types::{Account, AccountId, Round, RoundState, Wei},
};

/// Create the account if absent and mark it registered. Idempotent.
pub fn register(txn: &mut LedgerTxn<'_>, id: &AccountId) -> LotteryResult<Account> {
    match txn.account(id)? {
        Some(account) if account.registered => Ok(account),
        Some(mut account) => {
            account.registered = true;
            txn.put_account(account.clone());
            Ok(account)
        }
        None => {
            let account = Account::new(id.clone(), true);
            txn.put_account(account.clone());
            tracing::info!(account = %id, "Registered account");
            Ok(account)
        }
    }
}

/// Mint `tokens` for a purchase paid with `paid` wei.
///
/// `paid` must equal `tokens * price_per_token` exactly and the round must be
/// open. The paid value joins the round's contract balance.
pub fn credit(
    txn: &mut LedgerTxn<'_>,
    round: &mut Round,
    id: &AccountId,
    tokens: u64,
    paid: Wei,
) -> LotteryResult<Account> {
    if round.state != RoundState::Open {
        return Err(LotteryError::RoundNotOpen {
            round_id: round.round_id,
            state: round.state,
        });
    }
    if tokens == 0 {
        return Err(LotteryError::invalid_amount("token amount must be at least 1"));
    }

    let expected = round
        .rules
        .value_of(tokens)
        .ok_or_else(|| LotteryError::invalid_amount("token amount overflows price"))?;
    if paid != expected {
        return Err(LotteryError::invalid_amount(format!(
            "paid {} wei for {} tokens, expected {} wei",
            paid, tokens, expected
        )));
    }

    let mut account = txn
        .account(id)?
        .unwrap_or_else(|| Account::new(id.clone(), false));
    let token_balance = account
        .token_balance
        .checked_add(tokens)
        .ok_or_else(|| LotteryError::invalid_amount("token balance overflow"))?;
    let contract_balance = round
        .contract_balance
        .checked_add(paid)
        .ok_or_else(|| LotteryError::invalid_amount("contract balance overflow"))?;
    let tokens_sold = round
        .tokens_sold
        .checked_add(tokens)
        .ok_or_else(|| LotteryError::invalid_amount("tokens sold overflow"))?;
    let purchases = account
        .purchases
        .checked_add(1)
        .ok_or_else(|| LotteryError::invalid_amount("purchase count overflow"))?;

    account.token_balance = token_balance;
    account.purchases = purchases;
    round.contract_balance = contract_balance;
    round.tokens_sold = tokens_sold;
    txn.put_account(account.clone());
    Ok(account)
}

/// Burn `n` tokens from the account
pub fn debit(txn: &mut LedgerTxn<'_>, id: &AccountId, n: u64) -> LotteryResult<Account> {
    let mut account = txn
        .account(id)?
        .unwrap_or_else(|| Account::new(id.clone(), false));
    if account.token_balance < n {
        return Err(LotteryError::InsufficientTokens {
            account: id.clone(),
            balance: account.token_balance,
            required: n,
        });
    }
    account.token_balance -= n;
    txn.put_account(account.clone());
    Ok(account)
}

/// Debit `n` tokens outside a guess while the round is open.
///
/// The burned tokens' value stays in the round's pool.
pub fn burn(txn: &mut LedgerTxn<'_>, round: &mut Round, id: &AccountId, n: u64) -> LotteryResult<Account> {
    if round.state != RoundState::Open {
        return Err(LotteryError::RoundNotOpen {
            round_id: round.round_id,
            state: round.state,
        });
    }
    let tokens_burned = round
        .tokens_burned
        .checked_add(n)
        .ok_or_else(|| LotteryError::invalid_amount("burned token count overflow"))?;
    let account = debit(txn, id, n)?;
    round.tokens_burned = tokens_burned;
    Ok(account)
}

/// Current balance; unknown accounts read as zero and are not created
pub fn balance_of(store: &LedgerStore, id: &AccountId) -> LotteryResult<u64> {
    Ok(store.load_account(id)?.map(|a| a.token_balance).unwrap_or(0))
}
