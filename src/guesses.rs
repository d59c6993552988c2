//! Guess registry: one token buys one guess in the open round.

use crate::{
    accounts,
    errors::{LotteryError, LotteryResult},
    ledger_store::{LedgerStore, LedgerTxn},
    types::{AccountId, Guess, Round, RoundState},
};

/// Debit one token and append the guess to the round's submission log.
///
/// Both effects are staged in the same transaction, so a guess is never
/// visible without its debit and a failed debit appends nothing.
pub fn submit_guess(
    txn: &mut LedgerTxn<'_>,
    round: &mut Round,
    id: &AccountId,
    value: i64,
) -> LotteryResult<Guess> {
    if round.state != RoundState::Open {
        return Err(LotteryError::RoundNotOpen {
            round_id: round.round_id,
            state: round.state,
        });
    }
    if !round.rules.contains(value) {
        return Err(LotteryError::GuessOutOfRange {
            value,
            min: round.rules.min_guess,
            max: round.rules.max_guess,
        });
    }
    // Range check above guarantees the value fits the rule bounds.
    let value = u8::try_from(value).map_err(|_| LotteryError::GuessOutOfRange {
        value,
        min: round.rules.min_guess,
        max: round.rules.max_guess,
    })?;

    let next_count = round
        .guess_count
        .checked_add(1)
        .ok_or_else(|| LotteryError::invalid_amount("guess count overflow"))?;

    accounts::debit(txn, id, 1)?;

    let guess = Guess {
        round_id: round.round_id,
        seq: round.guess_count,
        account: id.clone(),
        value,
    };
    txn.append_guess(guess.clone())?;
    round.guess_count = next_count;
    Ok(guess)
}

/// One account's guesses in a round, in submission order
pub fn guesses_of(store: &LedgerStore, id: &AccountId, round_id: u64) -> LotteryResult<Vec<Guess>> {
    store.load_guesses_of(round_id, id)
}

/// Every guess of a round as `(account, value)` in submission order
pub fn all_guesses(store: &LedgerStore, round_id: u64) -> LotteryResult<Vec<(AccountId, u8)>> {
    Ok(store
        .load_round_guesses(round_id)?
        .into_iter()
        .map(|g| (g.account, g.value))
        .collect())
}
