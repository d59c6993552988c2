//! Round lifecycle: Open -> Settling -> Settled, then a fresh round.

use crate::{
    errors::{LotteryError, LotteryResult},
    ledger_store::guess_log_digest,
    types::{AccountId, Guess, NoWinnerPolicy, Round, RoundRules, RoundState},
};
use chrono::Utc;

fn require_owner(round: &Round, caller: &AccountId) -> LotteryResult<()> {
    if caller != &round.rules.owner {
        return Err(LotteryError::Unauthorized {
            caller: caller.clone(),
        });
    }
    Ok(())
}

/// Close the round to purchases and guesses.
///
/// `guesses` is the round's submission log at the moment of closing; its
/// digest is frozen into the round for later audit.
pub fn close(round: &mut Round, caller: &AccountId, guesses: &[Guess]) -> LotteryResult<()> {
    require_owner(round, caller)?;
    if round.state != RoundState::Open {
        return Err(LotteryError::InvalidTransition {
            round_id: round.round_id,
            from: round.state,
            to: RoundState::Settling,
        });
    }

    round.state = RoundState::Settling;
    round.guess_log_digest = Some(guess_log_digest(guesses));
    round.closed_at = Some(Utc::now());
    Ok(())
}

/// Move a fully distributed round to Settled.
///
/// Returns `false` when the round was already settled and nothing changed.
pub fn finalize(round: &mut Round) -> LotteryResult<bool> {
    match round.state {
        RoundState::Settled => Ok(false),
        RoundState::Open => Err(LotteryError::InvalidTransition {
            round_id: round.round_id,
            from: RoundState::Open,
            to: RoundState::Settled,
        }),
        RoundState::Settling => {
            if !(round.reimbursed && round.paid_out) {
                return Err(LotteryError::NotDistributed {
                    round_id: round.round_id,
                    reimbursed: round.reimbursed,
                    paid_out: round.paid_out,
                });
            }
            round.state = RoundState::Settled;
            round.settled_at = Some(Utc::now());
            Ok(true)
        }
    }
}

/// Build the successor of a settled round.
///
/// Under [`NoWinnerPolicy::CarryOver`] the previous round's undistributed pool
/// seeds the new round's contract balance.
pub fn open_next(previous: &Round, caller: &AccountId, rules: RoundRules) -> LotteryResult<Round> {
    require_owner(previous, caller)?;
    if previous.state != RoundState::Settled {
        return Err(LotteryError::InvalidTransition {
            round_id: previous.round_id,
            from: previous.state,
            to: RoundState::Open,
        });
    }

    let carried = match previous.rules.no_winner_policy {
        NoWinnerPolicy::CarryOver => previous.carried_out,
        NoWinnerPolicy::ReturnToOwner => 0,
    };
    Ok(Round::open(previous.round_id + 1, rules, carried))
}

/// Require that settlement work may run on this round
pub fn require_settling(round: &Round) -> LotteryResult<()> {
    if round.state != RoundState::Settling {
        return Err(LotteryError::RoundNotSettling {
            round_id: round.round_id,
            state: round.state,
        });
    }
    Ok(())
}
