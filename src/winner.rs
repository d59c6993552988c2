//! Winner selection over a closed guess log.

use crate::{
    entropy::{DrawRequest, EntropySource},
    errors::{LotteryError, LotteryResult},
    round::require_settling,
    types::{Guess, Round, RoundOutcome, TieBreak},
};
use chrono::Utc;

/// Pick the winning guess for `winning_value` under `tie_break`.
///
/// Deterministic: the same log and value always select the same guess.
pub fn select<'g>(guesses: &'g [Guess], winning_value: u8, tie_break: TieBreak) -> Option<&'g Guess> {
    let mut matches = guesses.iter().filter(|g| g.value == winning_value);
    match tie_break {
        TieBreak::FirstMatch => matches.next(),
        TieBreak::LastMatch => matches.last(),
    }
}

/// Draw the winning value and record the round's outcome. Write-once.
pub fn compute_winner(
    round: &mut Round,
    guesses: &[Guess],
    entropy: &dyn EntropySource,
) -> LotteryResult<RoundOutcome> {
    if round.outcome.is_some() {
        return Err(LotteryError::AlreadyComputed {
            round_id: round.round_id,
        });
    }
    require_settling(round)?;

    let request = DrawRequest {
        round_id: round.round_id,
        min: round.rules.min_guess,
        max: round.rules.max_guess,
        guess_log_digest: round.guess_log_digest.clone().unwrap_or_default(),
    };
    let draw = entropy
        .draw(&request)
        .map_err(|e| LotteryError::InvalidEntropy(e.to_string()))?;
    if !round.rules.contains(i64::from(draw.value)) {
        return Err(LotteryError::InvalidEntropy(format!(
            "drawn value {} outside {}..={}",
            draw.value, round.rules.min_guess, round.rules.max_guess
        )));
    }

    let winning = select(guesses, draw.value, round.rules.tie_break);
    let outcome = RoundOutcome {
        winning_value: draw.value,
        winner: winning.map(|g| g.account.clone()),
        winning_seq: winning.map(|g| g.seq),
        entropy: draw.proof,
        computed_at: Utc::now(),
    };
    round.outcome = Some(outcome.clone());
    Ok(outcome)
}
