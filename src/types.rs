//! Core ledger types shared by every engine component

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value in the smallest indivisible unit (1 ether = 10^18 wei)
pub type Wei = u128;

pub const WEI_PER_ETHER: Wei = 1_000_000_000_000_000_000;

/// Opaque participant identifier (usually a hex wallet address)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Participant account; never destroyed, persists across rounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub token_balance: u64,
    /// Set once by an explicit join
    pub registered: bool,
    /// Completed purchases; numbers the idempotency key of the next one
    #[serde(default)]
    pub purchases: u64,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, registered: bool) -> Self {
        Self {
            id,
            token_balance: 0,
            registered,
            purchases: 0,
            created_at: Utc::now(),
        }
    }
}

/// Round lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundState {
    Open,
    Settling,
    Settled,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundState::Open => write!(f, "open"),
            RoundState::Settling => write!(f, "settling"),
            RoundState::Settled => write!(f, "settled"),
        }
    }
}

/// Which matching guess wins when several accounts guessed the winning value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Earliest submission wins
    #[default]
    FirstMatch,
    /// Latest submission wins
    LastMatch,
}

/// Disposition of the pool when nobody guessed the winning value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoWinnerPolicy {
    /// Pool stays in the contract and seeds the next round
    #[default]
    CarryOver,
    /// Pool is transferred to the owner
    ReturnToOwner,
}

/// Game rules frozen into a round when it is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRules {
    pub price_per_token: Wei,
    pub min_guess: u8,
    pub max_guess: u8,
    pub owner: AccountId,
    pub tie_break: TieBreak,
    pub no_winner_policy: NoWinnerPolicy,
}

impl RoundRules {
    pub fn contains(&self, value: i64) -> bool {
        value >= i64::from(self.min_guess) && value <= i64::from(self.max_guess)
    }

    /// Value owed for `tokens` at this round's exchange rate
    pub fn value_of(&self, tokens: u64) -> Option<Wei> {
        self.price_per_token.checked_mul(Wei::from(tokens))
    }
}

/// Verifiable record of how the winning value was drawn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntropyProof {
    /// Name of the entropy source that produced the value
    pub source: String,
    /// Exact input message the source committed to
    pub input_message: String,
    /// Hex-encoded raw output
    pub output: String,
    /// Hex-encoded proof, empty for unproven sources
    pub proof: String,
    /// Hex-encoded public key, empty for unproven sources
    pub public_key: String,
}

/// Settlement outcome, written once by the winner selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub winning_value: u8,
    pub winner: Option<AccountId>,
    /// Submission sequence number of the winning guess
    pub winning_seq: Option<u64>,
    pub entropy: EntropyProof,
    pub computed_at: DateTime<Utc>,
}

/// One lottery game from opening through settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub round_id: u64,
    pub state: RoundState,
    pub rules: RoundRules,
    /// Value currently held for this round
    pub contract_balance: Wei,
    /// Part of `contract_balance` inherited from the previous round
    pub carried_in: Wei,
    pub tokens_sold: u64,
    pub tokens_reimbursed: u64,
    /// Tokens debited outside a guess; their value stays in the pool
    #[serde(default)]
    pub tokens_burned: u64,
    /// Number of guesses; also the next submission sequence number
    pub guess_count: u64,
    /// SHA-256 of the guess log, fixed when the round closes
    pub guess_log_digest: Option<String>,
    pub outcome: Option<RoundOutcome>,
    pub reimbursed: bool,
    pub paid_out: bool,
    /// Value left in the contract for the next round after payout
    pub carried_out: Wei,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Round {
    pub fn open(round_id: u64, rules: RoundRules, carried_in: Wei) -> Self {
        Self {
            round_id,
            state: RoundState::Open,
            rules,
            contract_balance: carried_in,
            carried_in,
            tokens_sold: 0,
            tokens_reimbursed: 0,
            tokens_burned: 0,
            guess_count: 0,
            guess_log_digest: None,
            outcome: None,
            reimbursed: false,
            paid_out: false,
            carried_out: 0,
            opened_at: Utc::now(),
            closed_at: None,
            settled_at: None,
        }
    }

    pub fn winning_value(&self) -> Option<u8> {
        self.outcome.as_ref().map(|o| o.winning_value)
    }

    pub fn winner(&self) -> Option<&AccountId> {
        self.outcome.as_ref().and_then(|o| o.winner.as_ref())
    }

    /// Tokens bought this round that were neither spent nor reimbursed
    pub fn outstanding_tokens(&self) -> u64 {
        self.tokens_sold
            .saturating_sub(self.guess_count)
            .saturating_sub(self.tokens_burned)
            .saturating_sub(self.tokens_reimbursed)
    }
}

/// A single guess as stored in the round's submission log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guess {
    pub round_id: u64,
    /// Position in the round's submission order
    pub seq: u64,
    pub account: AccountId,
    pub value: u8,
}

/// Why value moved in or out of the contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Incoming payment for tokens
    Purchase,
    Reimbursement,
    Payout,
    PoolReturn,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Purchase => write!(f, "purchase"),
            TransferKind::Reimbursement => write!(f, "reimbursement"),
            TransferKind::Payout => write!(f, "payout"),
            TransferKind::PoolReturn => write!(f, "pool_return"),
        }
    }
}

/// Acknowledgement returned by the value-transfer collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: String,
    pub account: AccountId,
    pub amount: Wei,
}

/// Audit entry for every completed outgoing transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub round_id: u64,
    pub kind: TransferKind,
    pub account: AccountId,
    pub amount: Wei,
    /// Tokens converted back to value (reimbursements only)
    pub tokens: u64,
    pub transfer_id: String,
    /// Idempotency key the transfer was executed under
    #[serde(default)]
    pub key: String,
    pub completed_at: DateTime<Utc>,
}

/// A transfer that was announced to the ledger but not yet confirmed.
///
/// Committed before the collaborator is called and removed in the same batch
/// that records the transfer's effect, so a retry after a lost commit reuses
/// the same key and amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferIntent {
    pub key: String,
    pub round_id: u64,
    pub kind: TransferKind,
    pub account: AccountId,
    pub amount: Wei,
    pub tokens: u64,
    pub created_at: DateTime<Utc>,
}

/// Parse a decimal ether amount such as `"0.02"` into wei
pub fn parse_ether(amount: &str) -> Option<Wei> {
    let amount = amount.trim();
    let (whole, frac) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };
    if (whole.is_empty() && frac.is_empty()) || frac.len() > 18 {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole: Wei = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac_wei: Wei = if frac.is_empty() {
        0
    } else {
        let scale = 10u128.pow(18 - frac.len() as u32);
        frac.parse::<Wei>().ok()? * scale
    };

    whole.checked_mul(WEI_PER_ETHER)?.checked_add(frac_wei)
}

/// Render wei as a decimal ether string without trailing zeros
pub fn format_ether(amount: Wei) -> String {
    let whole = amount / WEI_PER_ETHER;
    let frac = amount % WEI_PER_ETHER;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:018}", frac);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}
