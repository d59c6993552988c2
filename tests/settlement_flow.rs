//! End-to-end settlement scenarios against an in-memory ledger

use lottery_engine::{
    config::EngineConfig, parse_ether, storage::WriteBatch, AccountId, FixedEntropy, KvStore, LotteryEngine,
    LotteryError, LotteryResult, MemoryStore, NoWinnerPolicy, PayableLedger, RoundState, StorageError, TieBreak,
    TransferError, TransferKind, VrfEntropy, Wei,
};
use std::sync::{Arc, Mutex};

const PRICE: Wei = 20_000_000_000_000_000;

struct Harness {
    engine: LotteryEngine,
    payments: PayableLedger,
    owner: AccountId,
}

fn harness_with(config: EngineConfig, winning_value: u8) -> Harness {
    let payments = PayableLedger::new();
    let owner = AccountId::new(config.game.owner.clone());
    let engine = LotteryEngine::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(payments.clone()),
        Arc::new(FixedEntropy::new(winning_value)),
    )
    .expect("engine");
    Harness {
        engine,
        payments,
        owner,
    }
}

fn harness(winning_value: u8) -> Harness {
    harness_with(EngineConfig::development(), winning_value)
}

fn id(s: &str) -> AccountId {
    AccountId::from(s)
}

#[test]
fn test_purchase_requires_exact_payment() {
    let h = harness(3);
    let a = id("0xa");

    let ok = parse_ether("0.1").unwrap();
    h.engine.credit(&a, 5, ok).expect("0.1 ether buys 5 tokens");
    assert_eq!(h.engine.balance_of(&a).unwrap(), 5);

    let short = parse_ether("0.09").unwrap();
    let err = h.engine.credit(&a, 5, short).unwrap_err();
    assert!(matches!(err, LotteryError::InvalidAmount { .. }));
    assert_eq!(h.engine.balance_of(&a).unwrap(), 5);
    assert_eq!(h.engine.contract_balance().unwrap(), ok);
}

#[test]
fn test_first_matching_guess_wins() {
    let h = harness(3);
    for (who, value) in [("A", 3), ("B", 7), ("C", 3)] {
        h.engine.credit(&id(who), 1, PRICE).unwrap();
        h.engine.submit_guess(&id(who), value).unwrap();
    }
    assert_eq!(
        h.engine.all_guesses(1).unwrap(),
        vec![(id("A"), 3), (id("B"), 7), (id("C"), 3)]
    );

    h.engine.close(&h.owner).unwrap();
    h.engine.compute_winner(1).unwrap();
    assert_eq!(h.engine.winning_value(1).unwrap(), Some(3));
    assert_eq!(h.engine.winner(1).unwrap(), Some(id("A")));

    let err = h.engine.compute_winner(1).unwrap_err();
    assert!(matches!(err, LotteryError::AlreadyComputed { round_id: 1 }));
    assert_eq!(h.engine.winner(1).unwrap(), Some(id("A")));
}

#[test]
fn test_last_match_tie_break() {
    let mut config = EngineConfig::development();
    config.game.tie_break = TieBreak::LastMatch;
    let h = harness_with(config, 3);
    for (who, value) in [("A", 3), ("B", 7), ("C", 3)] {
        h.engine.credit(&id(who), 1, PRICE).unwrap();
        h.engine.submit_guess(&id(who), value).unwrap();
    }
    h.engine.close(&h.owner).unwrap();
    h.engine.settle(1).unwrap();
    assert_eq!(h.engine.winner(1).unwrap(), Some(id("C")));
    assert_eq!(h.payments.payable_of(&id("C")), 3 * PRICE);
}

#[test]
fn test_guess_range_boundaries() {
    let h = harness(3);
    let a = id("0xa");
    h.engine.credit(&a, 2, 2 * PRICE).unwrap();

    for bad in [0, 11] {
        let err = h.engine.submit_guess(&a, bad).unwrap_err();
        assert!(matches!(err, LotteryError::GuessOutOfRange { .. }));
    }
    assert_eq!(h.engine.balance_of(&a).unwrap(), 2);

    h.engine.submit_guess(&a, 1).unwrap();
    h.engine.submit_guess(&a, 10).unwrap();
    assert_eq!(h.engine.balance_of(&a).unwrap(), 0);
    assert_eq!(
        h.engine
            .guesses_of(&a, 1)
            .unwrap()
            .iter()
            .map(|g| g.value)
            .collect::<Vec<_>>(),
        vec![1, 10]
    );
}

#[test]
fn test_closed_round_rejects_everyone() {
    let h = harness(3);
    let a = id("0xa");
    h.engine.credit(&a, 1, PRICE).unwrap();
    h.engine.credit(&h.owner, 1, PRICE).unwrap();

    let err = h.engine.close(&a).unwrap_err();
    assert!(matches!(err, LotteryError::Unauthorized { .. }));
    h.engine.close(&h.owner).unwrap();

    for who in [&a, &h.owner] {
        assert!(matches!(
            h.engine.credit(who, 1, PRICE),
            Err(LotteryError::RoundNotOpen { .. })
        ));
        assert!(matches!(
            h.engine.submit_guess(who, 3),
            Err(LotteryError::RoundNotOpen { .. })
        ));
    }
    assert!(matches!(
        h.engine.close(&h.owner),
        Err(LotteryError::InvalidTransition { .. })
    ));
}

#[test]
fn test_settlement_steps_in_order() {
    let h = harness(4);
    let (a, b) = (id("0xa"), id("0xb"));
    h.engine.register(&a).unwrap();
    h.engine.credit(&a, 3, 3 * PRICE).unwrap();
    h.engine.credit(&b, 2, 2 * PRICE).unwrap();
    h.engine.submit_guess(&a, 2).unwrap();
    h.engine.submit_guess(&b, 4).unwrap();

    assert!(matches!(h.engine.compute_winner(1), Err(LotteryError::RoundNotSettling { .. })));
    assert!(matches!(h.engine.reimburse(1), Err(LotteryError::RoundNotSettling { .. })));
    assert!(matches!(h.engine.finalize(1), Err(LotteryError::InvalidTransition { .. })));

    h.engine.close(&h.owner).unwrap();
    assert!(matches!(h.engine.payout(1), Err(LotteryError::WinnerNotComputed { .. })));
    h.engine.compute_winner(1).unwrap();

    assert!(matches!(
        h.engine.finalize(1),
        Err(LotteryError::NotDistributed { reimbursed: false, paid_out: false, .. })
    ));

    let reimbursed = h.engine.reimburse(1).unwrap();
    assert_eq!(reimbursed.len(), 2);
    assert_eq!(h.payments.payable_of(&a), 2 * PRICE);
    assert_eq!(h.payments.payable_of(&b), PRICE);
    assert!(h.engine.reimburse(1).unwrap().is_empty());

    let paid = h.engine.payout(1).unwrap().expect("winner paid");
    assert_eq!(paid.account, b);
    assert_eq!(paid.amount, 2 * PRICE);
    assert!(h.engine.payout(1).unwrap().is_none());

    let round = h.engine.finalize(1).unwrap();
    assert_eq!(round.state, RoundState::Settled);
    assert_eq!(round.contract_balance, 0);
    assert_eq!(h.engine.finalize(1).unwrap().state, RoundState::Settled);

    assert_eq!(h.payments.total_paid_out(), h.payments.total_received());
}

#[test]
fn test_token_conservation() {
    let h = harness(9);
    let buyers = [("0xa", 4u64), ("0xb", 2), ("0xc", 5)];
    for (who, n) in buyers {
        h.engine.credit(&id(who), n, Wei::from(n) * PRICE).unwrap();
    }
    h.engine.submit_guess(&id("0xa"), 1).unwrap();
    h.engine.submit_guess(&id("0xa"), 2).unwrap();
    h.engine.submit_guess(&id("0xc"), 5).unwrap();
    assert!(h.engine.submit_guess(&id("0xd"), 5).is_err());

    let credited: u64 = buyers.iter().map(|(_, n)| n).sum();
    let balances = |h: &Harness| -> u64 {
        buyers
            .iter()
            .map(|(who, _)| h.engine.balance_of(&id(who)).unwrap())
            .sum()
    };
    let round = h.engine.current_round().unwrap();
    assert_eq!(balances(&h) + round.guess_count, credited);

    h.engine.close(&h.owner).unwrap();
    let settled = h.engine.settle(1).unwrap();
    assert_eq!(balances(&h), 0);
    assert_eq!(settled.guess_count + settled.tokens_reimbursed, credited);
}

#[test]
fn test_transfer_failure_is_retriable() {
    let h = harness(3);
    let (a, b) = (id("0xa"), id("0xb"));
    h.engine.credit(&a, 2, 2 * PRICE).unwrap();
    h.engine.credit(&b, 2, 2 * PRICE).unwrap();
    h.engine.submit_guess(&a, 3).unwrap();
    h.engine.close(&h.owner).unwrap();
    h.engine.compute_winner(1).unwrap();

    h.payments.fail_next(TransferError::Transient("gas spike".to_string()));
    let err = h.engine.reimburse(1).unwrap_err();
    assert!(matches!(err, LotteryError::TransferFailed { .. }));
    assert_eq!(h.engine.round(1).unwrap().state, RoundState::Settling);
    assert_eq!(h.engine.balance_of(&a).unwrap(), 1);

    h.engine.reimburse(1).unwrap();
    h.engine.reimburse(1).unwrap();
    assert_eq!(h.payments.payable_of(&a), PRICE);
    assert_eq!(h.payments.payable_of(&b), 2 * PRICE);

    h.engine.payout(1).unwrap();
    h.engine.finalize(1).unwrap();
    let kinds: Vec<_> = h.engine.transfers(1).unwrap().iter().map(|r| r.kind).collect();
    assert_eq!(kinds.iter().filter(|k| **k == TransferKind::Reimbursement).count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == TransferKind::Payout).count(), 1);
    assert_eq!(h.payments.payable_of(&a), 2 * PRICE);
}

#[test]
fn test_no_winner_pool_returns_to_owner() {
    let mut config = EngineConfig::development();
    config.game.no_winner_policy = NoWinnerPolicy::ReturnToOwner;
    let h = harness_with(config, 10);
    h.engine.credit(&id("0xa"), 1, PRICE).unwrap();
    h.engine.submit_guess(&id("0xa"), 1).unwrap();

    h.engine.close(&h.owner).unwrap();
    h.engine.settle(1).unwrap();
    assert_eq!(h.engine.winner(1).unwrap(), None);
    assert_eq!(h.payments.payable_of(&h.owner), PRICE);

    let next = h.engine.open_next_round(&h.owner).unwrap();
    assert_eq!(next.contract_balance, 0);
}

#[test]
fn test_empty_round_settles_without_transfers() {
    let h = harness(5);
    h.engine.close(&h.owner).unwrap();
    let round = h.engine.settle(1).unwrap();
    assert_eq!(round.state, RoundState::Settled);
    assert!(round.winner().is_none());
    assert!(h.payments.payments().is_empty());
}

#[test]
fn test_next_round_starts_clean() {
    let h = harness(3);
    let a = id("0xa");
    h.engine.credit(&a, 1, PRICE).unwrap();
    h.engine.submit_guess(&a, 3).unwrap();
    h.engine.close(&h.owner).unwrap();
    h.engine.settle(1).unwrap();

    assert!(matches!(
        h.engine.open_next_round(&a),
        Err(LotteryError::Unauthorized { .. })
    ));
    let next = h.engine.open_next_round(&h.owner).unwrap();
    assert_eq!(next.round_id, 2);
    assert_eq!(next.state, RoundState::Open);

    h.engine.credit(&a, 1, PRICE).unwrap();
    h.engine.submit_guess(&a, 5).unwrap();
    assert!(h.engine.guesses_of(&a, 2).unwrap().len() == 1);
    assert!(h.engine.guesses_of(&a, 1).unwrap().len() == 1);
    assert!(h.engine.account(&a).unwrap().is_some());
    assert_eq!(h.engine.round(1).unwrap().state, RoundState::Settled);
}

#[test]
fn test_vrf_draw_is_verifiable() {
    let payments = PayableLedger::new();
    let config = EngineConfig::development();
    let owner = AccountId::new(config.game.owner.clone());
    let engine = LotteryEngine::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(payments),
        Arc::new(VrfEntropy::new_random()),
    )
    .unwrap();

    for who in ["0xa", "0xb", "0xc"] {
        engine.credit(&id(who), 3, 3 * PRICE).unwrap();
        for value in 1..=3 {
            engine.submit_guess(&id(who), value).unwrap();
        }
    }
    engine.close(&owner).unwrap();
    let outcome = engine.compute_winner(1).unwrap();

    assert!((1..=10).contains(&outcome.winning_value));
    assert_eq!(outcome.entropy.source, "vrf");
    assert!(engine.verify_entropy(1).unwrap());
}

#[test]
fn test_concurrent_guesses_keep_ledger_consistent() {
    let h = harness(7);
    let players: Vec<AccountId> = (0..8).map(|i| id(&format!("0x{:02x}", i))).collect();
    for p in &players {
        h.engine.credit(p, 10, 10 * PRICE).unwrap();
    }

    std::thread::scope(|s| {
        for (i, p) in players.iter().enumerate() {
            let engine = &h.engine;
            s.spawn(move || {
                for n in 0..12 {
                    let _ = engine.submit_guess(p, ((i + n) % 10 + 1) as i64);
                    let _ = engine.balance_of(p);
                    let _ = engine.all_guesses(1);
                }
            });
        }
    });

    // Each player had 10 tokens and tried 12 guesses.
    let log = h.engine.all_guesses(1).unwrap();
    assert_eq!(log.len(), 80);
    for p in &players {
        assert_eq!(h.engine.balance_of(p).unwrap(), 0);
        assert_eq!(h.engine.guesses_of(p, 1).unwrap().len(), 10);
    }
    let seqs: Vec<u64> = h
        .engine
        .guesses_of(&players[0], 1)
        .unwrap()
        .iter()
        .map(|g| g.seq)
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(h.engine.current_round().unwrap().guess_count, 80);
}

#[test]
fn test_close_is_linearizable_with_guesses() {
    let h = harness(1);
    let players: Vec<AccountId> = (0..4).map(|i| id(&format!("0xp{}", i))).collect();
    for p in &players {
        h.engine.credit(p, 50, 50 * PRICE).unwrap();
    }

    std::thread::scope(|s| {
        for p in &players {
            let engine = &h.engine;
            s.spawn(move || {
                for _ in 0..50 {
                    if engine.submit_guess(p, 1).is_err() {
                        break;
                    }
                }
            });
        }
        let engine = &h.engine;
        let owner = &h.owner;
        s.spawn(move || engine.close(owner).unwrap());
    });

    let round = h.engine.round(1).unwrap();
    let accepted = h.engine.all_guesses(1).unwrap().len() as u64;
    assert_eq!(round.guess_count, accepted);
    let remaining: u64 = players.iter().map(|p| h.engine.balance_of(p).unwrap()).sum();
    assert_eq!(remaining + accepted, 200);

    let settled = h.engine.settle(1).unwrap();
    assert_eq!(settled.contract_balance, 0);
}

/// Memory store whose n-th write from arming fails, as a crash before commit would
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_in: Mutex<Option<usize>>,
}

impl FlakyStore {
    /// Fail the `nth` write from now (1 = the next one)
    fn fail_write(&self, nth: usize) {
        *self.fail_in.lock().unwrap() = Some(nth - 1);
    }
}

impl KvStore for FlakyStore {
    fn get(&self, key: &[u8]) -> LotteryResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> LotteryResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan_prefix(prefix)
    }

    fn write(&self, batch: WriteBatch) -> LotteryResult<()> {
        let mut fail_in = self.fail_in.lock().unwrap();
        match *fail_in {
            Some(0) => {
                *fail_in = None;
                Err(StorageError::WriteFailed("disk full".to_string()).into())
            }
            Some(n) => {
                *fail_in = Some(n - 1);
                self.inner.write(batch)
            }
            None => self.inner.write(batch),
        }
    }
}

fn flaky_harness(winning_value: u8) -> (Harness, Arc<FlakyStore>) {
    let config = EngineConfig::development();
    let store = Arc::new(FlakyStore::default());
    let payments = PayableLedger::new();
    let owner = AccountId::new(config.game.owner.clone());
    let engine = LotteryEngine::new(
        config,
        store.clone(),
        Arc::new(payments.clone()),
        Arc::new(FixedEntropy::new(winning_value)),
    )
    .expect("engine");
    (
        Harness {
            engine,
            payments,
            owner,
        },
        store,
    )
}

#[test]
fn test_lost_reimbursement_commit_does_not_pay_twice() {
    let (h, store) = flaky_harness(9);
    let a = id("0xa");
    h.engine.credit(&a, 2, 2 * PRICE).unwrap();
    h.engine.submit_guess(&a, 5).unwrap();
    h.engine.close(&h.owner).unwrap();
    h.engine.compute_winner(1).unwrap();

    // Intent commits, the transfer goes through, the completion is lost.
    store.fail_write(2);
    let err = h.engine.reimburse(1).unwrap_err();
    assert!(matches!(err, LotteryError::Storage(StorageError::WriteFailed(_))));
    assert_eq!(h.payments.payable_of(&a), PRICE);
    assert_eq!(h.engine.balance_of(&a).unwrap(), 1);
    assert_eq!(h.engine.pending_transfers(1).unwrap().len(), 1);

    h.engine.reimburse(1).unwrap();
    assert_eq!(h.payments.payments(), vec![(a.clone(), PRICE, TransferKind::Reimbursement)]);
    assert_eq!(h.engine.balance_of(&a).unwrap(), 0);
    assert!(h.engine.pending_transfers(1).unwrap().is_empty());

    let settled = h.engine.settle(1).unwrap();
    assert_eq!(settled.carried_out, PRICE);
    assert_eq!(h.payments.total_paid_out(), PRICE);
}

#[test]
fn test_lost_payout_commit_does_not_pay_twice() {
    let (h, store) = flaky_harness(4);
    let a = id("0xa");
    h.engine.credit(&a, 3, 3 * PRICE).unwrap();
    for _ in 0..3 {
        h.engine.submit_guess(&a, 4).unwrap();
    }
    h.engine.close(&h.owner).unwrap();
    h.engine.compute_winner(1).unwrap();
    h.engine.reimburse(1).unwrap();

    store.fail_write(2);
    assert!(h.engine.payout(1).is_err());
    assert!(!h.engine.round(1).unwrap().paid_out);

    let settled = h.engine.settle(1).unwrap();
    assert_eq!(settled.state, RoundState::Settled);
    assert_eq!(h.payments.payable_of(&a), 3 * PRICE);
    assert_eq!(h.payments.payments().len(), 1);
    assert_eq!(h.engine.transfers(1).unwrap().len(), 1);
}

#[test]
fn test_lost_purchase_commit_does_not_charge_twice() {
    let (h, store) = flaky_harness(3);
    let a = id("0xa");

    store.fail_write(2);
    assert!(h.engine.credit(&a, 1, PRICE).is_err());
    assert_eq!(h.payments.received_from(&a), PRICE);
    assert_eq!(h.engine.balance_of(&a).unwrap(), 0);

    h.engine.credit(&a, 1, PRICE).unwrap();
    assert_eq!(h.payments.received_from(&a), PRICE);
    assert_eq!(h.engine.balance_of(&a).unwrap(), 1);
    assert_eq!(h.engine.contract_balance().unwrap(), PRICE);
    assert!(h.engine.pending_transfers(1).unwrap().is_empty());

    // The next purchase is a new one and is charged.
    h.engine.credit(&a, 1, PRICE).unwrap();
    assert_eq!(h.payments.received_from(&a), 2 * PRICE);
}
