//! `lottery` command line over a persistent ledger

use clap::{Parser, Subcommand};
use lottery_engine::{
    config::StorageBackend, format_ether, parse_ether, AccountId, EngineConfig, EntropySource, LotteryEngine,
    LotteryError, LotteryResult, PayableLedger, VrfEntropy,
};
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};

/// Lottery settlement engine CLI
#[derive(Parser)]
#[command(name = "lottery")]
#[command(about = "Token lottery ledger with verifiable settlement")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database directory, overrides the configuration
    #[arg(short, long)]
    db: Option<String>,

    /// VRF secret key (hex) used for draws
    #[arg(long, env = "LOTTERY_VRF_SECRET", hide_env_values = true)]
    vrf_secret: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an account
    Register { account: String },

    /// Buy tokens in the current round
    Buy {
        account: String,

        #[arg(short, long, default_value = "1")]
        tokens: u64,

        /// Amount paid in ether, e.g. 0.1; defaults to the exact price
        #[arg(short, long)]
        paid: Option<String>,
    },

    /// Spend one token on a guess
    Guess {
        account: String,

        #[arg(allow_hyphen_values = true)]
        value: i64,
    },

    /// Close the current round (owner only)
    Close {
        #[arg(long)]
        caller: String,
    },

    /// Draw, reimburse, pay out and finalize a closed round.
    ///
    /// Value moves through an in-process payable ledger that lives only for
    /// this invocation. The transfer records printed afterwards are persisted
    /// and are the authoritative list of what was paid.
    Settle {
        /// Round to settle, defaults to the current one
        #[arg(short, long)]
        round: Option<u64>,
    },

    /// Open the next round after settlement (owner only)
    NewRound {
        #[arg(long)]
        caller: String,
    },

    /// Show round state, optionally with one account
    Status {
        #[arg(short, long)]
        round: Option<u64>,

        #[arg(short, long)]
        account: Option<String>,
    },
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("error[{}]: {}", e.kind(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> LotteryResult<()> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_toml_file(path)?,
        None => EngineConfig::production(),
    };
    if let Some(db) = &cli.db {
        config.storage.backend = StorageBackend::Rocksdb;
        config.storage.data_directory = db.clone();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.monitoring.log_level.as_filter().into()),
        )
        .init();

    let entropy: Arc<dyn EntropySource> = match &cli.vrf_secret {
        Some(secret) => Arc::new(
            VrfEntropy::from_secret_hex(secret).map_err(|e| LotteryError::InvalidEntropy(e.to_string()))?,
        ),
        None => {
            let vrf = VrfEntropy::new_random();
            warn!(public_key = %vrf.public_key_hex(), "No VRF secret configured, using an ephemeral key");
            Arc::new(vrf)
        }
    };

    // Payable balances are not persisted; the ledger's transfer records are.
    let engine = LotteryEngine::open(config, Arc::new(PayableLedger::new()), entropy)?;

    match cli.command {
        Commands::Register { account } => {
            let account = engine.register(&AccountId::new(account))?;
            println!("registered {}", account.id);
        }
        Commands::Buy { account, tokens, paid } => {
            let id = AccountId::new(account);
            let price = engine.current_round()?.rules.price_per_token;
            let paid = match paid {
                Some(raw) => parse_ether(&raw)
                    .ok_or_else(|| LotteryError::InvalidAmount {
                        reason: format!("cannot parse '{}' as an ether amount", raw),
                    })?,
                None => price.saturating_mul(u128::from(tokens)),
            };
            let account = engine.credit(&id, tokens, paid)?;
            println!(
                "{} bought {} tokens for {} ether, balance {}",
                id,
                tokens,
                format_ether(paid),
                account.token_balance
            );
        }
        Commands::Guess { account, value } => {
            let guess = engine.submit_guess(&AccountId::new(account), value)?;
            println!("guess #{} recorded: {} -> {}", guess.seq, guess.account, guess.value);
        }
        Commands::Close { caller } => {
            let round = engine.close(&AccountId::new(caller))?;
            println!("round {} closed with {} guesses", round.round_id, round.guess_count);
        }
        Commands::Settle { round } => {
            let round_id = match round {
                Some(id) => id,
                None => engine.current_round()?.round_id,
            };
            let settled = engine.settle(round_id)?;
            match settled.winner() {
                Some(winner) => println!(
                    "round {} settled: winning value {}, winner {}",
                    round_id,
                    settled.winning_value().unwrap_or_default(),
                    winner
                ),
                None => println!(
                    "round {} settled: winning value {}, no winner, {} ether carried",
                    round_id,
                    settled.winning_value().unwrap_or_default(),
                    format_ether(settled.carried_out)
                ),
            }
            let records = engine.transfers(round_id)?;
            println!("recorded transfers for round {} ({}):", round_id, records.len());
            for record in records {
                println!(
                    "  {} {} ether -> {} [{}]",
                    record.kind,
                    format_ether(record.amount),
                    record.account,
                    record.transfer_id
                );
            }
            for pending in engine.pending_transfers(round_id)? {
                println!(
                    "  unconfirmed {} {} ether -> {}",
                    pending.kind,
                    format_ether(pending.amount),
                    pending.account
                );
            }
        }
        Commands::NewRound { caller } => {
            let round = engine.open_next_round(&AccountId::new(caller))?;
            println!(
                "round {} opened with {} ether carried in",
                round.round_id,
                format_ether(round.carried_in)
            );
        }
        Commands::Status { round, account } => {
            let round = match round {
                Some(id) => engine.round(id)?,
                None => engine.current_round()?,
            };
            println!("round:            {}", round.round_id);
            println!("state:            {}", round.state);
            println!("owner:            {}", round.rules.owner);
            println!("price per token:  {} ether", format_ether(round.rules.price_per_token));
            println!("guess range:      {}..={}", round.rules.min_guess, round.rules.max_guess);
            println!("contract balance: {} ether", format_ether(round.contract_balance));
            println!("tokens sold:      {}", round.tokens_sold);
            println!("guesses:          {}", round.guess_count);
            if let Some(value) = round.winning_value() {
                println!("winning value:    {}", value);
                println!(
                    "winner:           {}",
                    round.winner().map(AccountId::as_str).unwrap_or("none")
                );
                println!("draw verified:    {}", engine.verify_entropy(round.round_id)?);
            }
            if let Some(account) = account {
                let id = AccountId::new(account);
                let registered = engine.account(&id)?.map(|a| a.registered).unwrap_or(false);
                println!("account {}: balance {}, registered {}", id, engine.balance_of(&id)?, registered);
                for guess in engine.guesses_of(&id, round.round_id)? {
                    println!("  guess #{}: {}", guess.seq, guess.value);
                }
            }
        }
    }

    info!("Done");
    Ok(())
}
