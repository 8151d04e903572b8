use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tally_bank::http::{build_client, HttpAggregator, HttpTokenClient};
use tally_bank::{
    BankError, BankSync, ClientSecrets, Clock, FileCredentialStore, ResumeOutcome, SqliteStore, Storage,
    SystemClock, TokenManager,
};
use tally_core::{MatchType, NewRule};
use tracing::{debug, info};

mod auth;
mod config;
mod export;
mod logging;
mod state;

const BUILD_SHA: &str = env!("TALLY_BUILD_SHA");

#[derive(Parser, Debug)]
#[command(name = "tally", version, about = "Bank link, sync and categorization")]
struct Cli {
    /// Debug logging (TALLY_LOG still wins)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write ~/.tally/config.toml with defaults
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Aggregator application secrets
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },

    /// Banks the aggregator can connect to in a country
    Institutions {
        #[arg(long, default_value = "DK")]
        country: String,
    },

    /// Connect a bank
    Link {
        #[command(subcommand)]
        command: LinkCommand,
    },

    /// Fetch accounts and transactions for all linked banks
    Sync {
        #[arg(long)]
        user: String,
    },

    /// Last sync and whether another one is due
    Status {
        #[arg(long)]
        user: String,
    },

    /// Categorization rules
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },

    /// Suggest, set or backfill transaction categories
    Categorize {
        #[command(subcommand)]
        command: CategorizeCommand,
    },

    Transactions {
        #[command(subcommand)]
        command: TransactionsCommand,
    },

    /// Print build info
    Version,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Paste secret id and key into ~/.tally/auth.json
    PasteSecrets,
}

#[derive(Subcommand, Debug)]
enum LinkCommand {
    /// Create a link and print the bank URL to open
    Start {
        #[arg(long)]
        user: String,
        /// Key from [institutions] in config.toml, or a raw institution id
        #[arg(long)]
        institution: String,
        /// Idempotent reference; reusing one returns the in-flight link
        #[arg(long)]
        reference: Option<String>,
    },
    /// Run after returning from the bank
    Resume {
        #[arg(long)]
        user: String,
    },
    Find {
        #[arg(long)]
        user: String,
        #[arg(long)]
        reference: String,
    },
    List {
        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand, Debug)]
enum RulesCommand {
    Add {
        #[arg(long)]
        user: String,
        #[arg(long)]
        keyword: String,
        #[arg(long)]
        category: String,
        /// contains | starts_with | ends_with | exact | regex
        #[arg(long = "match", default_value = "contains")]
        match_type: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    List {
        #[arg(long)]
        user: String,
    },
    Remove {
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: i64,
    },
}

#[derive(Subcommand, Debug)]
enum CategorizeCommand {
    /// Show what the resolver would pick, without saving
    Suggest {
        #[arg(long)]
        user: String,
        #[arg(long)]
        txn: i64,
    },
    /// Manual override
    Set {
        #[arg(long)]
        user: String,
        #[arg(long)]
        txn: i64,
        #[arg(long)]
        category: String,
    },
    /// Categorize every transaction that has no category yet
    Backfill {
        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand, Debug)]
enum TransactionsCommand {
    List {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Write all transactions to CSV
    Export {
        #[arg(long)]
        user: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Error: {err:#}");
        if err.downcast_ref::<BankError>().is_some_and(BankError::needs_reconnect) {
            eprintln!("Your bank connection needs attention. Reconnect with: tally link start");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = config::load_config()?;
    logging::init_logging(&cfg.log, cli.verbose);

    match cli.command {
        Command::Config { command: ConfigCommand::Init } => config::init_config()?,

        Command::Auth { command: AuthCommand::PasteSecrets } => auth::paste_secrets()?,

        Command::Version => println!("tally {} ({BUILD_SHA})", env!("CARGO_PKG_VERSION")),

        Command::Institutions { country } => {
            let bank = open_bank(&cfg, true)?;
            let mut list = bank.list_institutions(&country).await?;
            list.sort_by(|a, b| a.name.cmp(&b.name));
            for inst in list {
                let key = bank.institution_map().key_for(&inst.id).unwrap_or("-");
                let days = inst
                    .transaction_total_days
                    .map(|d| format!("{d}d"))
                    .unwrap_or_else(|| "?".to_string());
                println!("{:<40} {:<12} {:>6}  {}", inst.id, key, days, inst.name);
            }
        }

        Command::Link { command } => {
            let bank = open_bank(&cfg, true)?;
            link_command(&bank, command).await?;
        }

        Command::Sync { user } => {
            let bank = open_bank(&cfg, true)?;
            info!(user = %user, "manual sync");
            let summary = bank.sync(&user).await?;
            println!(
                "Synced {} account(s): {} new account(s), {} new transaction(s), {} updated, {} categorized",
                summary.accounts_seen,
                summary.new_accounts,
                summary.new_transactions,
                summary.updated_transactions,
                summary.categorized
            );
            for e in &summary.errors {
                println!("  ! {}: {}", e.external_account_id, e.message);
            }
            if summary.all_failed() {
                bail!("every account failed to sync");
            }
        }

        Command::Status { user } => {
            let bank = open_bank(&cfg, false)?;
            let status = bank.get_sync_status(&user).await?;
            match (status.last_sync, status.status) {
                (Some(at), Some(s)) => println!("Last sync: {} ({})", at.to_rfc3339(), s.as_str()),
                _ => println!("Last sync: never"),
            }
            if let Some(err) = status.last_error {
                println!("Last error: {err}");
            }
            println!("Needs sync: {}", if status.needs_sync { "yes" } else { "no" });
        }

        Command::Rules { command } => {
            let bank = open_bank(&cfg, false)?;
            rules_command(&bank, command).await?;
        }

        Command::Categorize { command } => {
            let bank = open_bank(&cfg, false)?;
            match command {
                CategorizeCommand::Suggest { user, txn } => {
                    let r = bank.resolve_category(&user, txn).await?;
                    match r.rule_id {
                        Some(id) => println!("{} (rule {id})", r.category),
                        None => println!("{} ({})", r.category, r.source.as_str()),
                    }
                }
                CategorizeCommand::Set { user, txn, category } => {
                    bank.set_user_category(&user, txn, &category).await?;
                    println!("Transaction {txn} → {}", category.trim());
                }
                CategorizeCommand::Backfill { user } => {
                    let n = bank.recategorize_uncategorized(&user).await?;
                    println!("Categorized {n} transaction(s)");
                }
            }
        }

        Command::Transactions { command } => {
            let bank = open_bank(&cfg, false)?;
            match command {
                TransactionsCommand::List { user, limit } => {
                    for t in bank.transactions(&user).await?.iter().take(limit) {
                        println!(
                            "{:>6}  {}  {:>12.2} {}  {:<20}  {}",
                            t.id,
                            t.date,
                            t.amount,
                            t.currency,
                            t.effective_category(),
                            t.description
                        );
                    }
                }
                TransactionsCommand::Export { user, out } => {
                    let accounts = bank.store().list_accounts(&user).await?;
                    let txns = bank.transactions(&user).await?;
                    let n = export::export_to_path(&out, &accounts, &txns)?;
                    info!(user = %user, rows = n, path = %out.display(), "export written");
                    println!("Wrote {n} transaction(s) to {}", out.display());
                }
            }
        }
    }

    Ok(())
}

async fn link_command(bank: &BankSync, command: LinkCommand) -> Result<()> {
    match command {
        LinkCommand::Start {
            user,
            institution,
            reference,
        } => {
            let start = bank.start_link(&user, &institution, reference.as_deref()).await?;
            println!("Open this URL to authenticate with your bank:\n  {}", start.redirect_url);
            println!("Reference: {} (link {})", start.reference, start.link_id);
            println!("When you are back, run: tally link resume --user {user}");
        }
        LinkCommand::Resume { user } => match bank.on_app_foreground_after_link(&user).await? {
            ResumeOutcome::Linked(s) => {
                println!("Bank linked. {} new transaction(s).", s.new_transactions)
            }
            ResumeOutcome::LinkedAwaitingData(_) => {
                println!("Bank linked. Your bank has not sent transactions yet; try `tally sync` later.")
            }
            ResumeOutcome::StillAwaiting => {
                println!("Still waiting for you to finish at the bank.")
            }
            ResumeOutcome::NoPendingLinks => println!("No pending bank links."),
        },
        LinkCommand::Find { user, reference } => match bank.find_link_by_reference(&user, &reference).await? {
            Some(link) => println!("{} {} {}", link.link_id, link.status.as_str(), link.institution_id),
            None => bail!("no link with reference {reference}"),
        },
        LinkCommand::List { user } => {
            for link in bank.links(&user).await? {
                println!(
                    "{:<38} {:<24} {:<24} {} account(s)  {}",
                    link.link_id,
                    link.status.as_str(),
                    link.institution_id,
                    link.accounts.len(),
                    link.reference
                );
            }
        }
    }
    Ok(())
}

async fn rules_command(bank: &BankSync, command: RulesCommand) -> Result<()> {
    match command {
        RulesCommand::Add {
            user,
            keyword,
            category,
            match_type,
            priority,
        } => {
            let Some(match_type) = MatchType::parse(&match_type) else {
                bail!("unknown match type {match_type:?} (contains, starts_with, ends_with, exact, regex)");
            };
            let rule = bank
                .add_rule(
                    &user,
                    &NewRule {
                        keyword,
                        match_type,
                        category,
                        priority,
                    },
                )
                .await?;
            println!("Added rule {}", rule.id);
        }
        RulesCommand::List { user } => {
            for r in bank.rules(&user).await? {
                println!(
                    "{:>4}  p={:<3} {:<11} {:<24} → {}",
                    r.id,
                    r.priority,
                    r.match_type.as_str(),
                    r.keyword,
                    r.category
                );
            }
        }
        RulesCommand::Remove { user, id } => {
            if !bank.delete_rule(&user, id).await? {
                bail!("no rule {id} for {user}");
            }
            println!("Removed rule {id}");
        }
    }
    Ok(())
}

/// Wire the service to SQLite and the HTTP aggregator. Local-only commands
/// run without secrets; any aggregator call then fails with `AuthFailure`.
fn open_bank(cfg: &config::Config, needs_network: bool) -> Result<BankSync> {
    let secrets = match auth::load_secrets() {
        Ok(s) => s,
        Err(e) if needs_network => return Err(e),
        Err(e) => {
            debug!(error = %e, "no aggregator secrets, local commands only");
            ClientSecrets {
            secret_id: String::new(),
            secret_key: String::new(),
            }
        }
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backoff = cfg.backoff();
    let http = build_client(cfg.request_timeout())?;
    let tokens = Arc::new(TokenManager::new(
        Arc::new(HttpTokenClient::new(http.clone(), &cfg.aggregator.base_url, backoff)),
        Arc::new(FileCredentialStore::new(state::token_cache_path()?)),
        clock.clone(),
        secrets,
        cfg.token_validity()?,
    ));
    let aggregator = HttpAggregator::new(http, &cfg.aggregator.base_url, tokens, backoff);
    let db = state::db_path()?;
    debug!(db = %db.display(), base_url = %cfg.aggregator.base_url, "opening store");
    let store = SqliteStore::open(&db).with_context(|| format!("open {}", db.display()))?;
    Ok(BankSync::new(
        Arc::new(aggregator),
        Arc::new(store),
        clock,
        cfg.bank_config()?,
    ))
}
