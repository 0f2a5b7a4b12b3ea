//! Operator command-line surface for the nanobot memory engine.
//!
//! Exit codes: 0 on success, 2 on usage errors (clap reports these
//! itself), 1 on runtime errors.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use nanobot_memory::{
    MemoryConfig, MemoryEngine, MemoryError, MemoryKind, ScopeLevel, SearchScopeSelector,
};

#[derive(Debug, Parser)]
#[command(name = "nanobot", about = "nanobot runtime operator tools", version)]
struct Cli {
    /// Runtime home directory (defaults to ~/.nanobot)
    #[arg(long, env = "NANOBOT_HOME", global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Long-term memory store operations
    #[command(subcommand)]
    Memory(MemoryCommand),
}

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    /// Print counters, row counts per kind, and the store location
    Status,
    /// Ranked lexical search over the selected scopes
    Search {
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "cli")]
        channel: String,
        #[arg(long = "chat-id", default_value = "direct")]
        chat_id: String,
        #[arg(long = "sender-id")]
        sender_id: Option<String>,
        #[arg(long, value_enum, default_value_t = SearchScopeArg::All)]
        scope: SearchScopeArg,
        #[arg(short = 'k', long = "k", default_value_t = 8)]
        k: usize,
    },
    /// Insert an entry with an explicit kind and scope
    Add {
        #[arg(long)]
        text: String,
        #[arg(long, value_enum)]
        kind: KindArg,
        #[arg(long, value_enum)]
        scope: AddScopeArg,
        #[arg(long, default_value = "cli")]
        channel: String,
        #[arg(long = "chat-id", default_value = "direct")]
        chat_id: String,
        #[arg(long = "sender-id")]
        sender_id: Option<String>,
    },
    /// Delete entries not seen within the given number of days
    Prune {
        #[arg(long = "older-than-days")]
        older_than_days: u64,
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// One-time import of legacy MEMORY.md and semantic files
    Backfill,
    /// Rebuild the lexical index from the canonical table
    Reindex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SearchScopeArg {
    Chat,
    User,
    All,
}

impl SearchScopeArg {
    fn selector(self) -> SearchScopeSelector {
        match self {
            SearchScopeArg::Chat => SearchScopeSelector::Chat,
            SearchScopeArg::User => SearchScopeSelector::User,
            SearchScopeArg::All => SearchScopeSelector::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Preference,
    Fact,
    Decision,
    Episodic,
}

impl KindArg {
    fn kind(self) -> MemoryKind {
        match self {
            KindArg::Preference => MemoryKind::Preference,
            KindArg::Fact => MemoryKind::Fact,
            KindArg::Decision => MemoryKind::Decision,
            KindArg::Episodic => MemoryKind::Episodic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AddScopeArg {
    Chat,
    User,
    Global,
}

impl AddScopeArg {
    fn level(self) -> ScopeLevel {
        match self {
            AddScopeArg::Chat => ScopeLevel::Chat,
            AddScopeArg::User => ScopeLevel::User,
            AddScopeArg::Global => ScopeLevel::Global,
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error ({}): {error}", error.kind_label());
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, MemoryError> {
    let config = load_config(cli.home.as_deref())?;
    let Command::Memory(command) = cli.command;

    match command {
        MemoryCommand::Status => {
            let engine = MemoryEngine::new(config)?;
            let status = engine.status()?;
            println!(
                "memory status: backend={} db={}",
                status.backend,
                status.db_path.display()
            );
            let by_kind = |kind: MemoryKind| {
                status
                    .store
                    .rows_by_kind
                    .get(kind.as_str())
                    .copied()
                    .unwrap_or(0)
            };
            println!(
                "rows: total={} preference={} fact={} decision={} episodic={}",
                status.store.total_rows,
                by_kind(MemoryKind::Preference),
                by_kind(MemoryKind::Fact),
                by_kind(MemoryKind::Decision),
                by_kind(MemoryKind::Episodic),
            );
            let counters = &status.counters;
            println!(
                "counters: memory_recall_hit={} memory_recall_miss={} memory_capture_saved={} \
                 memory_capture_dropped_low_conf={} memory_capture_dropped_safety={} \
                 memory_capture_deduped={} memory_prompt_chars={}",
                counters.memory_recall_hit,
                counters.memory_recall_miss,
                counters.memory_capture_saved,
                counters.memory_capture_dropped_low_conf,
                counters.memory_capture_dropped_safety,
                counters.memory_capture_deduped,
                counters.memory_prompt_chars,
            );
            for (reason, count) in &counters.capture_dropped_safety_by_reason {
                println!("safety drops: reason={reason} count={count}");
            }
        }
        MemoryCommand::Search {
            query,
            channel,
            chat_id,
            sender_id,
            scope,
            k,
        } => {
            if k == 0 {
                eprintln!("usage error: -k must be at least 1");
                return Ok(ExitCode::from(2));
            }
            let engine = MemoryEngine::new(config)?;
            let hits = engine.search_scoped(
                &query,
                &channel,
                &chat_id,
                sender_id.as_deref(),
                scope.selector(),
                k,
            )?;
            if hits.is_empty() {
                println!("no matches");
            }
            for hit in hits {
                println!(
                    "{:.3} [{}] ({}) {}",
                    hit.final_score,
                    hit.entry.kind.as_str(),
                    hit.entry.scope_key,
                    hit.entry.text,
                );
            }
        }
        MemoryCommand::Add {
            text,
            kind,
            scope,
            channel,
            chat_id,
            sender_id,
        } => {
            if text.trim().is_empty() {
                eprintln!("usage error: --text must not be empty");
                return Ok(ExitCode::from(2));
            }
            let engine = MemoryEngine::new(config)?;
            let outcome = engine.add_manual(
                &text,
                kind.kind(),
                scope.level(),
                &channel,
                &chat_id,
                sender_id.as_deref(),
            )?;
            if outcome.is_insert() {
                println!("inserted entry id={}", outcome.id());
            } else {
                println!("merged into existing entry id={}", outcome.id());
            }
        }
        MemoryCommand::Prune {
            older_than_days,
            dry_run,
        } => {
            if older_than_days == 0 {
                eprintln!("usage error: --older-than-days must be at least 1");
                return Ok(ExitCode::from(2));
            }
            let engine = MemoryEngine::new(config)?;
            let count = engine.prune_older_than(older_than_days, dry_run)?;
            if dry_run {
                println!("would prune {count} entries older than {older_than_days} days");
            } else {
                println!("pruned {count} entries older than {older_than_days} days");
            }
        }
        MemoryCommand::Backfill => {
            let engine = MemoryEngine::new(config)?;
            let report = engine.backfill()?;
            if report.already_complete {
                println!("backfill already complete; nothing to do");
            } else {
                println!(
                    "backfill imported {} entries ({} merged into existing rows)",
                    report.imported, report.merged
                );
            }
        }
        MemoryCommand::Reindex => {
            let engine = MemoryEngine::new(config)?;
            engine.reindex()?;
            println!("reindex complete");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn load_config(home: Option<&std::path::Path>) -> Result<MemoryConfig, MemoryError> {
    match home {
        Some(home) => {
            let mut config = MemoryConfig::load(&home.join("config.json"))?;
            config.root_dir = home.to_path_buf();
            Ok(config)
        }
        None => {
            let defaults = MemoryConfig::default().with_expanded_home();
            MemoryConfig::load(&defaults.root_dir.join("config.json"))
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tempfile::tempdir;

    use super::{load_config, AddScopeArg, Cli, Command, KindArg, MemoryCommand, SearchScopeArg};
    use nanobot_memory::{MemoryKind, ScopeLevel};

    #[test]
    fn unit_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn unit_search_arguments_parse_with_defaults() {
        let cli = Cli::try_parse_from([
            "nanobot", "memory", "search", "--query", "tailwind preference",
        ])
        .expect("parse");
        let Command::Memory(MemoryCommand::Search {
            query,
            channel,
            chat_id,
            sender_id,
            scope,
            k,
        }) = cli.command
        else {
            panic!("expected search command");
        };
        assert_eq!(query, "tailwind preference");
        assert_eq!(channel, "cli");
        assert_eq!(chat_id, "direct");
        assert_eq!(sender_id, None);
        assert_eq!(scope, SearchScopeArg::All);
        assert_eq!(k, 8);
    }

    #[test]
    fn unit_add_arguments_require_kind_and_scope() {
        let missing = Cli::try_parse_from(["nanobot", "memory", "add", "--text", "note"]);
        assert!(missing.is_err());

        let cli = Cli::try_parse_from([
            "nanobot", "memory", "add", "--text", "prefers tabs", "--kind", "preference",
            "--scope", "user", "--sender-id", "sam",
        ])
        .expect("parse");
        let Command::Memory(MemoryCommand::Add { kind, scope, .. }) = cli.command else {
            panic!("expected add command");
        };
        assert_eq!(kind.kind(), MemoryKind::Preference);
        assert_eq!(scope.level(), ScopeLevel::User);
    }

    #[test]
    fn unit_prune_arguments_parse() {
        let cli = Cli::try_parse_from([
            "nanobot", "memory", "prune", "--older-than-days", "30", "--dry-run",
        ])
        .expect("parse");
        let Command::Memory(MemoryCommand::Prune {
            older_than_days,
            dry_run,
        }) = cli.command
        else {
            panic!("expected prune command");
        };
        assert_eq!(older_than_days, 30);
        assert!(dry_run);
    }

    #[test]
    fn unit_value_enums_cover_all_variants() {
        assert_eq!(KindArg::Episodic.kind(), MemoryKind::Episodic);
        assert_eq!(KindArg::Decision.kind(), MemoryKind::Decision);
        assert_eq!(KindArg::Fact.kind(), MemoryKind::Fact);
        assert_eq!(AddScopeArg::Global.level(), ScopeLevel::Global);
        assert_eq!(AddScopeArg::Chat.level(), ScopeLevel::Chat);
    }

    #[test]
    fn functional_home_override_wins_over_config_root() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(
            temp.path().join("config.json"),
            r#"{ "recall": { "maxResults": 3 } }"#,
        )
        .expect("write config");

        let config = load_config(Some(temp.path())).expect("load");
        assert_eq!(config.root_dir, temp.path());
        assert_eq!(config.recall.max_results, 3);
    }

    #[test]
    fn functional_missing_config_file_falls_back_to_defaults() {
        let temp = tempdir().expect("tempdir");
        let config = load_config(Some(temp.path())).expect("load");
        assert_eq!(config.recall.max_results, 8);
        assert!(config.memory.enabled);
    }
}
