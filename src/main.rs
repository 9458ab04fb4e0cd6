use clap::{Parser, Subcommand};
use memo_kb::commands::{clear, configure, context, ingest, search, stats};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "memo-kb")]
#[command(about = "A semantic knowledge base of historical credit memos")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or initialize the configuration file
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Ingest a JSON file of credit memos into the knowledge base
    Ingest {
        /// Path to a JSON array of memos
        file: PathBuf,
    },
    /// Run a free-text similarity search
    Search {
        /// Query text
        query: String,
        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,
        /// Only return chunks with this exact risk score (1-5)
        #[arg(long)]
        risk_score: Option<i32>,
        /// Only return chunks whose borrower category contains this text
        #[arg(long)]
        category: Option<String>,
    },
    /// Build the generation-ready context block for a financial profile
    Context {
        /// Debt service coverage ratio
        #[arg(long)]
        dscr: Option<f64>,
        /// Current ratio
        #[arg(long)]
        current_ratio: Option<f64>,
        /// Leverage ratio
        #[arg(long)]
        leverage_ratio: Option<f64>,
        /// Borrower industry descriptor
        #[arg(long)]
        industry: Option<String>,
        /// Maximum number of examples
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show aggregate statistics of the knowledge base
    Stats,
    /// Delete every chunk from the knowledge base
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show } => {
            configure(show)?;
        }
        Commands::Ingest { file } => {
            ingest(file).await?;
        }
        Commands::Search {
            query,
            limit,
            risk_score,
            category,
        } => {
            search(query, limit, risk_score, category).await?;
        }
        Commands::Context {
            dscr,
            current_ratio,
            leverage_ratio,
            industry,
            limit,
        } => {
            context(dscr, current_ratio, leverage_ratio, industry, limit).await?;
        }
        Commands::Stats => {
            stats().await?;
        }
        Commands::Clear { yes } => {
            clear(yes).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["memo-kb", "stats"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            matches!(parsed.command, Commands::Stats);
        }
    }

    #[test]
    fn ingest_command_with_file() {
        let cli = Cli::try_parse_from(["memo-kb", "ingest", "memos.json"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Ingest { file } = parsed.command {
                assert_eq!(file, PathBuf::from("memos.json"));
            }
        }
    }

    #[test]
    fn search_command_with_filters() {
        let cli = Cli::try_parse_from([
            "memo-kb",
            "search",
            "strong liquidity",
            "--limit",
            "5",
            "--risk-score",
            "2",
            "--category",
            "retail",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Search {
                query,
                limit,
                risk_score,
                category,
            } = parsed.command
            {
                assert_eq!(query, "strong liquidity");
                assert_eq!(limit, Some(5));
                assert_eq!(risk_score, Some(2));
                assert_eq!(category, Some("retail".to_string()));
            }
        }
    }

    #[test]
    fn context_command_with_ratios() {
        let cli = Cli::try_parse_from([
            "memo-kb",
            "context",
            "--dscr",
            "1.6",
            "--current-ratio",
            "2.2",
            "--industry",
            "Retail Bakery",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Context {
                dscr,
                current_ratio,
                leverage_ratio,
                industry,
                ..
            } = parsed.command
            {
                assert_eq!(dscr, Some(1.6));
                assert_eq!(current_ratio, Some(2.2));
                assert_eq!(leverage_ratio, None);
                assert_eq!(industry, Some("Retail Bakery".to_string()));
            }
        }
    }

    #[test]
    fn clear_requires_explicit_yes_flag() {
        let cli = Cli::try_parse_from(["memo-kb", "clear"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Clear { yes } = parsed.command {
                assert!(!yes);
            }
        }
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["memo-kb", "config", "--show"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Config { show } = parsed.command {
                assert!(show);
            }
        }
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["memo-kb", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["memo-kb", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
