mod config;
mod layers;

use crate::config::Settings;
use crate::layers::extraction::Extractor;
use crate::layers::mailbox::{self, EmailMessage, GmailClient};
use crate::layers::report::{self, ReportWriter};
use crate::layers::resolution::Resolver;
use crate::layers::validation::Validator;
use crate::layers::{ExtractionQuery, ExtractionResult, Journal, Severity};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "editorial-recon",
    about = "Reconcile manuscript and referee data scraped from journal editorial portals",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level (overrides RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse saved portal pages, match mailbox messages, validate and report.
    Extract {
        /// Journal code: sicon, sifin, mor or mf.
        #[arg(long)]
        journal: Journal,
        /// Saved dashboard / AE center page.
        #[arg(long)]
        dashboard: PathBuf,
        /// Directory of saved manuscript detail pages.
        #[arg(long)]
        details: Option<PathBuf>,
        #[command(flatten)]
        mail: MailArgs,
        #[arg(long, env = "OUTPUT_DIR")]
        out: Option<PathBuf>,
    },

    /// Match mailbox messages into a previously saved result.
    Reconcile {
        #[arg(long)]
        input: PathBuf,
        #[command(flatten)]
        mail: MailArgs,
        #[arg(long, env = "OUTPUT_DIR")]
        out: Option<PathBuf>,
    },

    /// Deduplicate and validate a previously saved result.
    Validate {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, env = "OUTPUT_DIR")]
        out: Option<PathBuf>,
    },
}

#[derive(Args)]
struct MailArgs {
    /// JSON export of mailbox messages.
    #[arg(long, conflicts_with = "gmail")]
    mailbox: Option<PathBuf>,
    /// Search Gmail with GMAIL_ACCESS_TOKEN.
    #[arg(long)]
    gmail: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 0. Load Configuration
    config::load_dotenv()?;
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt::Subscriber::builder().with_env_filter(filter).init();

    let settings = Settings::from_env()?;
    let resolver = Resolver::new(settings.name_match_threshold, settings.min_match_confidence);

    let (mut result, out) = match cli.command {
        Commands::Extract {
            journal,
            dashboard,
            details,
            mail,
            out,
        } => {
            println!("--- Step 1: Extraction ({}) ---", journal.name());
            let query = ExtractionQuery {
                journal,
                dashboard,
                details,
            };
            let mut result = Extractor::new(journal)
                .extract(&query)
                .context("extraction failed")?;
            println!(
                "Found {} manuscripts with {} referees.",
                result.manuscripts.len(),
                result.manuscripts.iter().map(|m| m.referees.len()).sum::<usize>()
            );

            reconcile_step(&mut result, &mail, &settings, &resolver).await?;
            (result, out)
        }
        Commands::Reconcile { input, mail, out } => {
            if mail.mailbox.is_none() && !mail.gmail {
                return Err(anyhow!("reconcile needs --mailbox <file> or --gmail"));
            }
            println!("--- Step 1: Load {:?} ---", input);
            let mut result = report::load_result(&input).await?;
            reconcile_step(&mut result, &mail, &settings, &resolver).await?;
            (result, out)
        }
        Commands::Validate { input, out } => {
            println!("--- Step 1: Load {:?} ---", input);
            (report::load_result(&input).await?, out)
        }
    };

    println!("\n--- Step 3: Validation ---");
    Validator::validate(&mut result);
    let errors = result
        .issues
        .iter()
        .filter(|i| i.severity == Severity::Error)
        .count();
    println!(
        "{} issues ({} errors), quality {:.2}.",
        result.issues.len(),
        errors,
        result.quality_score
    );

    println!("\n--- Step 4: Report ---");
    let writer = ReportWriter::new(out.unwrap_or(settings.output_dir));
    let (json_path, text_path) = writer.write(&result).await?;
    println!("Results written to: {:?} and {:?}", json_path, text_path);

    Ok(())
}

async fn reconcile_step(
    result: &mut ExtractionResult,
    mail: &MailArgs,
    settings: &Settings,
    resolver: &Resolver,
) -> Result<()> {
    println!("\n--- Step 2: Email Reconciliation ---");
    let messages = match load_messages(result, mail, settings).await? {
        Some(messages) => messages,
        None => {
            println!("No mailbox given, skipping.");
            return Ok(());
        }
    };
    println!("Loaded {} messages.", messages.len());

    let summary = resolver.reconcile(result, &messages);
    println!(
        "Attributed {} messages to {} referees.",
        summary.messages_attributed, summary.referees_matched
    );
    Ok(())
}

async fn load_messages(
    result: &ExtractionResult,
    mail: &MailArgs,
    settings: &Settings,
) -> Result<Option<Vec<EmailMessage>>> {
    if let Some(path) = &mail.mailbox {
        return mailbox::load_export(path).await.map(Some);
    }
    if !mail.gmail {
        return Ok(None);
    }

    let token = settings
        .gmail_access_token
        .clone()
        .ok_or_else(|| anyhow!("--gmail needs GMAIL_ACCESS_TOKEN to be set"))?;
    let client = GmailClient::new(token)
        .with_base_url(settings.gmail_api_base.clone())
        .with_max_results(settings.gmail_max_results);

    let ids: Vec<String> = result.manuscripts.iter().map(|m| m.id.clone()).collect();
    let since = match result.manuscripts.iter().filter_map(|m| m.submitted).min() {
        Some(earliest) => Some(mailbox::search_window_start(earliest, settings.gmail_lookback_days)?),
        None => None,
    };

    let messages = client.search_for_manuscripts(&ids, since).await?;
    Ok(Some(messages))
}
