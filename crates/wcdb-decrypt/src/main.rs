//! `wcdb-decrypt` — decrypt a WCDB / SQLCipher 4 database into plain SQLite.
//!
//! ```text
//! wcdb-decrypt message_0.db <64-hex-key> [message_0_decrypted.db]
//! ```
//!
//! Exit codes: 0 success, 1 error, 2 completed with failed pages
//! (`--continue-on-auth-failure`), 130 interrupted.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use secrecy::SecretString;
use thiserror::Error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use wcdb_crypto_core::disable_core_dumps;
use wcdb_transcode::{
    default_output_path, AuthFailurePolicy, DatabaseTranscoder, ReserveMode, TranscodeError,
    TranscodeOptions, TranscodeReport, TranscodeStatus,
};

const EXIT_PAGE_FAILURES: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

/// Decrypt a WCDB / SQLCipher 4 encrypted database into a plain SQLite file.
#[derive(Parser)]
#[command(name = "wcdb-decrypt", version)]
struct Cli {
    /// Encrypted database file
    input: PathBuf,

    /// 32-byte database key as 64 hex characters
    #[arg(value_name = "KEY_HEX")]
    key_hex: String,

    /// Output file [default: <input stem>_decrypted.<ext> next to the input]
    output: Option<PathBuf>,

    /// JSON options file; flags below override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Page size the database was created with (PRAGMA cipher_page_size)
    #[arg(long, value_name = "BYTES")]
    page_size: Option<usize>,

    /// PBKDF2 iteration count (PRAGMA kdf_iter)
    #[arg(long = "kdf-iter", value_name = "N")]
    kdf_iter: Option<u32>,

    /// Decoder threads [default: one per CPU]
    #[arg(short = 'j', long, value_name = "N")]
    jobs: Option<usize>,

    /// Zero-fill pages that fail authentication instead of aborting
    #[arg(long)]
    continue_on_auth_failure: bool,

    /// Keep each page's IV and HMAC in the output's reserved bytes
    #[arg(long)]
    preserve_reserve: bool,

    /// Omit derived-key fingerprints from the summary
    #[arg(long)]
    no_fingerprints: bool,

    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error("decoder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("cannot encode report: {0}")]
    Json(#[from] serde_json::Error),
}

// ── Logging ────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

// ── Options ────────────────────────────────────────────────────────

fn build_options(cli: &Cli) -> Result<TranscodeOptions, TranscodeError> {
    let mut options = match &cli.config {
        Some(path) => TranscodeOptions::load(path)?,
        None => TranscodeOptions {
            reveal_key_fingerprints: true,
            ..TranscodeOptions::default()
        },
    };
    if let Some(page_size) = cli.page_size {
        options.params.page_size = page_size;
    }
    if let Some(kdf_iter) = cli.kdf_iter {
        options.params.kdf_iterations = kdf_iter;
    }
    if let Some(jobs) = cli.jobs {
        options.workers = jobs;
    }
    if cli.continue_on_auth_failure {
        options.auth_failure_policy = AuthFailurePolicy::Continue;
    }
    if cli.preserve_reserve {
        options.reserve_mode = ReserveMode::Preserve;
    }
    if cli.no_fingerprints {
        options.reveal_key_fingerprints = false;
    }
    options.validate()?;
    Ok(options)
}

// ── Run ────────────────────────────────────────────────────────────

/// Transcode on a blocking thread; Ctrl-C trips the cancel token and waits
/// for the pipeline to unwind (which removes the staging file).
async fn run(cli: &Cli, key: SecretString) -> Result<TranscodeReport, CliError> {
    let transcoder = DatabaseTranscoder::new(build_options(cli)?)?;
    let cancel = transcoder.cancel_token();
    let input = cli.input.clone();
    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&cli.input));

    let mut job =
        tokio::task::spawn_blocking(move || transcoder.transcode_hex(&input, &key, &output));

    let result = tokio::select! {
        res = &mut job => res,
        signal = tokio::signal::ctrl_c() => {
            if signal.is_ok() {
                tracing::warn!("interrupt received; cancelling");
                cancel.cancel();
            }
            job.await
        }
    };
    Ok(result??)
}

fn print_summary(report: &TranscodeReport) {
    println!(
        "decrypted {} -> {}",
        report.input_path.display(),
        report.output_path.display()
    );
    println!("  salt:             {}", report.salt);
    println!(
        "  pages:            {} ({} bytes)",
        report.page_count, report.bytes_written
    );
    if let Some(fp) = &report.key_fingerprints {
        println!("  enc key (blake3): {}", fp.encryption_key);
        println!("  mac key (blake3): {}", fp.hmac_key);
    }
    match &report.status {
        TranscodeStatus::Success => println!("  status:           ok"),
        TranscodeStatus::CompletedWithFailures { failed_pages } => println!(
            "  status:           {} page(s) failed authentication and were zero-filled: {failed_pages:?}",
            failed_pages.len()
        ),
    }
}

fn report_error(err: &CliError) -> ExitCode {
    eprintln!("error: {err}");
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = std::error::Error::source(cause);
    }
    match err {
        CliError::Transcode(TranscodeError::Cancelled { .. }) => ExitCode::from(EXIT_INTERRUPTED),
        _ => ExitCode::FAILURE,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let mut cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = disable_core_dumps() {
        tracing::warn!(error = %e, "could not disable core dumps");
    }
    let key = SecretString::from(std::mem::take(&mut cli.key_hex));

    let report = match run(&cli, key).await {
        Ok(report) => report,
        Err(err) => return report_error(&err),
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => return report_error(&CliError::Json(e)),
        }
    } else {
        print_summary(&report);
    }

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_PAGE_FAILURES)
    }
}
