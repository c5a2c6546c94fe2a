//! Command-line adapter
//!
//! One thin adapter over the engine: every subcommand maps onto a public
//! [`Classifier`] or [`TermStore`] operation. Exit codes follow the scoring
//! convention: 0 for not spam, 1 for spam, 2 on error.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::error;

use crate::classifier::{Classifier, SelectiveOutcome, Verdict, today_epoch_days};
use crate::config::{self, ProbeConfig};
use crate::errors::ProbeResult;
use crate::store::{CancelFlag, MessageClass, TermStore};

/// Exit code for a clean, non-spam outcome
pub const EXIT_GOOD: u8 = 0;
/// Exit code when a scored message is spam
pub const EXIT_SPAM: u8 = 1;
/// Exit code for errors
pub const EXIT_ERROR: u8 = 2;

/// Bayesian junk-mail classifier
#[derive(Debug, Parser)]
#[command(name = "mailprobe", version, about)]
pub struct Cli {
    /// Store location (default ~/.mailprobe, or MAILPROBE_DB)
    #[arg(short = 'd', long = "db", global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,
    /// JSON configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Log debug detail to stderr
    #[arg(long, global = true)]
    pub verbose: bool,
    /// Named tuning preset
    #[arg(long, global = true, value_enum)]
    pub preset: Option<PresetArg>,
    #[command(flatten)]
    pub overrides: ConfigOverrides,
    #[command(subcommand)]
    pub command: Command,
}

/// Named presets selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PresetArg {
    /// Graham defaults
    Graham,
    /// Higher threshold, heavier good weighting
    Conservative,
    /// Lower threshold, no extra good weighting
    Aggressive,
}

impl PresetArg {
    fn into_config(self) -> ProbeConfig {
        match self {
            Self::Graham => ProbeConfig::graham(),
            Self::Conservative => ProbeConfig::conservative(),
            Self::Aggressive => ProbeConfig::aggressive(),
        }
    }
}

/// Message class argument for `receive --actual`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClassArg {
    /// Legitimate mail
    Good,
    /// Unsolicited mail
    Spam,
}

impl From<ClassArg> for MessageClass {
    fn from(value: ClassArg) -> Self {
        match value {
            ClassArg::Good => MessageClass::Good,
            ClassArg::Spam => MessageClass::Spam,
        }
    }
}

/// Every configuration key, exposed as a `--<key> VALUE` flag
#[derive(Debug, Default, Args)]
pub struct ConfigOverrides {
    #[arg(long, global = true, value_name = "N")]
    pub min_token_count: Option<u32>,
    #[arg(long, global = true, value_name = "N")]
    pub max_discriminators: Option<usize>,
    #[arg(long, global = true, value_name = "P")]
    pub min_deviation: Option<f64>,
    #[arg(long, global = true, value_name = "P")]
    pub spam_threshold: Option<f64>,
    #[arg(long, global = true, value_name = "N")]
    pub terms_for_good: Option<u32>,
    #[arg(long, global = true, value_name = "N")]
    pub terms_for_spam: Option<u32>,
    #[arg(long, global = true, value_name = "P")]
    pub min_prob: Option<f64>,
    #[arg(long, global = true, value_name = "P")]
    pub max_prob: Option<f64>,
    #[arg(long, global = true, value_name = "P")]
    pub default_prob: Option<f64>,
    #[arg(long, global = true, value_name = "N")]
    pub phrase_length: Option<usize>,
    #[arg(long, global = true, value_name = "BOOL")]
    pub replace_non_ascii: Option<bool>,
    #[arg(long, global = true, value_name = "BOOL")]
    pub ignore_body: Option<bool>,
    #[arg(long, global = true, value_name = "N")]
    pub cache_size: Option<usize>,
    #[arg(long, global = true, value_name = "DAYS")]
    pub expiry_days: Option<u32>,
}

impl ConfigOverrides {
    /// Apply every supplied flag onto the config record
    fn apply(&self, config: &mut ProbeConfig) {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    config.$field = value;
                })*
            };
        }
        set!(
            min_token_count,
            max_discriminators,
            min_deviation,
            spam_threshold,
            terms_for_good,
            terms_for_spam,
            min_prob,
            max_prob,
            default_prob,
            phrase_length,
            replace_non_ascii,
            ignore_body,
            cache_size,
            expiry_days
        );
    }
}

/// The command surface
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialize an empty store
    CreateDb,
    /// Train messages as good (mbox and maildir sources expand)
    Good {
        /// Message files or directories
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Train messages as spam (mbox and maildir sources expand)
    Spam {
        /// Message files or directories
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Classify one message from standard input
    Receive {
        /// Also train: with the predicted class, or selectively against
        /// --actual when that is supplied
        #[arg(long)]
        train: bool,
        /// True class for selective (train-on-error) mode
        #[arg(long, value_enum, value_name = "CLASS")]
        actual: Option<ClassArg>,
    },
    /// Classify without training; exit 1 when any message is spam
    Score {
        /// Message files or directories
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Age-based maintenance pass
    Cleanup,
    /// Drop all records seen fewer than min_token_count times
    Purge,
    /// Write the plain-text dump
    Export {
        /// Destination file
        file: PathBuf,
    },
    /// Load a plain-text dump
    Import {
        /// Source file
        file: PathBuf,
    },
    /// Print corpus counters and store statistics
    Info,
}

/// Run a parsed invocation, turning errors into exit code 2
pub fn run(cli: Cli) -> ExitCode {
    match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("mailprobe: {e}");
            if e.is_retryable() {
                eprintln!("mailprobe: another process holds the store; try again");
            }
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Resolve configuration and dispatch the subcommand
fn execute(cli: Cli) -> ProbeResult<ExitCode> {
    let config = build_config(&cli)?;
    let dir = config::resolve_store_path(cli.db);
    let cancel = CancelFlag::new();

    match cli.command {
        Command::CreateDb => {
            let store = TermStore::open(&dir, false)?;
            println!("created store at {}", store.dir().display());
            Ok(ExitCode::from(EXIT_GOOD))
        }
        Command::Good { files } => train_command(&dir, config, &files, MessageClass::Good, &cancel),
        Command::Spam { files } => train_command(&dir, config, &files, MessageClass::Spam, &cancel),
        Command::Receive { train, actual } => receive_command(&dir, config, train, actual),
        Command::Score { files } => score_command(&dir, config, &files, &cancel),
        Command::Cleanup => {
            let mut classifier = Classifier::open(&dir, config, false)?;
            let report = classifier.maintain(today_epoch_days(), &cancel)?;
            println!(
                "removed {} terms, reclaimed {} bytes",
                report.terms_removed, report.bytes_reclaimed
            );
            Ok(ExitCode::from(EXIT_GOOD))
        }
        Command::Purge => {
            let mut classifier = Classifier::open(&dir, config, false)?;
            let report = classifier.purge(&cancel)?;
            println!(
                "removed {} terms, reclaimed {} bytes",
                report.terms_removed, report.bytes_reclaimed
            );
            Ok(ExitCode::from(EXIT_GOOD))
        }
        Command::Export { file } => {
            let classifier = Classifier::open(&dir, config, true)?;
            let mut writer = BufWriter::new(File::create(&file)?);
            classifier.store().export(&mut writer, &cancel)?;
            println!("exported store to {}", file.display());
            Ok(ExitCode::from(EXIT_GOOD))
        }
        Command::Import { file } => {
            let classifier = Classifier::open(&dir, config, false)?;
            let reader = BufReader::new(File::open(&file)?);
            let report = classifier.store().import(reader, &cancel)?;
            println!(
                "imported {} terms and {} digests",
                report.terms, report.digests
            );
            Ok(ExitCode::from(EXIT_GOOD))
        }
        Command::Info => {
            let classifier = Classifier::open(&dir, config, true)?;
            let stats = classifier.store().stats()?;
            println!("store: {}", classifier.store().dir().display());
            println!("good messages: {}", stats.counters.good);
            println!("spam messages: {}", stats.counters.spam);
            println!("terms: {}", stats.terms);
            println!("digests: {}", stats.digests);
            println!("file bytes: {}", stats.file_bytes);
            Ok(ExitCode::from(EXIT_GOOD))
        }
    }
}

/// Resolve the effective configuration
///
/// A config file replaces the preset as the base; per-key flags are applied
/// last and win either way.
fn build_config(cli: &Cli) -> ProbeResult<ProbeConfig> {
    let mut config = match (&cli.config, cli.preset) {
        (Some(path), _) => ProbeConfig::load_file(path)?,
        (None, Some(preset)) => preset.into_config(),
        (None, None) => ProbeConfig::default(),
    };
    cli.overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn train_command(
    dir: &std::path::Path,
    config: ProbeConfig,
    files: &[PathBuf],
    class: MessageClass,
    cancel: &CancelFlag,
) -> ProbeResult<ExitCode> {
    let classifier = Classifier::open(dir, config, false)?;
    let summary = classifier.train_paths(files, class, cancel)?;
    println!(
        "{class}: trained {} of {} messages ({} reclassified, {} skipped, {} failed)",
        summary.trained, summary.processed, summary.reclassified, summary.skipped, summary.failed
    );
    Ok(ExitCode::from(EXIT_GOOD))
}

fn receive_command(
    dir: &std::path::Path,
    config: ProbeConfig,
    train: bool,
    actual: Option<ClassArg>,
) -> ProbeResult<ExitCode> {
    let mut raw = Vec::new();
    io::stdin().lock().read_to_end(&mut raw)?;

    let writable = train || actual.is_some();
    let classifier = Classifier::open(dir, config, !writable)?;

    let verdict = match actual {
        // Selective mode: train only when the prediction disagrees with
        // the supplied label.
        Some(actual) => match classifier.train_if_misclassified(&raw, actual.into())? {
            SelectiveOutcome::Agreed(verdict) => verdict,
            SelectiveOutcome::Corrected(verdict) => verdict,
        },
        None => {
            let verdict = classifier.classify(&raw)?;
            if train {
                classifier.train(&raw, verdict.class())?;
            }
            verdict
        }
    };
    print_verdict("stdin", &verdict);
    Ok(exit_for(&verdict))
}

fn score_command(
    dir: &std::path::Path,
    config: ProbeConfig,
    files: &[PathBuf],
    cancel: &CancelFlag,
) -> ProbeResult<ExitCode> {
    let classifier = Classifier::open(dir, config, true)?;
    let (verdicts, summary) = classifier.score_paths(files, cancel)?;
    for entry in &verdicts {
        let label = format!("{}[{}]", entry.source.display(), entry.index);
        print_verdict(&label, &entry.verdict);
    }
    if summary.failed > 0 {
        eprintln!("mailprobe: {} message(s) failed to parse", summary.failed);
        if verdicts.is_empty() {
            return Ok(ExitCode::from(EXIT_ERROR));
        }
    }
    let any_spam = verdicts.iter().any(|entry| entry.verdict.is_spam);
    Ok(ExitCode::from(if any_spam { EXIT_SPAM } else { EXIT_GOOD }))
}

fn print_verdict(label: &str, verdict: &Verdict) {
    println!("{label}: {:.6} {}", verdict.score, verdict.class());
}

fn exit_for(verdict: &Verdict) -> ExitCode {
    ExitCode::from(if verdict.is_spam { EXIT_SPAM } else { EXIT_GOOD })
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command, PresetArg};

    #[test]
    fn parses_score_with_store_flag() {
        let cli = Cli::parse_from(["mailprobe", "-d", "/tmp/probe", "score", "a.eml", "b.eml"]);
        assert_eq!(cli.db.as_deref(), Some(std::path::Path::new("/tmp/probe")));
        match cli.command {
            Command::Score { files } => assert_eq!(files.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn config_flags_override_presets() {
        let cli = Cli::parse_from([
            "mailprobe",
            "--preset",
            "conservative",
            "--spam-threshold",
            "0.8",
            "info",
        ]);
        assert_eq!(cli.preset, Some(PresetArg::Conservative));
        let config = super::build_config(&cli).expect("build config");
        // Preset supplies terms_for_good; the explicit flag wins the threshold.
        assert_eq!(config.terms_for_good, 5);
        assert_eq!(config.spam_threshold, 0.8);
    }

    #[test]
    fn receive_accepts_selective_training_flags() {
        let cli = Cli::parse_from(["mailprobe", "receive", "--train", "--actual", "good"]);
        match cli.command {
            Command::Receive { train, actual } => {
                assert!(train);
                assert_eq!(actual, Some(super::ClassArg::Good));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn invalid_override_fails_validation() {
        let cli = Cli::parse_from(["mailprobe", "--max-discriminators", "0", "info"]);
        assert!(super::build_config(&cli).is_err());
    }
}
