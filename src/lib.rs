//! mailprobe: statistical junk-mail classification
//!
//! A Bayesian email classifier in the Graham/Robinson lineage: messages are
//! tokenized into prefixed terms, term frequencies live in a persistent
//! store, and a scorer combines the strongest discriminators into a spam
//! probability. Training is idempotent per message digest and corrections
//! reclassify atomically.
//!
//! # Architecture
//!
//! - [`errors`]: typed error taxonomy shared across the engine
//! - [`config`]: tuning options, presets, config-file loading
//! - [`message`]: RFC822/MIME parsing, content digests, mbox and maildir framing
//! - [`tokenize`]: message to term-stream extraction rules
//! - [`store`]: persistent term-frequency store with caching and locking
//! - [`score`]: per-term probabilities and log-space combination
//! - [`classifier`]: the public façade (classify, train, remove, maintain)
//! - [`cli`]: the command-line adapter over the engine API

pub mod classifier;
pub mod cli;
pub mod config;
pub mod errors;
pub mod message;
pub mod score;
pub mod store;
pub mod tokenize;

pub use classifier::{
    BatchSummary, Classifier, SelectiveOutcome, SourceVerdict, TrainOutcome, Verdict,
    today_epoch_days,
};
pub use config::ProbeConfig;
pub use errors::{ProbeError, ProbeResult};
pub use message::{Message, MessageDigest};
pub use score::{ScoreOutcome, TermScore};
pub use store::{
    CancelFlag, CorpusCounters, ImportReport, MaintenanceReport, MessageClass, StoreStats,
    TermRecord, TermStore,
};
pub use tokenize::{Term, TokenStream, tokenize};
