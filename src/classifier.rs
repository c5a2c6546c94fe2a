//! Classifier façade
//!
//! Combines the tokenizer, scorer, and term store behind the public engine
//! operations: classify, train, selective train (train-on-error), remove,
//! and maintenance, plus the batch drivers used by the CLI. Training is
//! idempotent per message digest; re-training under the opposite class
//! reclassifies by moving counts between classes in one atomic batch.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::errors::{ProbeError, ProbeResult};
use crate::message::{self, Message, MessageDigest};
use crate::score::{TermScore, score_stream};
use crate::store::{
    CancelFlag, DEFAULT_LOCK_TIMEOUT, MaintenanceReport, MessageClass, TermStore, UpdateBatch,
};
use crate::tokenize::{Term, tokenize};

/// Today's date in whole days since the Unix epoch
///
/// The resolution recorded on term records for expiry decisions.
pub fn today_epoch_days() -> u32 {
    (Utc::now().timestamp() / 86_400).max(0) as u32
}

/// Classification result for one message
#[derive(Debug, Clone)]
pub struct Verdict {
    /// Combined spam probability in [0, 1]
    pub score: f64,
    /// Whether the score reached the configured spam threshold
    pub is_spam: bool,
    /// Selected discriminators, strongest first
    pub terms_considered: Vec<TermScore>,
    /// Content digest of the classified message
    pub digest: MessageDigest,
}

impl Verdict {
    /// Label implied by the verdict
    pub fn class(&self) -> MessageClass {
        if self.is_spam {
            MessageClass::Spam
        } else {
            MessageClass::Good
        }
    }
}

/// What a training call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    /// New digest: counts and corpus counter advanced
    Trained,
    /// Same digest, same class: no-op
    AlreadyTrained,
    /// Same digest, opposite class: counts moved between classes
    Reclassified,
}

/// What a selective (train-on-error) call did
#[derive(Debug, Clone)]
pub enum SelectiveOutcome {
    /// Prediction matched the supplied label; nothing was trained
    Agreed(Verdict),
    /// Prediction disagreed; the message was trained with the true class
    Corrected(Verdict),
}

/// Aggregate outcome of a batch operation
///
/// Per-message failures are counted here and reported in the summary;
/// store-level failures abort the batch instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchSummary {
    /// Messages examined
    pub processed: usize,
    /// Messages trained into the store
    pub trained: usize,
    /// Messages moved between classes
    pub reclassified: usize,
    /// Messages skipped (already trained, or prediction agreed)
    pub skipped: usize,
    /// Messages that failed to parse
    pub failed: usize,
}

/// One scored message from a batch source
#[derive(Debug, Clone)]
pub struct SourceVerdict {
    /// File or directory the message came from
    pub source: PathBuf,
    /// Zero-based index within the source
    pub index: usize,
    /// The classification result
    pub verdict: Verdict,
}

/// The public engine façade
///
/// Owns one store handle and one configuration. `classify` never mutates
/// the store; training and maintenance require a writable handle.
pub struct Classifier {
    store: TermStore,
    config: ProbeConfig,
}

impl Classifier {
    /// Open a classifier over the store directory
    ///
    /// Validates the configuration, then opens the store with the
    /// configured cache size.
    pub fn open(dir: impl AsRef<Path>, config: ProbeConfig, read_only: bool) -> ProbeResult<Self> {
        Self::open_with_timeout(dir, config, read_only, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open with an explicit lock acquisition timeout
    pub fn open_with_timeout(
        dir: impl AsRef<Path>,
        config: ProbeConfig,
        read_only: bool,
        lock_timeout: Duration,
    ) -> ProbeResult<Self> {
        config.validate()?;
        let store = TermStore::open_with(dir, read_only, config.cache_size, lock_timeout)?;
        Ok(Self { store, config })
    }

    /// Wrap an already-open store
    pub fn with_store(store: TermStore, config: ProbeConfig) -> ProbeResult<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// The underlying store handle
    pub fn store(&self) -> &TermStore {
        &self.store
    }

    /// The active configuration
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Classify raw message bytes; read-only
    pub fn classify(&self, raw: &[u8]) -> ProbeResult<Verdict> {
        let message = Message::parse(raw)?;
        self.classify_message(&message)
    }

    /// Classify an already-parsed message; read-only
    pub fn classify_message(&self, message: &Message) -> ProbeResult<Verdict> {
        let outcome = score_stream(tokenize(message, &self.config), &self.store, &self.config)?;
        let verdict = Verdict {
            is_spam: outcome.score >= self.config.spam_threshold,
            score: outcome.score,
            terms_considered: outcome.terms_considered,
            digest: message.digest(),
        };
        debug!(
            score = verdict.score,
            is_spam = verdict.is_spam,
            distinct_terms = outcome.distinct_terms,
            "classified message"
        );
        Ok(verdict)
    }

    /// Train raw message bytes as the given class
    pub fn train(&self, raw: &[u8], class: MessageClass) -> ProbeResult<TrainOutcome> {
        let message = Message::parse(raw)?;
        self.train_message(&message, class)
    }

    /// Train a parsed message as the given class
    ///
    /// Idempotent under the message digest: a repeat under the same class
    /// is a no-op, a repeat under the opposite class moves one occurrence
    /// per distinct term between classes and retags the digest, all in one
    /// atomic batch.
    pub fn train_message(
        &self,
        message: &Message,
        class: MessageClass,
    ) -> ProbeResult<TrainOutcome> {
        let digest = message.digest();
        let ops = match self.store.contains_digest(&digest)? {
            Some(existing) if existing == class => return Ok(TrainOutcome::AlreadyTrained),
            Some(existing) => vec![(existing, -1), (class, 1)],
            None => vec![(class, 1)],
        };
        let outcome = if ops.len() == 2 {
            TrainOutcome::Reclassified
        } else {
            TrainOutcome::Trained
        };
        let batch = UpdateBatch {
            terms: self.distinct_terms(message),
            ops,
            digest,
            digest_after: Some(class),
            seen_day: today_epoch_days(),
        };
        self.store.apply(&batch)?;
        Ok(outcome)
    }

    /// Selective training (train-on-error)
    ///
    /// Classifies first; trains only when the prediction disagrees with the
    /// supplied true class.
    pub fn train_if_misclassified(
        &self,
        raw: &[u8],
        true_class: MessageClass,
    ) -> ProbeResult<SelectiveOutcome> {
        let message = Message::parse(raw)?;
        let verdict = self.classify_message(&message)?;
        if verdict.class() == true_class {
            return Ok(SelectiveOutcome::Agreed(verdict));
        }
        self.train_message(&message, true_class)?;
        Ok(SelectiveOutcome::Corrected(verdict))
    }

    /// Reverse a previous training call
    ///
    /// Decrements one occurrence per distinct term from the trained class,
    /// decrements the corpus counter, and removes the digest.
    ///
    /// # Errors
    ///
    /// `UnknownMessage` when the digest was never trained.
    pub fn remove(&self, raw: &[u8]) -> ProbeResult<()> {
        let message = Message::parse(raw)?;
        let digest = message.digest();
        let Some(existing) = self.store.contains_digest(&digest)? else {
            return Err(ProbeError::UnknownMessage(digest.to_hex()));
        };
        let batch = UpdateBatch {
            terms: self.distinct_terms(&message),
            ops: vec![(existing, -1)],
            digest,
            digest_after: None,
            seen_day: today_epoch_days(),
        };
        self.store.apply(&batch)
    }

    /// Age-based cleanup, delegated to the store
    pub fn maintain(&mut self, now_days: u32, cancel: &CancelFlag) -> ProbeResult<MaintenanceReport> {
        let expiry = self.config.expiry_days;
        self.store.maintenance(now_days, expiry, cancel)
    }

    /// Count-based purge, delegated to the store
    pub fn purge(&mut self, cancel: &CancelFlag) -> ProbeResult<MaintenanceReport> {
        let threshold = self.config.min_token_count;
        self.store.purge(threshold, cancel)
    }

    /// Train every message behind the given paths
    ///
    /// mbox files and maildir directories expand to their messages.
    /// Parse failures are logged, counted, and skipped; each message
    /// commits on its own, so cancellation keeps the completed prefix.
    pub fn train_paths(
        &self,
        paths: &[PathBuf],
        class: MessageClass,
        cancel: &CancelFlag,
    ) -> ProbeResult<BatchSummary> {
        let mut summary = BatchSummary::default();
        for path in paths {
            for raw in message::read_messages(path)? {
                if cancel.is_cancelled() {
                    info!("training cancelled; keeping completed prefix");
                    return Ok(summary);
                }
                summary.processed += 1;
                match self.train(&raw, class) {
                    Ok(TrainOutcome::Trained) => summary.trained += 1,
                    Ok(TrainOutcome::Reclassified) => summary.reclassified += 1,
                    Ok(TrainOutcome::AlreadyTrained) => summary.skipped += 1,
                    Err(e) if e.is_per_message() => {
                        warn!(source = %path.display(), "skipping message: {e}");
                        summary.failed += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        info!(
            processed = summary.processed,
            trained = summary.trained,
            class = %class,
            "training batch finished"
        );
        Ok(summary)
    }

    /// Classify every message behind the given paths, in parallel
    ///
    /// Scoring fans out over the rayon pool against this handle's store
    /// snapshot; nothing is written. Parse failures are counted in the
    /// summary, store failures abort.
    pub fn score_paths(
        &self,
        paths: &[PathBuf],
        cancel: &CancelFlag,
    ) -> ProbeResult<(Vec<SourceVerdict>, BatchSummary)> {
        let mut inputs: Vec<(PathBuf, usize, Vec<u8>)> = Vec::new();
        for path in paths {
            for (index, raw) in message::read_messages(path)?.into_iter().enumerate() {
                inputs.push((path.clone(), index, raw));
            }
        }

        let results: Vec<ProbeResult<Option<SourceVerdict>>> = inputs
            .par_iter()
            .map(|(source, index, raw)| {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                self.classify(raw).map(|verdict| {
                    Some(SourceVerdict {
                        source: source.clone(),
                        index: *index,
                        verdict,
                    })
                })
            })
            .collect();

        let mut verdicts = Vec::with_capacity(results.len());
        let mut summary = BatchSummary::default();
        for result in results {
            match result {
                Ok(Some(verdict)) => {
                    summary.processed += 1;
                    verdicts.push(verdict);
                }
                Ok(None) => {}
                Err(e) if e.is_per_message() => {
                    summary.processed += 1;
                    summary.failed += 1;
                    warn!("skipping message: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok((verdicts, summary))
    }

    /// Distinct terms of a message under the active configuration, sorted
    fn distinct_terms(&self, message: &Message) -> Vec<String> {
        let set: BTreeSet<String> = tokenize(message, &self.config)
            .map(Term::into_string)
            .collect();
        set.into_iter().collect()
    }
}
