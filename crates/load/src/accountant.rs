//! Per-source credit accounting. Every endpoint that can impose load on the
//! node gets a signed credit balance: legitimate activity earns credit back
//! over time, abusive activity debits it, and sources that sink far enough
//! are warned and then cut off by the transport layer.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Load categories a cost can land in.
pub const LC_DISK: u8 = 1;
pub const LC_CPU: u8 = 2;
pub const LC_NETWORK: u8 = 4;

/// Kinds of load an endpoint can place on the node. The set is closed; each
/// kind carries a fixed cost and category mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadKind {
    /// A request we can immediately tell is invalid.
    InvalidRequest,
    /// A request we cannot satisfy.
    RequestNoReply,
    /// An object whose signature we had to check and it failed.
    InvalidSignature,
    /// Data we have no use for.
    UnwantedData,
    /// Proof of work that does not validate.
    BadProofOfWork,
    /// Data we have to verify before rejecting.
    BadData,
    /// A new trusted transaction, validation, or proposal.
    NewTrusted,
    /// A new, valid transaction.
    NewTransaction,
    /// Data we requested.
    NeededData,
    /// A request that is hard to satisfy.
    RequestData,
    /// A query answerable from cached data.
    CheapQuery,
}

impl LoadKind {
    /// Cost debited from the source when this load is observed.
    pub fn cost(self) -> i64 {
        match self {
            LoadKind::InvalidRequest => 10,
            LoadKind::RequestNoReply => 1,
            LoadKind::InvalidSignature => 100,
            LoadKind::UnwantedData => 5,
            LoadKind::BadProofOfWork => 25,
            LoadKind::BadData => 20,
            LoadKind::NewTrusted => 10,
            LoadKind::NewTransaction => 2,
            LoadKind::NeededData => 10,
            LoadKind::RequestData => 5,
            LoadKind::CheapQuery => 1,
        }
    }

    /// Category mask for this load kind.
    pub fn categories(self) -> u8 {
        match self {
            LoadKind::InvalidRequest => LC_CPU | LC_NETWORK,
            LoadKind::RequestNoReply => LC_CPU | LC_DISK,
            LoadKind::InvalidSignature => LC_CPU,
            LoadKind::UnwantedData => LC_CPU | LC_NETWORK,
            LoadKind::BadProofOfWork => LC_CPU,
            LoadKind::BadData => LC_CPU,
            LoadKind::NewTrusted => 0,
            LoadKind::NewTransaction => 0,
            LoadKind::NeededData => 0,
            LoadKind::RequestData => LC_DISK | LC_NETWORK,
            LoadKind::CheapQuery => LC_CPU,
        }
    }
}

/// Source flags set at registration time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceFlags {
    /// Privileged sources are never cut off.
    pub privileged: bool,
    /// Connection we initiated; warnings and cutoffs may be suppressed by
    /// caller policy.
    pub outbound: bool,
}

/// Credit parameters. Balances float between `debit_limit` and
/// `credit_limit`; credit accrues at `credit_rate` per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfig {
    pub credit_rate: i64,
    pub credit_limit: i64,
    pub debit_warn: i64,
    pub debit_limit: i64,
    pub warn_interval_secs: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            credit_rate: 10,
            credit_limit: 50,
            debit_warn: -50,
            debit_limit: -100,
            warn_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone)]
struct LoadSource {
    balance: i64,
    flags: SourceFlags,
    last_update: u64,
    last_warning: u64,
}

impl LoadSource {
    fn new(flags: SourceFlags, now: u64) -> Self {
        Self {
            balance: 0,
            flags,
            last_update: now,
            last_warning: 0,
        }
    }

    /// Accrue earned credit, capped at the credit limit. Debits below the
    /// floor are preserved here so a burst of abuse stays visible to the
    /// cutoff check until the periodic sweep.
    fn accrue(&mut self, now: u64, config: &LoadConfig) {
        if now > self.last_update {
            self.balance += config.credit_rate * (now - self.last_update) as i64;
            if self.balance > config.credit_limit {
                self.balance = config.credit_limit;
            }
            self.last_update = now;
        }
    }

    /// Full canonicalisation: accrue, then clamp into
    /// `[debit_limit, credit_limit]`.
    fn canonicalize(&mut self, now: u64, config: &LoadConfig) {
        self.accrue(now, config);
        if self.balance < config.debit_limit {
            self.balance = config.debit_limit;
        }
    }
}

#[derive(Debug)]
struct Inner {
    config: LoadConfig,
    sources: HashMap<String, LoadSource>,
}

/// The collection of load sources. All operations take the manager-level
/// mutex; the once-per-second background task recanonicalises every source so
/// long-idle endpoints do not underreport credit when next polled.
pub struct LoadAccountant {
    started: Instant,
    inner: Mutex<Inner>,
}

impl LoadAccountant {
    pub fn new(config: LoadConfig) -> Self {
        Self {
            started: Instant::now(),
            inner: Mutex::new(Inner {
                config,
                sources: HashMap::new(),
            }),
        }
    }

    /// Monotonic seconds since the accountant was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn config(&self) -> LoadConfig {
        self.inner.lock().config
    }

    pub fn set_config(&self, config: LoadConfig) {
        self.inner.lock().config = config;
    }

    /// Create the source if it is not yet tracked.
    pub fn register(&self, source: &str, flags: SourceFlags) {
        let now = self.uptime_secs();
        let mut inner = self.inner.lock();
        inner
            .sources
            .entry(source.to_string())
            .or_insert_with(|| LoadSource::new(flags, now));
    }

    pub fn set_privileged(&self, source: &str) {
        let now = self.uptime_secs();
        let mut inner = self.inner.lock();
        inner
            .sources
            .entry(source.to_string())
            .or_insert_with(|| LoadSource::new(SourceFlags::default(), now))
            .flags
            .privileged = true;
    }

    pub fn is_privileged(&self, source: &str) -> bool {
        self.inner
            .lock()
            .sources
            .get(source)
            .map(|s| s.flags.privileged)
            .unwrap_or(false)
    }

    pub fn is_outbound(&self, source: &str) -> bool {
        self.inner
            .lock()
            .sources
            .get(source)
            .map(|s| s.flags.outbound)
            .unwrap_or(false)
    }

    /// Current balance without canonicalising.
    pub fn balance(&self, source: &str) -> i64 {
        self.inner
            .lock()
            .sources
            .get(source)
            .map(|s| s.balance)
            .unwrap_or(0)
    }

    /// Apply a signed credit delta at the current uptime.
    pub fn adjust(&self, source: &str, credits: i64) -> bool {
        self.adjust_at(source, credits, self.uptime_secs())
    }

    /// Apply a signed credit delta at an explicit uptime. Returns true when
    /// the source has sunk below the warning threshold.
    pub fn adjust_at(&self, source: &str, credits: i64, now: u64) -> bool {
        let mut inner = self.inner.lock();
        let config = inner.config;
        let src = inner
            .sources
            .entry(source.to_string())
            .or_insert_with(|| LoadSource::new(SourceFlags::default(), now));
        src.accrue(now, &config);
        src.balance += credits;
        if src.balance > config.credit_limit {
            src.balance = config.credit_limit;
        }
        src.balance < config.debit_warn
    }

    /// Debit the cost of an observed load kind.
    pub fn adjust_kind(&self, source: &str, kind: LoadKind) -> bool {
        self.adjust(source, -kind.cost())
    }

    pub fn adjust_kind_at(&self, source: &str, kind: LoadKind, now: u64) -> bool {
        self.adjust_at(source, -kind.cost(), now)
    }

    /// Whether the caller should warn this source. Rate-limited: at most one
    /// warning per warn interval, stamped when this returns true.
    pub fn should_warn(&self, source: &str) -> bool {
        self.should_warn_at(source, self.uptime_secs())
    }

    pub fn should_warn_at(&self, source: &str, now: u64) -> bool {
        let mut inner = self.inner.lock();
        let config = inner.config;
        let Some(src) = inner.sources.get_mut(source) else {
            return false;
        };
        src.accrue(now, &config);
        if src.balance < config.debit_warn
            && now.saturating_sub(src.last_warning) > config.warn_interval_secs
        {
            src.last_warning = now;
            debug!(source, balance = src.balance, "load warning");
            return true;
        }
        false
    }

    /// Whether this source crossed the cutoff threshold. Privileged sources
    /// are never cut off.
    pub fn should_cutoff(&self, source: &str) -> bool {
        self.should_cutoff_at(source, self.uptime_secs())
    }

    pub fn should_cutoff_at(&self, source: &str, now: u64) -> bool {
        let mut inner = self.inner.lock();
        let config = inner.config;
        let Some(src) = inner.sources.get_mut(source) else {
            return false;
        };
        src.accrue(now, &config);
        let cutoff = src.balance < config.debit_limit && !src.flags.privileged;
        if cutoff {
            warn!(source, balance = src.balance, "load cutoff");
        }
        cutoff
    }

    /// Recanonicalise every source at the current uptime.
    pub fn canonicalize_all(&self) {
        self.canonicalize_all_at(self.uptime_secs());
    }

    pub fn canonicalize_all_at(&self, now: u64) {
        let mut inner = self.inner.lock();
        let config = inner.config;
        for src in inner.sources.values_mut() {
            src.canonicalize(now, &config);
        }
    }

    /// Background canonicalisation at a one-second cadence.
    pub fn spawn_canonicalise_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let accountant = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                accountant.canonicalize_all();
            }
        })
    }
}
