//! Configuration for a Lambdadelta node

use clap::Args;
use lambdadelta_core::{NullifierSpec, DEFAULT_QUORUM};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Rate-limit windows per event type
pub type EventTypeSpecs = BTreeMap<String, Vec<NullifierSpec>>;

/// Event type registered by default
pub const DEFAULT_EVENT_TYPE: &str = "POST";

/// Default event type profile: one post per 10s, 2048 per day.
pub fn default_event_types() -> EventTypeSpecs {
    let mut specs = EventTypeSpecs::new();
    specs.insert(
        DEFAULT_EVENT_TYPE.to_string(),
        vec![NullifierSpec::new(10, 1), NullifierSpec::new(86_400, 2048)],
    );
    specs
}

/// Node configuration
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pubsub topic of the feed
    #[arg(long, default_value = "lambdadelta")]
    pub topic: String,

    /// Data directory for persistent storage (in-memory when unset)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Maximum distance between claimed and consensus time
    #[arg(long, default_value_t = 10)]
    pub claimed_tolerance_secs: u64,

    /// A live peer's received time is adopted when within this of our clock
    #[arg(long, default_value_t = 2)]
    pub peer_tolerance_secs: u64,

    /// Vote share required for a consensus decision
    #[arg(long, default_value_t = DEFAULT_QUORUM)]
    pub quorum: f64,

    /// Undecided events are forced to a decision after this delay
    #[arg(long, default_value_t = 300)]
    pub deadlock_prevention_delay_secs: u64,

    /// Rejected or undecided events are deleted after this delay
    #[arg(long, default_value_t = 600)]
    pub unconfirmed_event_deletion_delay_secs: u64,

    /// Confirmed events are deleted this long after their claimed time
    #[arg(long, default_value_t = 172_800)]
    pub deletion_delay_secs: u64,

    /// Members seen within this window count towards the quorum
    #[arg(long, default_value_t = 900)]
    pub member_active_window_secs: u64,

    /// Membership proof epoch length
    #[arg(long, default_value_t = 100_000)]
    pub membership_epoch_secs: u64,

    /// Membership epochs accepted either side of the current one
    #[arg(long, default_value_t = 1)]
    pub membership_epoch_tolerance: u64,

    /// Interval between membership renewal checks
    #[arg(long, default_value_t = 600)]
    pub renewal_interval_secs: u64,

    /// Stem-phase embargo before fluffing
    #[arg(long, default_value_t = 5000)]
    pub embargo_time_ms: u64,

    /// Random jitter applied either side of the embargo
    #[arg(long, default_value_t = 3000)]
    pub embargo_jitter_ms: u64,

    /// Dandelion++ stem destinations per routing epoch
    #[arg(long, default_value_t = 2)]
    pub routing_max_destinations: usize,

    /// Routing table refresh interval
    #[arg(long, default_value_t = 600)]
    pub routing_refresh_interval_secs: u64,

    /// Jitter applied to the routing refresh interval
    #[arg(long, default_value_t = 60)]
    pub routing_refresh_jitter_secs: u64,

    /// Timeout for opening direct streams
    #[arg(long, default_value_t = 5000)]
    pub dial_timeout_ms: u64,

    /// Originate events through the Dandelion++ stem phase
    #[arg(long)]
    pub anonymous: bool,

    #[arg(skip = default_event_types())]
    #[serde(default = "default_event_types")]
    pub event_types: EventTypeSpecs,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topic: "lambdadelta".to_string(),
            data_dir: None,
            claimed_tolerance_secs: 10,
            peer_tolerance_secs: 2,
            quorum: DEFAULT_QUORUM,
            deadlock_prevention_delay_secs: 300,
            unconfirmed_event_deletion_delay_secs: 600,
            deletion_delay_secs: 172_800,
            member_active_window_secs: 900,
            membership_epoch_secs: 100_000,
            membership_epoch_tolerance: 1,
            renewal_interval_secs: 600,
            embargo_time_ms: 5000,
            embargo_jitter_ms: 3000,
            routing_max_destinations: 2,
            routing_refresh_interval_secs: 600,
            routing_refresh_jitter_secs: 60,
            dial_timeout_ms: 5000,
            anonymous: false,
            event_types: default_event_types(),
        }
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.topic.is_empty() {
            anyhow::bail!("Topic cannot be empty");
        }
        if !(self.quorum > 0.0 && self.quorum <= 1.0) {
            anyhow::bail!("Quorum must be in (0, 1], got {}", self.quorum);
        }
        if self.membership_epoch_secs == 0 {
            anyhow::bail!("Membership epoch must be non-zero");
        }
        if self.renewal_interval_secs == 0 || self.renewal_interval_secs >= self.member_active_window_secs {
            anyhow::bail!(
                "Renewal interval ({}s) must be non-zero and shorter than the member active window ({}s)",
                self.renewal_interval_secs,
                self.member_active_window_secs
            );
        }
        if self.embargo_jitter_ms > self.embargo_time_ms {
            anyhow::bail!("Embargo jitter cannot exceed the embargo time");
        }
        if self.routing_max_destinations == 0 {
            anyhow::bail!("At least one routing destination is required");
        }
        if self.event_types.is_empty() {
            anyhow::bail!("At least one event type must be configured");
        }
        for (event_type, specs) in &self.event_types {
            if specs.is_empty() {
                anyhow::bail!("Event type {event_type} has no rate-limit windows");
            }
            if specs.iter().any(|s| s.epoch_secs == 0 || s.message_limit == 0) {
                anyhow::bail!("Event type {event_type} has an empty rate-limit window");
            }
        }
        Ok(())
    }

    pub fn claimed_tolerance_ms(&self) -> u64 {
        self.claimed_tolerance_secs * 1000
    }

    pub fn peer_tolerance_ms(&self) -> u64 {
        self.peer_tolerance_secs * 1000
    }

    pub fn deadlock_prevention_delay(&self) -> Duration {
        Duration::from_secs(self.deadlock_prevention_delay_secs)
    }

    pub fn unconfirmed_event_deletion_delay_ms(&self) -> u64 {
        self.unconfirmed_event_deletion_delay_secs * 1000
    }

    pub fn deletion_delay_ms(&self) -> u64 {
        self.deletion_delay_secs * 1000
    }

    /// How long after its epoch starts a MemberCID proof can still be accepted
    pub fn membership_retention_ms(&self) -> u64 {
        self.membership_epoch_tolerance
            .saturating_add(1)
            .saturating_mul(self.membership_epoch_secs)
            .saturating_mul(1000)
    }

    pub fn member_active_window_ms(&self) -> u64 {
        self.member_active_window_secs * 1000
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}
