//! lambdadelta - anonymous, rate-limited event feed
//!
//! This crate provides:
//! - RLN message id allocation and event header proofs
//! - MemberCID membership proofs and the active member tracker
//! - A timeline ordered by consensus over peers' received times
//! - Gossip and direct sync of events between members
//! - Dandelion++ stem relay for anonymous publishing

pub mod clock;
pub mod config;
pub mod feed;
pub mod handshake;
pub mod header;
pub mod membership;
pub mod message_id;
pub mod node;
pub mod relayer;
pub mod routing;
pub mod storage;
pub mod sync;
pub mod timeline;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use feed::{FeedEntry, LambdadeltaFeed};
pub use membership::{LocalMembership, MemberTracker};
pub use message_id::MessageIdRegistry;
pub use node::{Lambdadelta, NewEvent, NodeError};
pub use relayer::EventRelayer;
pub use routing::RoutingTable;
pub use storage::{Datastore, MemoryDatastore, SledDatastore};
pub use sync::LambdadeltaSync;
pub use timeline::Timeline;
