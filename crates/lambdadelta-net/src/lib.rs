//! Networking primitives for the Lambdadelta protocol
//!
//! This crate provides:
//! - Transport keypair management and peer identity
//! - Length-prefixed message framing
//! - The [`Network`] contract the protocol runs on (pubsub with a validator
//!   hook, point-to-point protocol streams, subscription-change events)
//! - An in-process [`MemoryHub`] implementation of that contract

pub mod crypto;
pub mod framing;
pub mod peer;
pub mod transport;

pub use crypto::{CryptoError, KeyPair};
pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use peer::PeerId;
pub use transport::{
    FramedStream, GossipMessage, IncomingStream, MemoryHub, MemoryTransport, Network, PeerEvent,
    TopicValidator, TransportError, ValidationResult,
};
