//! Membership handshake for direct protocol streams
//!
//! The dialer opens with its [`Handshake`]; the listener verifies it and
//! answers with its own, or with `HandshakeRejected`. Both sides bind the
//! MemberCID to the transport key of the stream before anything else is
//! exchanged.

use crate::membership::{LocalMembership, MemberTracker, MembershipError};
use futures::{SinkExt, StreamExt};
use lambdadelta_core::{Handshake, MemberId};
use lambdadelta_net::{Frame, FrameError, FrameType, FramedStream, Network, PeerId, TransportError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Stream and handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Handshake rejected by {0}")]
    Rejected(PeerId),
    #[error("Stream closed by {0}")]
    Closed(PeerId),
    #[error("Timed out opening stream to {0}")]
    Timeout(PeerId),
}

impl HandshakeError {
    /// Whether the remote peer misbehaved, as opposed to a local or transport failure
    pub fn is_violation(&self) -> bool {
        match self {
            Self::Membership(e) => e.is_violation(),
            Self::Frame(_) => true,
            _ => false,
        }
    }
}

/// Next frame of a stream; a clean close is an error here
pub async fn read_frame(stream: &mut FramedStream, peer: PeerId) -> Result<Frame, HandshakeError> {
    match stream.next().await {
        Some(frame) => Ok(frame?),
        None => Err(HandshakeError::Closed(peer)),
    }
}

/// Verify a peer's handshake and mark its member as seen.
///
/// A membership violation bans the pseudonym in the proof, unless the proof
/// was never bound to `from` (wrong key or signature): a replayed proof
/// must not get its real owner banned.
pub fn admit(
    membership: &LocalMembership,
    tracker: &MemberTracker,
    handshake: &Handshake,
    from: &PeerId,
) -> Result<MemberId, MembershipError> {
    let member = match membership.verify_handshake(handshake, from) {
        Ok(member) => member,
        Err(e) => {
            let bound = !matches!(e, MembershipError::KeyMismatch | MembershipError::Signature(_));
            if bound && e.is_violation() {
                if let Some(member) = handshake.membership.member_id() {
                    warn!("Banning member {} of peer {}: {}", member, from, e);
                    tracker.ban(member);
                }
            }
            return Err(e);
        }
    };
    tracker.observe(member)?;
    Ok(member)
}

/// Dial `peer` on `protocol` and exchange handshakes
pub async fn initiate(
    network: &dyn Network,
    peer: PeerId,
    protocol: &str,
    membership: &LocalMembership,
    tracker: &MemberTracker,
    timeout: Duration,
) -> Result<(FramedStream, MemberId), HandshakeError> {
    tokio::time::timeout(timeout, exchange(network, peer, protocol, membership, tracker))
        .await
        .map_err(|_| HandshakeError::Timeout(peer))?
}

async fn exchange(
    network: &dyn Network,
    peer: PeerId,
    protocol: &str,
    membership: &LocalMembership,
    tracker: &MemberTracker,
) -> Result<(FramedStream, MemberId), HandshakeError> {
    let mut stream = network.dial(peer, protocol).await?;
    stream
        .send(Frame::message(FrameType::Handshake, &membership.handshake()?)?)
        .await?;

    let frame = read_frame(&mut stream, peer).await?;
    if frame.frame_type == FrameType::HandshakeRejected {
        return Err(HandshakeError::Rejected(peer));
    }
    let reply: Handshake = frame.decode(FrameType::Handshake)?;
    let member = admit(membership, tracker, &reply, &peer)?;
    debug!("Handshake with {} on {} complete", peer, protocol);
    Ok((stream, member))
}

/// Answer a dialer's handshake on an inbound stream
pub async fn respond(
    stream: &mut FramedStream,
    from: PeerId,
    membership: &LocalMembership,
    tracker: &MemberTracker,
) -> Result<MemberId, HandshakeError> {
    let handshake: Handshake = read_frame(stream, from).await?.decode(FrameType::Handshake)?;
    let member = match admit(membership, tracker, &handshake, &from) {
        Ok(member) => member,
        Err(e) => {
            let _ = stream.send(Frame::empty(FrameType::HandshakeRejected)).await;
            return Err(e.into());
        }
    };
    stream
        .send(Frame::message(FrameType::Handshake, &membership.handshake()?)?)
        .await?;
    Ok(member)
}
