//! Pairing sessions.
//!
//! Handshake between initiator A and responder B:
//!
//! ```text
//! A ─ connect1 "A" "B" ──────────────▶ B   request, B's user decides (TOFU)
//! A ◀───────────────────── accept1 "A" ─ B
//! A ◀── data1 "A" s.{ecdh1 x.<B eph>} ── B
//! A ─ data1 "B" s.{ecdh1 x.<A eph>} ──▶ B
//!         both: session key = BLAKE3(X25519(a, B), A eph, B eph)
//! ```
//!
//! Every `data1` payload is signed with the sender's identity key and checked
//! against the key in its beacon, so the ephemeral shares are authenticated.
//! A share is only taken while the handshake is open; once connected, further
//! shares are dropped and the session key never changes.
//!
//! After pairing, application data travels as a [`Frame`] inside the signed
//! payload. Its MAC is keyed by the session key and its counter must rise, so
//! a captured `data1` cannot be replayed.

pub mod initiator;
pub mod listener;

use tsync_core::crypto::{self, derive_session_key, EphemeralKeyPair};
use tsync_core::wire::{Frame, Message};
use tsync_services::connection::{self, ConnStatus, Transport};
use tsync_services::Peer;

use crate::server::{Engine, ServerError};

/// Signed payload prefix carrying an ephemeral public key.
pub const KEY_SHARE_PREFIX: &[u8] = b"ecdh1 ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Responder,
}

/// Accept the pending request from `peer`: pin its key, send `accept1`, then
/// our key share.
pub(crate) async fn accept(engine: &Engine, peer: &Peer) -> Result<(), ServerError> {
    let conn = engine
        .connections
        .get(peer)
        .ok_or_else(|| ServerError::NoConnection(peer.to_string()))?;
    if conn.status != ConnStatus::Incoming {
        return Err(ServerError::NoPendingRequest {
            peer: peer.to_string(),
            status: conn.status,
        });
    }
    let transport = conn
        .transport
        .ok_or_else(|| ServerError::NoConnection(peer.to_string()))?;

    engine.pin(peer);
    let accept = Message::Accept {
        target: peer.name.clone(),
    };
    transport.send(accept.encode()?.as_bytes()).await?;
    send_key_share(engine, peer, &transport).await?;
    tracing::info!(peer = %peer, "pairing request accepted");
    Ok(())
}

/// Send our ephemeral public key for `peer`, generating the pair on first use.
pub(crate) async fn send_key_share(
    engine: &Engine,
    peer: &Peer,
    transport: &Transport,
) -> Result<(), ServerError> {
    let share = {
        let pair = engine
            .pending
            .entry(peer.clone())
            .or_try_insert_with(EphemeralKeyPair::generate)?;
        pair.public_key_to_string()
    };
    let mut payload = KEY_SHARE_PREFIX.to_vec();
    payload.extend_from_slice(share.as_bytes());

    let message = Message::Data {
        target: peer.name.clone(),
        payload: engine.identity.sign_message(&payload),
    };
    transport.send(message.encode()?.as_bytes()).await?;
    tracing::debug!(peer = %peer, "key share sent");
    Ok(())
}

/// Handle a `data1` payload from `peer`.
pub(crate) async fn receive_data(
    engine: &Engine,
    peer: &Peer,
    role: Role,
    transport: &Transport,
    payload: &str,
) -> Result<(), ServerError> {
    let key = crypto::public_key_from_string(&peer.public_key)?;
    let data = crypto::verify_signed_message(payload, &key)?;

    if let Some(share) = data.strip_prefix(KEY_SHARE_PREFIX) {
        return complete_key_agreement(engine, peer, role, transport, share).await;
    }

    let session = engine
        .connections
        .get(peer)
        .filter(|c| c.status == ConnStatus::Connected)
        .and_then(|c| c.session);
    let Some(session) = session else {
        tracing::debug!(peer = %peer, "data before pairing completed, dropped");
        return Ok(());
    };

    let frame = Frame::decode(&data)?;
    frame.verify(session.key())?;
    if !session.accept_counter(frame.counter) {
        return Err(ServerError::Replayed {
            peer: peer.to_string(),
            counter: frame.counter,
        });
    }
    engine.deliver(peer, &frame.data);
    Ok(())
}

async fn complete_key_agreement(
    engine: &Engine,
    peer: &Peer,
    role: Role,
    transport: &Transport,
    share: &[u8],
) -> Result<(), ServerError> {
    let share =
        std::str::from_utf8(share).map_err(|_| ServerError::Protocol("key share is not UTF-8"))?;
    let theirs = crypto::ephemeral_key_from_string(share)?;

    let status = engine.connections.get(peer).map(|c| c.status);
    let open = match role {
        Role::Initiator => matches!(status, Some(ConnStatus::Connecting | ConnStatus::ConnSent)),
        Role::Responder => status == Some(ConnStatus::Incoming),
    };
    if !open {
        tracing::debug!(peer = %peer, status = ?status, "key share outside a handshake, dropped");
        return Ok(());
    }

    if !engine.pending.contains_key(peer) {
        match role {
            // Their share overtook the accept: answer with ours now
            Role::Initiator => send_key_share(engine, peer, transport).await?,
            Role::Responder => {
                tracing::debug!(peer = %peer, "unsolicited key share, dropped");
                return Ok(());
            }
        }
    }
    let Some((_, ours)) = engine.pending.remove(peer) else {
        return Ok(());
    };

    let secret = ours.shared_secret(&theirs)?;
    let session = match role {
        Role::Initiator => derive_session_key(&secret, &ours.public, &theirs),
        Role::Responder => derive_session_key(&secret, &theirs, &ours.public),
    };
    if connection::establish(&engine.connections, peer, session).is_some() {
        tracing::info!(peer = %peer, "paired, session key established");
    }
    Ok(())
}
