//! Cryptographic primitives for tsync.
//!
//! Provides three things:
//!   1. Ed25519 identity: the node's long-term signing key, signed envelopes
//!   2. X25519 ephemeral key agreement: one keypair per pairing attempt
//!   3. Human hash: a short decimal fingerprint people can read to each other
//!
//! Session keys are derived from the X25519 shared secret with BLAKE3.
//! All secret material is zeroized on drop. There is no unsafe code in this
//! module.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, SIGNATURE_LENGTH};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

pub use ed25519_dalek::VerifyingKey;
pub use x25519_dalek::PublicKey as EphemeralPublicKey;
use zeroize::Zeroizing;

use crate::encoding::{
    self, EncodingError, EPHEMERAL_KEY_TAG, PRIVATE_KEY_TAG, PUBLIC_KEY_TAG, SIGNED_TAG,
};

/// Separates the message from the signature inside a signed envelope.
/// Not part of the base64url alphabet, so the split is unambiguous.
const SIGNATURE_SEPARATOR: char = '/';

/// BLAKE3 `derive_key` context for pairing session keys.
const SESSION_KEY_CONTEXT: &str = "tsync 2025 pairing session key v1";

fn random_seed() -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut seed = Zeroizing::new([0u8; 32]);
    OsRng
        .try_fill_bytes(seed.as_mut_slice())
        .map_err(|e| CryptoError::Entropy(e.to_string()))?;
    Ok(seed)
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// A node's long-term Ed25519 signing identity.
///
/// Generated once per node and persisted by the daemon. The public key is
/// announced in every discovery beacon; the private key never leaves this
/// struct except through [`Identity::private_key_to_string`] for storage.
pub struct Identity {
    signing: SigningKey,
    /// Public half: announced to peers, used to verify our signatures.
    pub public: VerifyingKey,
}

impl Identity {
    /// Generate a fresh identity. Fails only if the OS entropy source does.
    pub fn generate() -> Result<Self, CryptoError> {
        let seed = random_seed()?;
        Ok(Self::from_seed(&seed))
    }

    fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let public = signing.verifying_key();
        Self { signing, public }
    }

    /// Rebuild an identity from its stored `k.` string.
    ///
    /// Accepts the 32-byte seed, or the 64-byte seed||public form in which
    /// case the public half must match the one derived from the seed.
    pub fn from_private_string(s: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(encoding::decode_bytes(PRIVATE_KEY_TAG, s)?);
        match bytes.len() {
            32 => {
                let mut seed = Zeroizing::new([0u8; 32]);
                seed.copy_from_slice(&bytes);
                Ok(Self::from_seed(&seed))
            }
            64 => {
                let mut seed = Zeroizing::new([0u8; 32]);
                seed.copy_from_slice(&bytes[..32]);
                let id = Self::from_seed(&seed);
                if id.public.as_bytes()[..] != bytes[32..] {
                    return Err(CryptoError::InvalidKey(
                        "public half does not match private seed".into(),
                    ));
                }
                Ok(id)
            }
            n => Err(EncodingError::WrongLength { expected: 32, got: n }.into()),
        }
    }

    /// Serialize the private seed for persistent storage (mode 0600).
    pub fn private_key_to_string(&self) -> Zeroizing<String> {
        let seed = Zeroizing::new(self.signing.to_bytes());
        Zeroizing::new(encoding::encode_bytes(PRIVATE_KEY_TAG, &seed[..]))
    }

    /// Transport form of the public key, as carried in beacons.
    pub fn public_key_to_string(&self) -> String {
        public_key_to_string(&self.public)
    }

    /// Our own human fingerprint, for display next to peers' ones.
    pub fn human_id(&self) -> String {
        human_hash(self.public.as_bytes())
    }

    /// Sign `message` and wrap both in a self-delimited `s.` envelope.
    pub fn sign_message(&self, message: &[u8]) -> String {
        let signature = self.signing.sign(message);
        let mut out = encoding::encode_bytes(SIGNED_TAG, message);
        out.push(SIGNATURE_SEPARATOR);
        out.push_str(&encoding::encode_bytes("", &signature.to_bytes()));
        out
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public_key_to_string())
            .finish_non_exhaustive()
    }
}

/// Encode an Ed25519 public key as `p.<base64url>`.
pub fn public_key_to_string(key: &VerifyingKey) -> String {
    encoding::encode_bytes(PUBLIC_KEY_TAG, key.as_bytes())
}

/// Decode a `p.` string back into an Ed25519 public key.
pub fn public_key_from_string(s: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes: [u8; 32] = encoding::decode_array(PUBLIC_KEY_TAG, s)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

// ── Signed envelopes ──────────────────────────────────────────────────────────

/// A parsed but not yet verified `s.<message>/<signature>` envelope.
///
/// Beacons are self-certifying: the receiver needs the message to learn which
/// key to verify with. Nothing read through [`SignedMessage::unverified`] may
/// be trusted until [`SignedMessage::verify`] has succeeded.
#[derive(Debug, Clone)]
pub struct SignedMessage {
    message: Vec<u8>,
    signature: Signature,
}

impl SignedMessage {
    pub fn parse(signed: &str) -> Result<Self, CryptoError> {
        let (message, signature) = signed.split_once(SIGNATURE_SEPARATOR).ok_or_else(|| {
            CryptoError::SignatureInvalid("invalid signed message format, missing '/'".into())
        })?;
        let message = encoding::decode_bytes(SIGNED_TAG, message)
            .map_err(|e| CryptoError::SignatureInvalid(format!("failed to decode message: {e}")))?;
        let signature: [u8; SIGNATURE_LENGTH] = encoding::decode_array("", signature).map_err(
            |e| CryptoError::SignatureInvalid(format!("failed to decode signature: {e}")),
        )?;
        Ok(Self {
            message,
            signature: Signature::from_bytes(&signature),
        })
    }

    /// The enclosed bytes, before any signature check.
    pub fn unverified(&self) -> &[u8] {
        &self.message
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), CryptoError> {
        key.verify_strict(&self.message, &self.signature)
            .map_err(|_| CryptoError::SignatureInvalid("signature verification failed".into()))
    }

    /// Verify and hand back the message; nothing is returned on failure.
    pub fn into_verified(self, key: &VerifyingKey) -> Result<Vec<u8>, CryptoError> {
        self.verify(key)?;
        Ok(self.message)
    }
}

/// Check a signed envelope against `key` and return the enclosed message.
pub fn verify_signed_message(signed: &str, key: &VerifyingKey) -> Result<Vec<u8>, CryptoError> {
    SignedMessage::parse(signed)?.into_verified(key)
}

// ── Human hash ────────────────────────────────────────────────────────────────

/// Short human-friendly fingerprint, formatted `DDD-DDDD`.
///
/// Digits come from SHA-256 bytes below 250 (bytes 250..=255 are skipped so
/// `% 10` has no bias). The fourth digit drawn is printed last. If a digest
/// runs out of usable bytes the digest itself is hashed again, which keeps
/// the function total and deterministic.
///
/// For humans comparing screens, not a security boundary on its own.
pub fn human_hash(data: &[u8]) -> String {
    let mut digits = [0u8; 7];
    let mut found = 0;
    let mut digest: [u8; 32] = Sha256::digest(data).into();
    while found < digits.len() {
        for &b in digest.iter() {
            if b >= 250 {
                continue;
            }
            digits[found] = b'0' + b % 10;
            found += 1;
            if found == digits.len() {
                break;
            }
        }
        digest = Sha256::digest(digest).into();
    }
    let mut out = String::with_capacity(8);
    out.extend(digits[..3].iter().map(|&d| d as char));
    out.push('-');
    out.extend(digits[4..].iter().map(|&d| d as char));
    out.push(digits[3] as char);
    out
}

// ── Ephemeral key agreement ───────────────────────────────────────────────────

/// Short-lived X25519 keypair for one pairing attempt. Never persisted.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    pub public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let seed = random_seed()?;
        let secret = StaticSecret::from(*seed);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key_to_string(&self) -> String {
        encoding::encode_bytes(EPHEMERAL_KEY_TAG, self.public.as_bytes())
    }

    /// X25519 with the peer's ephemeral key.
    ///
    /// Rejects low-order peer keys that would force an all-zero secret.
    /// The result seeds a session key; never log, store, or reuse it.
    pub fn shared_secret(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.secret.diffie_hellman(peer);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey("non-contributory peer key".into()));
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public_key_to_string())
            .finish_non_exhaustive()
    }
}

/// Decode an `x.` ephemeral public key. Any 32 bytes are a valid X25519 key.
pub fn ephemeral_key_from_string(s: &str) -> Result<PublicKey, CryptoError> {
    let bytes: [u8; 32] = encoding::decode_array(EPHEMERAL_KEY_TAG, s)?;
    Ok(PublicKey::from(bytes))
}

// ── Session key ───────────────────────────────────────────────────────────────

/// Symmetric key for one established pairing. Debug output is redacted.
#[derive(Clone)]
pub struct SessionKey(Zeroizing<[u8; 32]>);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Keyed BLAKE3 over `counter || data`, tying a payload to this session
    /// and to its position in it.
    pub fn mac(&self, counter: u64, data: &[u8]) -> [u8; 32] {
        self.mac_hash(counter, data).into()
    }

    /// Check a tag from [`SessionKey::mac`]. The comparison is constant-time.
    pub fn verify_mac(
        &self,
        counter: u64,
        data: &[u8],
        mac: &[u8; 32],
    ) -> Result<(), CryptoError> {
        if self.mac_hash(counter, data) == blake3::Hash::from(*mac) {
            Ok(())
        } else {
            Err(CryptoError::SignatureInvalid("session MAC mismatch".into()))
        }
    }

    fn mac_hash(&self, counter: u64, data: &[u8]) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(&counter.to_be_bytes());
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Derive the session key both sides agree on.
///
///   key = BLAKE3-derive_key(ctx, secret || initiator_pub || responder_pub)
///
/// Binding both ephemeral public keys means each side must agree on who
/// initiated.
pub fn derive_session_key(
    secret: &[u8; 32],
    initiator: &PublicKey,
    responder: &PublicKey,
) -> SessionKey {
    let mut material = Zeroizing::new([0u8; 96]);
    material[..32].copy_from_slice(secret);
    material[32..64].copy_from_slice(initiator.as_bytes());
    material[64..].copy_from_slice(responder.as_bytes());
    SessionKey(Zeroizing::new(blake3::derive_key(
        SESSION_KEY_CONTEXT,
        &material[..],
    )))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("entropy source failure: {0}")]
    Entropy(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // ── Identity ──────────────────────────────────────────────────────────────

    #[test]
    fn identity_public_key_roundtrip() {
        let alice = Identity::generate().unwrap();
        let s = alice.public_key_to_string();
        assert!(s.starts_with("p."));
        let decoded = public_key_from_string(&s).unwrap();
        assert_eq!(decoded, alice.public);
    }

    #[test]
    fn identity_public_key_wrong_tag_rejected() {
        let alice = Identity::generate().unwrap();
        let s = alice.public_key_to_string();
        let bad = format!("AA{}", &s[2..]);
        assert!(public_key_from_string(&bad).is_err());
        assert!(public_key_from_string(&s[2..]).is_err());
    }

    #[test]
    fn identity_corrupted_key_fails_or_differs() {
        let alice = Identity::generate().unwrap();
        let s = alice.public_key_to_string();
        let bad = format!("p.AA{}", &s[4..]);
        if let (Ok(k), false) = (public_key_from_string(&bad), &s[2..4] == "AA") {
            assert_ne!(k, alice.public);
        }
        assert!(public_key_from_string("p.AAAA").is_err());
    }

    #[test]
    fn identity_private_key_roundtrip() {
        let alice = Identity::generate().unwrap();
        let stored = alice.private_key_to_string();
        assert!(stored.starts_with("k."));
        let restored = Identity::from_private_string(&stored).unwrap();
        assert_eq!(restored.public, alice.public);
        // A public key string is not a private key
        assert!(Identity::from_private_string(&alice.public_key_to_string()).is_err());
    }

    #[test]
    fn identity_accepts_seed_and_public_form() {
        let alice = Identity::generate().unwrap();
        let mut long = alice.signing.to_bytes().to_vec();
        long.extend_from_slice(alice.public.as_bytes());
        let s = encoding::encode_bytes(PRIVATE_KEY_TAG, &long);
        let restored = Identity::from_private_string(&s).unwrap();
        assert_eq!(restored.public, alice.public);

        // Mismatched public half is refused
        let bob = Identity::generate().unwrap();
        long[32..].copy_from_slice(bob.public.as_bytes());
        let s = encoding::encode_bytes(PRIVATE_KEY_TAG, &long);
        assert!(Identity::from_private_string(&s).is_err());
    }

    #[test]
    fn identity_debug_hides_private_key() {
        let alice = Identity::generate().unwrap();
        let dbg = format!("{alice:?}");
        assert!(dbg.contains(&alice.public_key_to_string()));
        assert!(!dbg.contains(alice.private_key_to_string().as_str()));
    }

    // ── Signed messages ───────────────────────────────────────────────────────

    #[test]
    fn sign_verify_roundtrip() {
        let alice = Identity::generate().unwrap();
        let msg = b"This is another test message";
        let signed = alice.sign_message(msg);
        assert!(signed.starts_with("s."));
        let verified = verify_signed_message(&signed, &alice.public).unwrap();
        assert_eq!(verified, msg);
    }

    #[test]
    fn verify_with_wrong_key_fails() {
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();
        let signed = alice.sign_message(b"hello");
        let err = verify_signed_message(&signed, &bob.public).unwrap_err();
        assert!(matches!(err, CryptoError::SignatureInvalid(_)));
    }

    #[test]
    fn tampered_envelope_fails() {
        let alice = Identity::generate().unwrap();
        let signed = alice.sign_message(b"hello there");

        // Last signature character flipped
        let last = signed.chars().last().unwrap();
        let replacement = if last == 'A' { 'B' } else { 'A' };
        let tampered = format!("{}{}", &signed[..signed.len() - 1], replacement);
        assert!(verify_signed_message(&tampered, &alice.public).is_err());

        // Message body altered but signature kept
        let (_, sig) = signed.split_once('/').unwrap();
        let forged = format!("{}/{}", encoding::encode_bytes(SIGNED_TAG, b"hello therf"), sig);
        assert!(verify_signed_message(&forged, &alice.public).is_err());
    }

    #[test]
    fn malformed_envelopes_fail() {
        let alice = Identity::generate().unwrap();
        for bad in ["", "s.aGVsbG8", "p.aGVsbG8/AAAA", "s.aGVsbG8/short", "s.*/AAAA"] {
            assert!(
                matches!(
                    verify_signed_message(bad, &alice.public),
                    Err(CryptoError::SignatureInvalid(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn unverified_view_matches_message() {
        let alice = Identity::generate().unwrap();
        let parsed = SignedMessage::parse(&alice.sign_message(b"beacon")).unwrap();
        assert_eq!(parsed.unverified(), b"beacon");
        assert!(parsed.verify(&alice.public).is_ok());
    }

    // ── Human hash ────────────────────────────────────────────────────────────

    #[test]
    fn human_hash_known_values() {
        for (input, expected) in [
            (&b""[..], "766-2806"),
            (b"hello", "427-5636"),
            (b"heLlo", "002-9560"),
            (b"The quick brown fox jumps over the lazy dog", "589-5887"),
            (b"The quick brown fox jumqs over the lazy dog", "203-0565"),
        ] {
            assert_eq!(human_hash(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn human_hash_is_deterministic_and_well_formed() {
        let a = human_hash(b"tsync");
        assert_eq!(a, human_hash(b"tsync"));
        assert_eq!(a.len(), 8);
        assert_eq!(a.as_bytes()[3], b'-');
        assert!(a
            .bytes()
            .enumerate()
            .all(|(i, c)| i == 3 || c.is_ascii_digit()));
    }

    fn expected_collisions(m: u64, n: u64) -> u64 {
        ((m * (m - 1)) as f64 / (2.0 * n as f64)).round() as u64
    }

    #[test]
    fn human_hash_distribution() {
        const N: u64 = 100_000;
        let mut seen: HashMap<String, u64> = HashMap::with_capacity(N as usize);
        let mut collisions = 0u64;
        for i in 0..N {
            if seen.insert(human_hash(i.to_string().as_bytes()), i).is_some() {
                collisions += 1;
            }
        }
        let expect = expected_collisions(N, 10_000_000);
        let margin = 1 + 3 * expect / 100;
        assert!(
            collisions + margin >= expect && collisions <= expect + margin,
            "{collisions} collisions for {N} inputs, expected {expect} +/- {margin}"
        );
    }

    // ── Ephemeral keys ────────────────────────────────────────────────────────

    #[test]
    fn ephemeral_key_roundtrip() {
        let kp = EphemeralKeyPair::generate().unwrap();
        let s = kp.public_key_to_string();
        assert!(s.starts_with("x."));
        assert_eq!(ephemeral_key_from_string(&s).unwrap().as_bytes(), kp.public.as_bytes());
        // An identity key string is not an ephemeral key
        let id = Identity::generate().unwrap();
        assert!(ephemeral_key_from_string(&id.public_key_to_string()).is_err());
        assert!(ephemeral_key_from_string("x.AAAA").is_err());
    }

    #[test]
    fn ephemeral_corrupted_key_differs() {
        let kp = EphemeralKeyPair::generate().unwrap();
        let s = kp.public_key_to_string();
        let bad = format!("x.AA{}", &s[4..]);
        let decoded = ephemeral_key_from_string(&bad).unwrap();
        if &s[2..4] != "AA" {
            assert_ne!(decoded.as_bytes(), kp.public.as_bytes());
        }
    }

    #[test]
    fn shared_secret_agrees() {
        let alice = EphemeralKeyPair::generate().unwrap();
        let bob = EphemeralKeyPair::generate().unwrap();
        let alice_pub = ephemeral_key_from_string(&alice.public_key_to_string()).unwrap();
        let bob_pub = ephemeral_key_from_string(&bob.public_key_to_string()).unwrap();
        let a = alice.shared_secret(&bob_pub).unwrap();
        let b = bob.shared_secret(&alice_pub).unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, [0u8; 32]);
    }

    #[test]
    fn low_order_peer_key_rejected() {
        let alice = EphemeralKeyPair::generate().unwrap();
        assert!(alice.shared_secret(&PublicKey::from([0u8; 32])).is_err());
    }

    #[test]
    fn session_key_symmetric_and_order_sensitive() {
        let alice = EphemeralKeyPair::generate().unwrap();
        let bob = EphemeralKeyPair::generate().unwrap();
        let a_secret = alice.shared_secret(&bob.public).unwrap();
        let b_secret = bob.shared_secret(&alice.public).unwrap();

        let a_key = derive_session_key(&a_secret, &alice.public, &bob.public);
        let b_key = derive_session_key(&b_secret, &alice.public, &bob.public);
        assert_eq!(a_key.as_bytes(), b_key.as_bytes());

        // Swapping roles yields a different key
        let swapped = derive_session_key(&a_secret, &bob.public, &alice.public);
        assert_ne!(a_key.as_bytes(), swapped.as_bytes());

        assert_eq!(format!("{a_key:?}"), "SessionKey(..)");
    }

    fn session_pair() -> (SessionKey, SessionKey) {
        let alice = EphemeralKeyPair::generate().unwrap();
        let bob = EphemeralKeyPair::generate().unwrap();
        let secret = alice.shared_secret(&bob.public).unwrap();
        let other = bob.shared_secret(&EphemeralKeyPair::generate().unwrap().public).unwrap();
        (
            derive_session_key(&secret, &alice.public, &bob.public),
            derive_session_key(&other, &alice.public, &bob.public),
        )
    }

    #[test]
    fn session_mac_binds_key_counter_and_data() {
        let (key, other_session) = session_pair();
        let mac = key.mac(7, b"hello");
        assert!(key.verify_mac(7, b"hello", &mac).is_ok());

        assert!(key.verify_mac(8, b"hello", &mac).is_err());
        assert!(key.verify_mac(7, b"hellO", &mac).is_err());
        assert!(other_session.verify_mac(7, b"hello", &mac).is_err());
    }
}
