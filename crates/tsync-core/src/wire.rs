//! tsync wire format: the text messages exchanged over UDP.
//!
//! These strings ARE the protocol. Every message is one UTF-8 line, tokens
//! separated by single spaces, names quoted:
//!
//! ```text
//! tsync1 "<name>" <pubkey> e <epoch>          discovery beacon (signed envelope)
//! connect1 "<requester>" "<target>"           pairing request
//! accept1 "<target>"                          pairing accepted
//! reject1 "<target>" "<reason>"               pairing refused
//! data1 "<target>" <signed-payload>           signed payload for a paired peer
//! ```
//!
//! Inside a `data1` envelope the signed bytes are either a key share
//! (`ecdh1 x.<key>`) or, once paired, an application [`Frame`]:
//!
//! ```text
//! msg1 <counter> m.<mac> <data>
//! ```
//!
//! Every datagram must fit in 508 bytes so it is never fragmented on IPv4.
//! Quoted strings escape `"` and `\` (and `\n`, `\r`, `\t`) with a backslash.

use ed25519_dalek::VerifyingKey;
use thiserror::Error;

use crate::crypto::{self, CryptoError, Identity, SessionKey, SignedMessage};
use crate::encoding::{self, MAC_TAG};

/// Largest UDP payload that survives any IPv4 path unfragmented
/// (576 minimum reassembly size, minus a 60 byte IP header and 8 byte UDP header).
pub const MAX_DATAGRAM: usize = 508;

pub const BEACON_TAG: &str = "tsync1";
pub const CONNECT_TAG: &str = "connect1";
pub const ACCEPT_TAG: &str = "accept1";
pub const REJECT_TAG: &str = "reject1";
pub const DATA_TAG: &str = "data1";
pub const FRAME_TAG: &str = "msg1";

/// Epoch marker inside a beacon.
const EPOCH_MARKER: &str = "e";

// ── Quoting ───────────────────────────────────────────────────────────────────

/// Append `s` to `out` as a quoted, escaped token.
pub fn push_quoted(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Cursor over one message line.
struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    fn separator(&mut self) -> Result<(), WireError> {
        self.rest = self
            .rest
            .strip_prefix(' ')
            .ok_or(WireError::Malformed("expected a space between tokens"))?;
        Ok(())
    }

    /// Bare token, up to the next space or the end of the line.
    fn word(&mut self) -> Result<&'a str, WireError> {
        let end = self.rest.find(' ').unwrap_or(self.rest.len());
        let (word, rest) = self.rest.split_at(end);
        if word.is_empty() {
            return Err(WireError::Malformed("empty token"));
        }
        self.rest = rest;
        Ok(word)
    }

    fn quoted(&mut self) -> Result<String, WireError> {
        let mut chars = self.rest.char_indices();
        match chars.next() {
            Some((_, '"')) => {}
            _ => return Err(WireError::Malformed("expected a quoted string")),
        }
        let mut out = String::new();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.rest = &self.rest[i + 1..];
                    return Ok(out);
                }
                '\\' => match chars.next() {
                    Some((_, '"')) => out.push('"'),
                    Some((_, '\\')) => out.push('\\'),
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, 't')) => out.push('\t'),
                    _ => return Err(WireError::Malformed("invalid escape in quoted string")),
                },
                c => out.push(c),
            }
        }
        Err(WireError::Malformed("unterminated quoted string"))
    }

    fn end(&self) -> Result<(), WireError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(WireError::Malformed("trailing data after message"))
        }
    }
}

/// Split a leading quoted string off `line`, returning it unescaped along
/// with whatever follows the closing quote.
pub fn split_quoted(line: &str) -> Result<(String, &str), WireError> {
    let mut t = Tokens::new(line);
    let s = t.quoted()?;
    Ok((s, t.rest))
}

fn line_from(datagram: &[u8]) -> Result<&str, WireError> {
    if datagram.len() > MAX_DATAGRAM {
        return Err(WireError::TooLarge {
            len: datagram.len(),
            max: MAX_DATAGRAM,
        });
    }
    std::str::from_utf8(datagram).map_err(|_| WireError::NotUtf8)
}

fn check_size(encoded: String) -> Result<String, WireError> {
    if encoded.len() > MAX_DATAGRAM {
        return Err(WireError::TooLarge {
            len: encoded.len(),
            max: MAX_DATAGRAM,
        });
    }
    Ok(encoded)
}

// ── Beacon ────────────────────────────────────────────────────────────────────

/// Discovery announcement: who we are and how many times we have said so.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub name: String,
    /// `p.` encoded Ed25519 key of the sender.
    pub public_key: String,
    /// Sender's broadcast counter. Strictly increasing while it runs.
    pub epoch: i32,
}

impl Beacon {
    /// Plain text form, before signing.
    pub fn to_line(&self) -> String {
        let mut out = String::with_capacity(64 + self.name.len());
        out.push_str(BEACON_TAG);
        out.push(' ');
        push_quoted(&mut out, &self.name);
        out.push(' ');
        out.push_str(&self.public_key);
        out.push(' ');
        out.push_str(EPOCH_MARKER);
        out.push(' ');
        out.push_str(&self.epoch.to_string());
        out
    }

    pub fn parse_line(line: &str) -> Result<Self, WireError> {
        let mut t = Tokens::new(line);
        if t.word()? != BEACON_TAG {
            return Err(WireError::UnknownMessage(truncated(line)));
        }
        t.separator()?;
        let name = t.quoted()?;
        t.separator()?;
        let public_key = t.word()?.to_string();
        t.separator()?;
        if t.word()? != EPOCH_MARKER {
            return Err(WireError::Malformed("missing epoch marker"));
        }
        t.separator()?;
        let epoch = t
            .word()?
            .parse()
            .map_err(|_| WireError::Malformed("epoch is not a 32-bit integer"))?;
        t.end()?;
        Ok(Self {
            name,
            public_key,
            epoch,
        })
    }

    /// Sign with `identity` and return the datagram to multicast.
    pub fn seal(&self, identity: &Identity) -> Result<String, WireError> {
        check_size(identity.sign_message(self.to_line().as_bytes()))
    }

    /// Decode a beacon datagram and verify it against the key it carries.
    ///
    /// A beacon is self-certifying: whoever holds the private key for the
    /// announced public key signed it. Returns the decoded key alongside.
    pub fn open(datagram: &[u8]) -> Result<(Self, VerifyingKey), WireError> {
        let envelope = SignedMessage::parse(line_from(datagram)?)?;
        let line = std::str::from_utf8(envelope.unverified()).map_err(|_| WireError::NotUtf8)?;
        let beacon = Self::parse_line(line)?;
        let key = crypto::public_key_from_string(&beacon.public_key)?;
        envelope.verify(&key)?;
        Ok((beacon, key))
    }
}

// ── Pairing messages ──────────────────────────────────────────────────────────

/// Unicast messages between two peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect { requester: String, target: String },
    Accept { target: String },
    Reject { target: String, reason: String },
    /// `payload` is an `s.` envelope signed by the sender's identity.
    Data { target: String, payload: String },
}

impl Message {
    /// Name of the node this message is addressed to.
    pub fn target(&self) -> &str {
        match self {
            Message::Connect { target, .. }
            | Message::Accept { target }
            | Message::Reject { target, .. }
            | Message::Data { target, .. } => target,
        }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        let mut out = String::new();
        match self {
            Message::Connect { requester, target } => {
                out.push_str(CONNECT_TAG);
                out.push(' ');
                push_quoted(&mut out, requester);
                out.push(' ');
                push_quoted(&mut out, target);
            }
            Message::Accept { target } => {
                out.push_str(ACCEPT_TAG);
                out.push(' ');
                push_quoted(&mut out, target);
            }
            Message::Reject { target, reason } => {
                out.push_str(REJECT_TAG);
                out.push(' ');
                push_quoted(&mut out, target);
                out.push(' ');
                push_quoted(&mut out, reason);
            }
            Message::Data { target, payload } => {
                out.push_str(DATA_TAG);
                out.push(' ');
                push_quoted(&mut out, target);
                out.push(' ');
                out.push_str(payload);
            }
        }
        check_size(out)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let line = line_from(datagram)?;
        let mut t = Tokens::new(line);
        let msg = match t.word()? {
            CONNECT_TAG => {
                t.separator()?;
                let requester = t.quoted()?;
                t.separator()?;
                let target = t.quoted()?;
                Message::Connect { requester, target }
            }
            ACCEPT_TAG => {
                t.separator()?;
                Message::Accept {
                    target: t.quoted()?,
                }
            }
            REJECT_TAG => {
                t.separator()?;
                let target = t.quoted()?;
                t.separator()?;
                let reason = t.quoted()?;
                Message::Reject { target, reason }
            }
            DATA_TAG => {
                t.separator()?;
                let target = t.quoted()?;
                t.separator()?;
                let payload = t.word()?.to_string();
                Message::Data { target, payload }
            }
            _ => return Err(WireError::UnknownMessage(truncated(line))),
        };
        t.end()?;
        Ok(msg)
    }
}

// ── Session frames ────────────────────────────────────────────────────────────

/// Application payload bound to one pairing session.
///
/// `counter` rises by one per frame from each sender and `mac` is the session
/// key's MAC over counter and data, so a frame cannot be replayed into the
/// same session or carried over to another one. `data` is opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub counter: u64,
    pub mac: [u8; 32],
    pub data: Vec<u8>,
}

impl Frame {
    pub fn seal(key: &SessionKey, counter: u64, data: &[u8]) -> Self {
        Self {
            counter,
            mac: key.mac(counter, data),
            data: data.to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!(
            "{FRAME_TAG} {} {} ",
            self.counter,
            encoding::encode_bytes(MAC_TAG, &self.mac)
        )
        .into_bytes();
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut parts = bytes.splitn(4, |b| *b == b' ');
        if parts.next() != Some(FRAME_TAG.as_bytes()) {
            return Err(WireError::Malformed("not a session frame"));
        }
        let counter = parts
            .next()
            .filter(|c| !c.is_empty() && c.iter().all(u8::is_ascii_digit))
            .and_then(|c| std::str::from_utf8(c).ok()?.parse().ok())
            .ok_or(WireError::Malformed("invalid frame counter"))?;
        let mac = parts
            .next()
            .and_then(|m| std::str::from_utf8(m).ok())
            .ok_or(WireError::Malformed("missing frame MAC"))?;
        let mac = encoding::decode_array(MAC_TAG, mac).map_err(CryptoError::from)?;
        let data = parts
            .next()
            .ok_or(WireError::Malformed("missing frame data"))?
            .to_vec();
        Ok(Self { counter, mac, data })
    }

    pub fn verify(&self, key: &SessionKey) -> Result<(), WireError> {
        key.verify_mac(self.counter, &self.data, &self.mac)?;
        Ok(())
    }
}

fn truncated(line: &str) -> String {
    line.chars().take(32).collect()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message of {len} bytes exceeds the {max} byte datagram budget")]
    TooLarge { len: usize, max: usize },

    #[error("message is not valid UTF-8")]
    NotUtf8,

    #[error("unknown message starting with {0:?}")]
    UnknownMessage(String),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
