//! Command encoding: verb + properties.
//!
//! A command payload is:
//!
//! ```text
//! [verb_len u8][verb][prop]*
//! prop = [key_len u8][key][value_len u32 BE][value]
//! ```
//!
//! Verbs: `OPEN`, `UPDATE`, `KEEPALIVE`, `CLOSE` (requests) and `OK`,
//! `ERROR` (replies). Requests carry an opaque `token` property that the
//! receiver hands to its auth layer untouched. Update entries are nested
//! binary values under repeated `entry` properties.

use crate::codec::{Result, WireError};
use bytes::{Bytes, BytesMut};
use trellis_core::action::{RouteUpdate, UpdateEntry};
use trellis_core::route::{NodePath, PeerInfo, Protocol, Route};

pub const VERB_OPEN: &[u8] = b"OPEN";
pub const VERB_UPDATE: &[u8] = b"UPDATE";
pub const VERB_KEEPALIVE: &[u8] = b"KEEPALIVE";
pub const VERB_CLOSE: &[u8] = b"CLOSE";
pub const VERB_OK: &[u8] = b"OK";
pub const VERB_ERROR: &[u8] = b"ERROR";

const PROP_NAME: &[u8] = b"name";
const PROP_ENDPOINT: &[u8] = b"endpoint";
const PROP_DOMAINS: &[u8] = b"domains";
const PROP_PEER_TOKEN: &[u8] = b"peer-token";
const PROP_TOKEN: &[u8] = b"token";
const PROP_ENTRY: &[u8] = b"entry";
const PROP_CODE: &[u8] = b"code";
const PROP_REASON: &[u8] = b"reason";

const ENTRY_ADD: u8 = 1;
const ENTRY_REMOVE: u8 = 2;

/// A parsed peering command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Open {
        peer: PeerInfo,
        token: Option<String>,
    },
    Update {
        peer: PeerInfo,
        update: RouteUpdate,
        token: Option<String>,
    },
    Keepalive {
        peer: PeerInfo,
        token: Option<String>,
    },
    Close {
        peer: PeerInfo,
        code: u16,
        reason: Option<String>,
        token: Option<String>,
    },
    Ok,
    Error {
        reason: String,
    },
}

impl PeerCommand {
    /// Stable tag for logging.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Update { .. } => "update",
            Self::Keepalive { .. } => "keepalive",
            Self::Close { .. } => "close",
            Self::Ok => "ok",
            Self::Error { .. } => "error",
        }
    }
}

// =========================
// Low-level walk
// =========================

/// Borrowed view of a command: verb plus raw properties.
#[derive(Debug, Clone)]
struct RawCommand<'a> {
    verb: &'a [u8],
    props: Vec<RawProp<'a>>,
}

#[derive(Debug, Clone)]
struct RawProp<'a> {
    key: &'a [u8],
    value: &'a [u8],
}

impl<'a> RawCommand<'a> {
    fn get(&self, key: &[u8]) -> Option<&'a [u8]> {
        self.props.iter().find(|p| p.key == key).map(|p| p.value)
    }

    fn get_str(&self, key: &[u8]) -> Result<Option<String>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => std::str::from_utf8(v)
                .map(|s| Some(s.to_string()))
                .map_err(|_| WireError::Protocol),
        }
    }

    fn require_str(&self, key: &[u8]) -> Result<String> {
        self.get_str(key)?.ok_or(WireError::Protocol)
    }

    fn entries(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.props
            .iter()
            .filter(|p| p.key == PROP_ENTRY)
            .map(|p| p.value)
    }
}

fn parse_raw(payload: &[u8]) -> Result<RawCommand<'_>> {
    let mut i = 0usize;
    let b = payload;

    if b.is_empty() {
        return Err(WireError::Protocol);
    }

    let verb_len = b[0] as usize;
    i += 1;
    if b.len() < i + verb_len {
        return Err(WireError::Protocol);
    }
    let verb = &b[i..i + verb_len];
    i += verb_len;

    let mut props = Vec::new();
    while i < b.len() {
        let key_len = b[i] as usize;
        i += 1;
        if b.len() < i + key_len {
            return Err(WireError::Protocol);
        }
        let key = &b[i..i + key_len];
        i += key_len;

        if b.len() < i + 4 {
            return Err(WireError::Protocol);
        }
        let value_len =
            u32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]) as usize;
        i += 4;

        if b.len() < i + value_len {
            return Err(WireError::Protocol);
        }
        let value = &b[i..i + value_len];
        i += value_len;

        props.push(RawProp { key, value });
    }

    Ok(RawCommand { verb, props })
}

fn put_verb(buf: &mut BytesMut, verb: &[u8]) {
    buf.extend_from_slice(&[verb.len() as u8]);
    buf.extend_from_slice(verb);
}

fn put_prop(buf: &mut BytesMut, key: &[u8], value: &[u8]) {
    buf.extend_from_slice(&[key.len() as u8]);
    buf.extend_from_slice(key);
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
}

fn put_peer(buf: &mut BytesMut, peer: &PeerInfo) {
    put_prop(buf, PROP_NAME, peer.name.as_bytes());
    put_prop(buf, PROP_ENDPOINT, peer.endpoint.as_bytes());
    if !peer.domains.is_empty() {
        put_prop(buf, PROP_DOMAINS, peer.domains.join(",").as_bytes());
    }
    if let Some(token) = &peer.peer_token {
        put_prop(buf, PROP_PEER_TOKEN, token.as_bytes());
    }
}

fn put_token(buf: &mut BytesMut, token: Option<&str>) {
    if let Some(token) = token {
        put_prop(buf, PROP_TOKEN, token.as_bytes());
    }
}

fn parse_peer(raw: &RawCommand<'_>) -> Result<PeerInfo> {
    let name = raw.require_str(PROP_NAME)?;
    let endpoint = raw.require_str(PROP_ENDPOINT)?;
    let domains = raw
        .get_str(PROP_DOMAINS)?
        .map(|d| d.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    let peer_token = raw.get_str(PROP_PEER_TOKEN)?;
    Ok(PeerInfo {
        name,
        endpoint,
        domains,
        peer_token,
    })
}

// =========================
// Update entries
// =========================

const fn protocol_tag(protocol: Protocol) -> u8 {
    match protocol {
        Protocol::Http => 1,
        Protocol::HttpGraphql => 2,
        Protocol::Tcp => 3,
    }
}

fn protocol_from_tag(tag: u8) -> Result<Protocol> {
    match tag {
        1 => Ok(Protocol::Http),
        2 => Ok(Protocol::HttpGraphql),
        3 => Ok(Protocol::Tcp),
        _ => Err(WireError::Protocol),
    }
}

fn encode_entry(entry: &UpdateEntry) -> Result<Vec<u8>> {
    let route = &entry.route;
    if route.name.len() > u8::MAX as usize || route.endpoint.len() > u16::MAX as usize {
        return Err(WireError::SizeTooLarge);
    }
    let mut b = Vec::with_capacity(64);
    b.push(if entry.is_add() { ENTRY_ADD } else { ENTRY_REMOVE });
    b.push(route.name.len() as u8);
    b.extend_from_slice(route.name.as_bytes());
    b.push(protocol_tag(route.protocol));
    b.extend_from_slice(&(route.endpoint.len() as u16).to_be_bytes());
    b.extend_from_slice(route.endpoint.as_bytes());
    b.extend_from_slice(&route.envoy_port.unwrap_or(0).to_be_bytes());

    let path = entry.node_path.as_ref();
    let segments = path.map_or(0, |p| p.len());
    if segments > u8::MAX as usize {
        return Err(WireError::SizeTooLarge);
    }
    b.push(segments as u8);
    if let Some(path) = path {
        for segment in path {
            if segment.len() > u8::MAX as usize {
                return Err(WireError::SizeTooLarge);
            }
            b.push(segment.len() as u8);
            b.extend_from_slice(segment.as_bytes());
        }
    }
    Ok(b)
}

fn parse_entry(value: &[u8]) -> Result<UpdateEntry> {
    let mut i = 0usize;
    let take = |i: &mut usize, n: usize| -> Result<&[u8]> {
        if value.len() < *i + n {
            return Err(WireError::Protocol);
        }
        let slice = &value[*i..*i + n];
        *i += n;
        Ok(slice)
    };

    let action = take(&mut i, 1)?[0];
    let name_len = take(&mut i, 1)?[0] as usize;
    let name = std::str::from_utf8(take(&mut i, name_len)?)
        .map_err(|_| WireError::Protocol)?
        .to_string();
    let protocol = protocol_from_tag(take(&mut i, 1)?[0])?;
    let endpoint_len_bytes = take(&mut i, 2)?;
    let endpoint_len = u16::from_be_bytes([endpoint_len_bytes[0], endpoint_len_bytes[1]]) as usize;
    let endpoint = std::str::from_utf8(take(&mut i, endpoint_len)?)
        .map_err(|_| WireError::Protocol)?
        .to_string();
    let port_bytes = take(&mut i, 2)?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    let segments = take(&mut i, 1)?[0] as usize;
    let mut path = NodePath::new();
    for _ in 0..segments {
        let seg_len = take(&mut i, 1)?[0] as usize;
        let segment = std::str::from_utf8(take(&mut i, seg_len)?)
            .map_err(|_| WireError::Protocol)?
            .to_string();
        path.push(segment);
    }
    if i != value.len() {
        return Err(WireError::Protocol);
    }

    let route = Route {
        name,
        protocol,
        endpoint,
        envoy_port: (port != 0).then_some(port),
    };
    match action {
        ENTRY_ADD => Ok(UpdateEntry::add(route, path)),
        ENTRY_REMOVE => Ok(UpdateEntry::remove(route)),
        _ => Err(WireError::Protocol),
    }
}

// =========================
// Public encode / parse
// =========================

/// Encode a command into a frame payload.
pub fn encode(command: &PeerCommand) -> Result<Bytes> {
    let mut b = BytesMut::with_capacity(128);
    match command {
        PeerCommand::Open { peer, token } => {
            put_verb(&mut b, VERB_OPEN);
            put_peer(&mut b, peer);
            put_token(&mut b, token.as_deref());
        }
        PeerCommand::Update {
            peer,
            update,
            token,
        } => {
            put_verb(&mut b, VERB_UPDATE);
            put_peer(&mut b, peer);
            put_token(&mut b, token.as_deref());
            for entry in &update.updates {
                put_prop(&mut b, PROP_ENTRY, &encode_entry(entry)?);
            }
        }
        PeerCommand::Keepalive { peer, token } => {
            put_verb(&mut b, VERB_KEEPALIVE);
            put_peer(&mut b, peer);
            put_token(&mut b, token.as_deref());
        }
        PeerCommand::Close {
            peer,
            code,
            reason,
            token,
        } => {
            put_verb(&mut b, VERB_CLOSE);
            put_peer(&mut b, peer);
            put_prop(&mut b, PROP_CODE, &code.to_be_bytes());
            if let Some(reason) = reason {
                put_prop(&mut b, PROP_REASON, reason.as_bytes());
            }
            put_token(&mut b, token.as_deref());
        }
        PeerCommand::Ok => put_verb(&mut b, VERB_OK),
        PeerCommand::Error { reason } => {
            put_verb(&mut b, VERB_ERROR);
            put_prop(&mut b, PROP_REASON, reason.as_bytes());
        }
    }
    Ok(b.freeze())
}

/// Parse a frame payload into a command.
pub fn parse(payload: &[u8]) -> Result<PeerCommand> {
    let raw = parse_raw(payload)?;
    match raw.verb {
        VERB_OPEN => Ok(PeerCommand::Open {
            peer: parse_peer(&raw)?,
            token: raw.get_str(PROP_TOKEN)?,
        }),
        VERB_UPDATE => {
            let peer = parse_peer(&raw)?;
            let mut updates = Vec::new();
            for value in raw.entries() {
                updates.push(parse_entry(value)?);
            }
            Ok(PeerCommand::Update {
                peer,
                update: RouteUpdate::new(updates),
                token: raw.get_str(PROP_TOKEN)?,
            })
        }
        VERB_KEEPALIVE => Ok(PeerCommand::Keepalive {
            peer: parse_peer(&raw)?,
            token: raw.get_str(PROP_TOKEN)?,
        }),
        VERB_CLOSE => {
            let code_bytes = raw.get(PROP_CODE).ok_or(WireError::Protocol)?;
            if code_bytes.len() != 2 {
                return Err(WireError::Protocol);
            }
            let code = u16::from_be_bytes([code_bytes[0], code_bytes[1]]);
            Ok(PeerCommand::Close {
                peer: parse_peer(&raw)?,
                code,
                reason: raw.get_str(PROP_REASON)?,
                token: raw.get_str(PROP_TOKEN)?,
            })
        }
        VERB_OK => Ok(PeerCommand::Ok),
        VERB_ERROR => Ok(PeerCommand::Error {
            reason: raw.require_str(PROP_REASON)?,
        }),
        other => Err(WireError::UnknownVerb(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}
