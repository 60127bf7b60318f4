//! Wire protocol message definitions and framing.
//!
//! Every message travels as `type tag (2 bytes) || payload length (8 bytes,
//! big-endian) || payload`, with the payload in canonical serialization.
//! Payload lengths are capped per message type before any allocation, and
//! sequence counts inside peer messages use 2-byte prefixes.
//!
//! The handshake (`Hand`/`Shake`) carries the genesis hash and capabilities;
//! a genesis mismatch is grounds for immediate disconnect.

use crate::consensus;
use crate::core::block::{BlockHeader, FullBlock};
use crate::core::hash::Hash;
use crate::core::transaction::Transaction;
use crate::ser::{Readable, Reader, SerError, Writeable, Writer};

/// Protocol version spoken by this node.
pub const PROTOCOL_VERSION: u32 = 1;

/// Capability bits advertised in the handshake.
pub const CAP_FULL_NODE: u32 = 0b0001;
/// Can serve TxHashSet archives.
pub const CAP_ARCHIVE: u32 = 0b0010;

/// Caps on framed payloads. Most messages are small; an archive carries the
/// whole horizon state.
pub const MAX_PAYLOAD_LEN: u64 = 4 * 1024 * 1024;
pub const MAX_ARCHIVE_LEN: u64 = 256 * 1024 * 1024;

/// Cap on addresses per `PeerAddrs` message.
pub const MAX_PEER_ADDRS: u16 = 256;
/// Cap on locator hashes per `GetHeaders`.
pub const MAX_LOCATOR_HASHES: u16 = 32;
/// Cap on headers per `Headers` message.
pub const MAX_HEADERS_PER_MSG: u16 = 512;

/// Message type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    Hand = 0,
    Shake = 1,
    Ping = 2,
    Pong = 3,
    GetPeerAddrs = 4,
    PeerAddrs = 5,
    GetHeaders = 6,
    Header = 7,
    Headers = 8,
    GetBlock = 9,
    Block = 10,
    Transaction = 11,
    StemTransaction = 12,
    TxHashSetRequest = 13,
    TxHashSetArchive = 14,
}

impl MsgType {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => MsgType::Hand,
            1 => MsgType::Shake,
            2 => MsgType::Ping,
            3 => MsgType::Pong,
            4 => MsgType::GetPeerAddrs,
            5 => MsgType::PeerAddrs,
            6 => MsgType::GetHeaders,
            7 => MsgType::Header,
            8 => MsgType::Headers,
            9 => MsgType::GetBlock,
            10 => MsgType::Block,
            11 => MsgType::Transaction,
            12 => MsgType::StemTransaction,
            13 => MsgType::TxHashSetRequest,
            14 => MsgType::TxHashSetArchive,
            _ => return None,
        })
    }

    /// The payload cap enforced before allocating.
    pub fn max_payload_len(self) -> u64 {
        match self {
            MsgType::TxHashSetArchive => MAX_ARCHIVE_LEN,
            _ => MAX_PAYLOAD_LEN,
        }
    }
}

/// First message of the handshake, sent by the dialer.
#[derive(Clone, Debug, PartialEq)]
pub struct Hand {
    pub version: u32,
    pub capabilities: u32,
    pub nonce: u64,
    pub genesis: Hash,
    pub total_difficulty: u64,
    pub user_agent: String,
    pub listen_port: u16,
}

/// Handshake response.
#[derive(Clone, Debug, PartialEq)]
pub struct Shake {
    pub version: u32,
    pub capabilities: u32,
    pub genesis: Hash,
    pub total_difficulty: u64,
    pub user_agent: String,
}

/// Liveness probe carrying chain state, both directions.
#[derive(Clone, Debug, PartialEq)]
pub struct PingInfo {
    pub total_difficulty: u64,
    pub height: u64,
}

/// Block locator: recent best-chain hashes, newest first, exponentially
/// spaced.
#[derive(Clone, Debug, PartialEq)]
pub struct Locator {
    pub hashes: Vec<Hash>,
}

/// The protocol messages.
#[derive(Clone, Debug)]
pub enum Message {
    Hand(Hand),
    Shake(Shake),
    Ping(PingInfo),
    Pong(PingInfo),
    GetPeerAddrs,
    PeerAddrs(Vec<String>),
    GetHeaders(Locator),
    Header(Box<BlockHeader>),
    Headers(Vec<BlockHeader>),
    GetBlock(Hash),
    Block(Box<FullBlock>),
    Transaction(Box<Transaction>),
    StemTransaction(Box<Transaction>),
    TxHashSetRequest { height: u64, hash: Hash },
    TxHashSetArchive { height: u64, hash: Hash, bytes: Vec<u8> },
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Hand(_) => MsgType::Hand,
            Message::Shake(_) => MsgType::Shake,
            Message::Ping(_) => MsgType::Ping,
            Message::Pong(_) => MsgType::Pong,
            Message::GetPeerAddrs => MsgType::GetPeerAddrs,
            Message::PeerAddrs(_) => MsgType::PeerAddrs,
            Message::GetHeaders(_) => MsgType::GetHeaders,
            Message::Header(_) => MsgType::Header,
            Message::Headers(_) => MsgType::Headers,
            Message::GetBlock(_) => MsgType::GetBlock,
            Message::Block(_) => MsgType::Block,
            Message::Transaction(_) => MsgType::Transaction,
            Message::StemTransaction(_) => MsgType::StemTransaction,
            Message::TxHashSetRequest { .. } => MsgType::TxHashSetRequest,
            Message::TxHashSetArchive { .. } => MsgType::TxHashSetArchive,
        }
    }
}

fn write_string(writer: &mut Writer, s: &str) {
    let bytes = s.as_bytes();
    let truncated = &bytes[..bytes.len().min(u16::MAX as usize)];
    writer.write_bytes_short(truncated);
}

fn read_string(reader: &mut Reader<'_>, max: u16) -> Result<String, SerError> {
    let bytes = reader.read_bytes_short(max)?;
    String::from_utf8(bytes).map_err(|_| SerError::Corrupted("invalid utf-8 string"))
}

impl Writeable for Hand {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.version);
        writer.write_u32(self.capabilities);
        writer.write_u64(self.nonce);
        self.genesis.write(writer);
        writer.write_u64(self.total_difficulty);
        write_string(writer, &self.user_agent);
        writer.write_u16(self.listen_port);
    }
}

impl Readable for Hand {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        Ok(Hand {
            version: reader.read_u32()?,
            capabilities: reader.read_u32()?,
            nonce: reader.read_u64()?,
            genesis: Hash::read(reader)?,
            total_difficulty: reader.read_u64()?,
            user_agent: read_string(reader, 256)?,
            listen_port: reader.read_u16()?,
        })
    }
}

impl Writeable for Shake {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.version);
        writer.write_u32(self.capabilities);
        self.genesis.write(writer);
        writer.write_u64(self.total_difficulty);
        write_string(writer, &self.user_agent);
    }
}

impl Readable for Shake {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        Ok(Shake {
            version: reader.read_u32()?,
            capabilities: reader.read_u32()?,
            genesis: Hash::read(reader)?,
            total_difficulty: reader.read_u64()?,
            user_agent: read_string(reader, 256)?,
        })
    }
}

impl Writeable for PingInfo {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.total_difficulty);
        writer.write_u64(self.height);
    }
}

impl Readable for PingInfo {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        Ok(PingInfo {
            total_difficulty: reader.read_u64()?,
            height: reader.read_u64()?,
        })
    }
}

impl Writeable for Locator {
    fn write(&self, writer: &mut Writer) {
        writer.write_u16(self.hashes.len() as u16);
        for hash in &self.hashes {
            hash.write(writer);
        }
    }
}

impl Readable for Locator {
    fn read(reader: &mut Reader<'_>) -> Result<Self, SerError> {
        let count = reader.read_count_short(MAX_LOCATOR_HASHES)?;
        let mut hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            hashes.push(Hash::read(reader)?);
        }
        Ok(Locator { hashes })
    }
}

/// Serialize a message payload (without the frame header).
pub fn encode_payload(msg: &Message) -> Vec<u8> {
    let mut writer = Writer::new();
    match msg {
        Message::Hand(hand) => hand.write(&mut writer),
        Message::Shake(shake) => shake.write(&mut writer),
        Message::Ping(info) | Message::Pong(info) => info.write(&mut writer),
        Message::GetPeerAddrs => {}
        Message::PeerAddrs(addrs) => {
            writer.write_u16(addrs.len().min(MAX_PEER_ADDRS as usize) as u16);
            for addr in addrs.iter().take(MAX_PEER_ADDRS as usize) {
                write_string(&mut writer, addr);
            }
        }
        Message::GetHeaders(locator) => locator.write(&mut writer),
        Message::Header(header) => header.write(&mut writer),
        Message::Headers(headers) => {
            writer.write_u16(headers.len() as u16);
            for header in headers {
                header.write(&mut writer);
            }
        }
        Message::GetBlock(hash) => hash.write(&mut writer),
        Message::Block(block) => block.write(&mut writer),
        Message::Transaction(tx) | Message::StemTransaction(tx) => tx.write(&mut writer),
        Message::TxHashSetRequest { height, hash } => {
            writer.write_u64(*height);
            hash.write(&mut writer);
        }
        Message::TxHashSetArchive {
            height,
            hash,
            bytes,
        } => {
            writer.write_u64(*height);
            hash.write(&mut writer);
            writer.write_bytes_long(bytes);
        }
    }
    writer.into_vec()
}

/// Frame a message: tag, length, payload.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let payload = encode_payload(msg);
    let mut out = Vec::with_capacity(10 + payload.len());
    out.extend_from_slice(&(msg.msg_type() as u16).to_be_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Parse a frame header. Returns `(type, payload_len)` once 10 bytes are
/// available, rejecting unknown tags and oversized payloads before any
/// allocation.
pub fn decode_frame_header(buf: &[u8; 10]) -> Result<(MsgType, u64), super::P2pError> {
    let tag = u16::from_be_bytes(buf[..2].try_into().expect("2 bytes"));
    let len = u64::from_be_bytes(buf[2..].try_into().expect("8 bytes"));
    let msg_type =
        MsgType::from_u16(tag).ok_or(super::P2pError::UnknownMessageType(tag))?;
    if len > msg_type.max_payload_len() {
        return Err(super::P2pError::Frame("payload exceeds cap"));
    }
    Ok((msg_type, len))
}

/// Decode a payload for a known message type. Trailing bytes are rejected.
pub fn decode_payload(msg_type: MsgType, payload: &[u8]) -> Result<Message, SerError> {
    let mut reader = Reader::new(payload);
    let msg = match msg_type {
        MsgType::Hand => Message::Hand(Hand::read(&mut reader)?),
        MsgType::Shake => Message::Shake(Shake::read(&mut reader)?),
        MsgType::Ping => Message::Ping(PingInfo::read(&mut reader)?),
        MsgType::Pong => Message::Pong(PingInfo::read(&mut reader)?),
        MsgType::GetPeerAddrs => Message::GetPeerAddrs,
        MsgType::PeerAddrs => {
            let count = reader.read_count_short(MAX_PEER_ADDRS)?;
            let mut addrs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                addrs.push(read_string(&mut reader, 64)?);
            }
            Message::PeerAddrs(addrs)
        }
        MsgType::GetHeaders => Message::GetHeaders(Locator::read(&mut reader)?),
        MsgType::Header => Message::Header(Box::new(BlockHeader::read(&mut reader)?)),
        MsgType::Headers => {
            let count = reader.read_count_short(MAX_HEADERS_PER_MSG)?;
            let mut headers = Vec::with_capacity(count as usize);
            for _ in 0..count {
                headers.push(BlockHeader::read(&mut reader)?);
            }
            Message::Headers(headers)
        }
        MsgType::GetBlock => Message::GetBlock(Hash::read(&mut reader)?),
        MsgType::Block => Message::Block(Box::new(FullBlock::read(&mut reader)?)),
        MsgType::Transaction => Message::Transaction(Box::new(Transaction::read(&mut reader)?)),
        MsgType::StemTransaction => {
            Message::StemTransaction(Box::new(Transaction::read(&mut reader)?))
        }
        MsgType::TxHashSetRequest => Message::TxHashSetRequest {
            height: reader.read_u64()?,
            hash: Hash::read(&mut reader)?,
        },
        MsgType::TxHashSetArchive => Message::TxHashSetArchive {
            height: reader.read_u64()?,
            hash: Hash::read(&mut reader)?,
            bytes: reader.read_bytes_long(MAX_ARCHIVE_LEN)?,
        },
    };
    reader.expect_eof()?;
    Ok(msg)
}

/// Decode one complete framed message from a buffer (tests, simple paths).
pub fn decode_message(buf: &[u8]) -> Result<Message, super::P2pError> {
    if buf.len() < 10 {
        return Err(super::P2pError::Frame("short frame"));
    }
    let header: [u8; 10] = buf[..10].try_into().expect("10 bytes");
    let (msg_type, len) = decode_frame_header(&header)?;
    if buf.len() as u64 != 10 + len {
        return Err(super::P2pError::Frame("length mismatch"));
    }
    Ok(decode_payload(msg_type, &buf[10..])?)
}

/// The `Hand` our node sends when dialing.
pub fn local_hand(total_difficulty: u64, listen_port: u16, nonce: u64) -> Hand {
    Hand {
        version: PROTOCOL_VERSION,
        capabilities: CAP_FULL_NODE | CAP_ARCHIVE,
        nonce,
        genesis: crate::core::block::genesis_hash(),
        total_difficulty,
        user_agent: format!("mimble/{}", crate::NODE_VERSION),
        listen_port,
    }
}

/// Validate a handshake counterpart: same genesis, tolerable version.
pub fn check_handshake(genesis: &Hash, version: u32) -> Result<(), super::P2pError> {
    if *genesis != crate::core::block::genesis_hash() {
        return Err(super::P2pError::GenesisMismatch);
    }
    if version == 0 {
        return Err(super::P2pError::VersionMismatch);
    }
    Ok(())
}

/// Build an exponentially spaced locator from best-chain header hashes.
pub fn build_locator<F>(tip_height: u64, hash_at: F) -> Locator
where
    F: Fn(u64) -> Option<Hash>,
{
    let mut hashes = vec![];
    let mut step = 1u64;
    let mut height = tip_height;
    loop {
        if let Some(hash) = hash_at(height) {
            hashes.push(hash);
        }
        if height == 0 || hashes.len() >= MAX_LOCATOR_HASHES as usize - 1 {
            break;
        }
        height = height.saturating_sub(step);
        step *= 2;
    }
    if let Some(genesis_hash) = hash_at(0) {
        if hashes.last() != Some(&genesis_hash) {
            hashes.push(genesis_hash);
        }
    }
    Locator { hashes }
}

/// Headers to serve for a locator: the first locator hash we recognize on
/// our best chain anchors the batch.
pub fn headers_for_locator<F, G>(
    locator: &Locator,
    header_by_hash: F,
    hash_at: G,
) -> Vec<BlockHeader>
where
    F: Fn(&Hash) -> Option<BlockHeader>,
    G: Fn(u64) -> Option<Hash>,
{
    let anchor = locator.hashes.iter().find_map(|hash| {
        let header = header_by_hash(hash)?;
        // Must be on our best chain to anchor a batch.
        if hash_at(header.height) == Some(*hash) {
            Some(header)
        } else {
            None
        }
    });
    let Some(anchor) = anchor else {
        return vec![];
    };

    let mut out = vec![];
    let mut height = anchor.height + 1;
    while out.len() < consensus::HEADER_BATCH_SIZE.min(MAX_HEADERS_PER_MSG as u64) as usize {
        let Some(hash) = hash_at(height) else { break };
        let Some(header) = header_by_hash(&hash) else {
            break;
        };
        out.push(header);
        height += 1;
    }
    out
}
