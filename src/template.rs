//! Block template model, parsing, and submission encoding
//!
//! A template is an immutable snapshot of one fetchable mining job. A new
//! template always replaces the old one wholesale; supersession is decided
//! by the (height, previous-hash) pair alone.

use crate::{nonce, Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use serde::Deserialize;
use std::fmt;

/// Serialized block header size in bytes
pub const HEADER_SIZE: usize = 140;

/// Offset of the 256-bit nonce within the serialized header
pub const NONCE_OFFSET: usize = 108;

/// Immutable snapshot of one mining job
///
/// Header hash fields are stored in internal (little-endian) byte order,
/// ready for serialization; `prev_hash` keeps the node's display-order hex
/// for supersession comparison and logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    /// Job identifier: the node's `workid` when present, derived otherwise
    pub job_id: String,
    /// Block height this template builds
    pub height: u64,
    /// Previous-block hash as reported by the node
    pub prev_hash: String,
    /// Seed hash for the proof-of-work function
    pub seed_hash: Vec<u8>,
    /// Block version
    pub version: u32,
    /// Header previous-hash field
    pub header_prev_hash: [u8; 32],
    /// Header merkle-root field
    pub header_merkle_root: [u8; 32],
    /// Header block-commitments field
    pub header_commitments: [u8; 32],
    /// Header timestamp
    pub header_time: u32,
    /// Header difficulty bits
    pub header_bits: u32,
    /// Coinbase transaction hex
    pub coinbase_txn: String,
    /// Additional transaction hex strings
    pub transactions: Vec<String>,
    /// Node-assigned work id to echo back on submission
    pub work_id: Option<String>,
}

/// Raw `getblocktemplate` result shape
#[derive(Debug, Deserialize)]
struct RawTemplate {
    height: u64,
    #[serde(rename = "previousblockhash")]
    previous_block_hash: String,
    #[serde(rename = "seedhash")]
    seed_hash: String,
    version: u32,
    #[serde(rename = "merkleroot")]
    merkle_root: String,
    #[serde(rename = "blockcommitmentshash")]
    block_commitments_hash: String,
    #[serde(rename = "curtime")]
    current_time: u32,
    bits: String,
    #[serde(rename = "coinbasetxn")]
    coinbase_txn: RawTransaction,
    #[serde(default)]
    transactions: Vec<RawTransaction>,
    #[serde(rename = "workid", default)]
    work_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    data: String,
}

impl BlockTemplate {
    /// Parse a validated `getblocktemplate` RPC result object.
    ///
    /// Fails with `MalformedTemplate` when any required field is absent or
    /// of the wrong shape; hash fields must decode to exactly 32 bytes.
    pub fn from_rpc_result(result: &serde_json::Value) -> Result<Self> {
        let raw: RawTemplate = serde_json::from_value(result.clone())
            .map_err(|e| Error::malformed_template(e.to_string()))?;

        // Display-order hex reverses into internal header byte order
        let header_prev_hash = decode_hash32("previousblockhash", &raw.previous_block_hash, true)?;
        let header_merkle_root = decode_hash32("merkleroot", &raw.merkle_root, true)?;
        let header_commitments =
            decode_hash32("blockcommitmentshash", &raw.block_commitments_hash, true)?;
        let seed_hash = decode_hash32("seedhash", &raw.seed_hash, false)?.to_vec();

        let header_bits = u32::from_str_radix(raw.bits.trim_start_matches("0x"), 16)
            .map_err(|e| Error::malformed_template(format!("bits `{}`: {e}", raw.bits)))?;

        decode_tx_hex("coinbasetxn", &raw.coinbase_txn.data)?;
        for tx in &raw.transactions {
            decode_tx_hex("transactions", &tx.data)?;
        }

        let job_id = raw
            .work_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", raw.height, raw.previous_block_hash));

        Ok(Self {
            job_id,
            height: raw.height,
            prev_hash: raw.previous_block_hash,
            seed_hash,
            version: raw.version,
            header_prev_hash,
            header_merkle_root,
            header_commitments,
            header_time: raw.current_time,
            header_bits,
            coinbase_txn: raw.coinbase_txn.data,
            transactions: raw.transactions.into_iter().map(|tx| tx.data).collect(),
            work_id: raw.work_id,
        })
    }

    /// Whether this template supersedes `current`: strictly greater height,
    /// or equal height with a different previous-hash. Equal height and hash
    /// is a duplicate.
    pub fn supersedes(&self, current: &BlockTemplate) -> bool {
        self.height > current.height
            || (self.height == current.height && self.prev_hash != current.prev_hash)
    }

    /// Whether a candidate (height, previous-hash) pair fails to supersede
    /// this template.
    pub fn is_outdated(&self, height: u64, prev_hash: &str) -> bool {
        !(height > self.height || (height == self.height && prev_hash != self.prev_hash))
    }

    /// Serialize the full block with `nonce32` in place and hex-encode it
    /// for the RPC submission payload.
    ///
    /// Layout: 140-byte header (version, prev-hash, merkle-root,
    /// commitments, time, bits, nonce), compact-size transaction count,
    /// coinbase transaction, raw transactions. Deterministic given
    /// (template, nonce), so a lost-response resubmission produces an
    /// identical payload.
    pub fn encode_submission(&self, nonce32: &[u8; nonce::NONCE_SIZE]) -> Result<String> {
        let mut blob = Vec::with_capacity(HEADER_SIZE + 9 + self.coinbase_txn.len() / 2);

        blob.write_u32::<LittleEndian>(self.version)?;
        blob.extend_from_slice(&self.header_prev_hash);
        blob.extend_from_slice(&self.header_merkle_root);
        blob.extend_from_slice(&self.header_commitments);
        blob.write_u32::<LittleEndian>(self.header_time)?;
        blob.write_u32::<LittleEndian>(self.header_bits)?;

        debug_assert_eq!(blob.len(), NONCE_OFFSET);
        blob.resize(HEADER_SIZE, 0);
        nonce::copy_to_blob(&mut blob, NONCE_OFFSET, nonce32);

        write_compact_size(&mut blob, 1 + self.transactions.len() as u64);
        blob.extend_from_slice(&decode_tx_hex("coinbasetxn", &self.coinbase_txn)?);
        for tx in &self.transactions {
            blob.extend_from_slice(&decode_tx_hex("transactions", tx)?);
        }

        Ok(hex::encode(blob))
    }
}

impl fmt::Display for BlockTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {} at height {}", self.job_id, self.height)
    }
}

/// Decode a 32-byte hash field, optionally reversing display order into
/// internal byte order.
fn decode_hash32(field: &'static str, hex_str: &str, reverse: bool) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| Error::malformed_template(format!("{field}: {e}")))?;
    let mut hash: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
        Error::malformed_template(format!(
            "{field}: expected 32 bytes, got {}",
            bytes.len()
        ))
    })?;
    if reverse {
        hash.reverse();
    }
    Ok(hash)
}

/// Decode a non-empty transaction hex string.
fn decode_tx_hex(field: &'static str, hex_str: &str) -> Result<Vec<u8>> {
    if hex_str.is_empty() {
        return Err(Error::malformed_template(format!("{field}: empty")));
    }
    hex::decode(hex_str).map_err(|e| Error::malformed_template(format!("{field}: {e}")))
}

/// Bitcoin-style compact-size integer
fn write_compact_size(blob: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => blob.push(value as u8),
        0xfd..=0xffff => {
            blob.push(0xfd);
            blob.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            blob.push(0xfe);
            blob.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            blob.push(0xff);
            blob.extend_from_slice(&value.to_le_bytes());
        }
    }
}
