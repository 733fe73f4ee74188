// src/parser.rs
use std::collections::HashMap;

use alloy::primitives::{b256, keccak256, Address, B256};
use num_bigint::BigUint;

use crate::error::IndexerError;
use crate::models::{RawLog, Subject};

/// keccak256("Transfer(address,address,uint256)"), shared by ERC20 and ERC721
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// keccak256("Approval(address,address,uint256)")
pub const APPROVAL_TOPIC: B256 =
    b256!("8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925");

pub const ERC20_TRANSFER: &str = "Transfer(address indexed from, address indexed to, uint256 amount)";
pub const ERC20_APPROVAL: &str = "Approval(address indexed owner, address indexed spender, uint256 value)";
pub const NFT_TRANSFER_INDEXED: &str =
    "Transfer(address indexed from, address indexed to, uint256 indexed tokenId)";
pub const NFT_TRANSFER_UNINDEXED: &str = "Transfer(address from, address to, uint256 tokenId)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Address,
    Uint,
}

#[derive(Debug, Clone)]
struct Param {
    kind: ParamKind,
    indexed: bool,
}

/// A parsed human-readable event signature.
#[derive(Debug, Clone)]
pub struct EventSignature {
    pub name: String,
    pub selector: B256,
    params: Vec<Param>,
}

impl EventSignature {
    pub fn parse(signature: &str) -> Result<Self, IndexerError> {
        let fail = |reason: &str| IndexerError::Signature {
            signature: signature.to_string(),
            reason: reason.to_string(),
        };

        let open = signature.find('(').ok_or_else(|| fail("missing `(`"))?;
        let inner = signature[open + 1..]
            .trim_end()
            .strip_suffix(')')
            .ok_or_else(|| fail("missing `)`"))?;
        let name = signature[..open].trim();
        if name.is_empty() {
            return Err(fail("missing event name"));
        }

        let mut params = Vec::new();
        let mut canonical = Vec::new();
        for raw in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut words = raw.split_whitespace();
            let ty = words.next().ok_or_else(|| fail("empty parameter"))?;
            let kind = match ty {
                "address" => ParamKind::Address,
                t if is_uint(t) => ParamKind::Uint,
                _ => return Err(fail(&format!("unsupported type `{ty}`"))),
            };
            let indexed = words.next() == Some("indexed");
            canonical.push(if ty == "uint" { "uint256" } else { ty });
            params.push(Param { kind, indexed });
        }

        let selector = keccak256(format!("{}({})", name, canonical.join(",")));

        Ok(Self {
            name: name.to_string(),
            selector,
            params,
        })
    }

    pub fn indexed_count(&self) -> usize {
        self.params.iter().filter(|p| p.indexed).count()
    }

    pub fn body_count(&self) -> usize {
        self.params.len() - self.indexed_count()
    }
}

fn is_uint(ty: &str) -> bool {
    match ty.strip_prefix("uint") {
        Some("") => true,
        Some(bits) => bits
            .parse::<u16>()
            .is_ok_and(|b| b > 0 && b <= 256 && b % 8 == 0),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    Address(Subject),
    Uint(BigUint),
}

impl DecodedValue {
    pub fn as_address(&self) -> Option<Subject> {
        match self {
            Self::Address(a) => Some(*a),
            Self::Uint(_) => None,
        }
    }

    pub fn as_uint(&self) -> Option<&BigUint> {
        match self {
            Self::Uint(v) => Some(v),
            Self::Address(_) => None,
        }
    }
}

/// `{indexed fields, body fields}` of one decoded log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLog {
    pub selector: B256,
    pub indexed: Vec<DecodedValue>,
    pub body: Vec<DecodedValue>,
}

/// Decodes raw logs against a fixed set of event signatures.
#[derive(Debug, Clone)]
pub struct Decoder {
    events: HashMap<B256, EventSignature>,
}

impl Decoder {
    pub fn from_signatures(signatures: &[&str]) -> Result<Self, IndexerError> {
        let mut events = HashMap::new();
        for sig in signatures {
            let event = EventSignature::parse(sig)?;
            if events.contains_key(&event.selector) {
                return Err(IndexerError::Signature {
                    signature: sig.to_string(),
                    reason: "selector already registered".to_string(),
                });
            }
            events.insert(event.selector, event);
        }
        Ok(Self { events })
    }

    /// Index-aligned with `logs`; `None` marks a log that failed to decode.
    pub fn decode_logs(&self, logs: &[RawLog]) -> Vec<Option<DecodedLog>> {
        logs.iter().map(|log| self.decode_log(log)).collect()
    }

    pub fn decode_log(&self, log: &RawLog) -> Option<DecodedLog> {
        let topic0 = B256::from(decode_word(log.topics.first()?)?);
        let event = self.events.get(&topic0)?;

        if log.topics.len() != 1 + event.indexed_count() {
            return None;
        }

        let data = hex::decode(log.data.trim_start_matches("0x")).ok()?;
        if data.len() < 32 * event.body_count() {
            return None;
        }

        let mut topics = log.topics[1..].iter();
        let mut words = data.chunks_exact(32);
        let mut indexed = Vec::with_capacity(event.indexed_count());
        let mut body = Vec::with_capacity(event.body_count());

        for param in &event.params {
            if param.indexed {
                let word = decode_word(topics.next()?)?;
                indexed.push(decode_value(param.kind, &word));
            } else {
                let word: [u8; 32] = words.next()?.try_into().ok()?;
                body.push(decode_value(param.kind, &word));
            }
        }

        Some(DecodedLog {
            selector: topic0,
            indexed,
            body,
        })
    }
}

fn decode_value(kind: ParamKind, word: &[u8; 32]) -> DecodedValue {
    match kind {
        ParamKind::Address => DecodedValue::Address(word_to_address(word)),
        ParamKind::Uint => DecodedValue::Uint(BigUint::from_bytes_be(word)),
    }
}

/// Topics and body words are 32-byte (padded) hex strings.
fn decode_word(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str.trim_start_matches("0x")).ok()?;
    bytes.try_into().ok()
}

/// An address is the last 20 bytes of a word.
fn word_to_address(word: &[u8; 32]) -> Address {
    Address::from_slice(&word[12..32])
}

/// Pads an address to a 32-byte topic for log filters.
pub fn address_to_topic(address: &Subject) -> B256 {
    address.into_word()
}

pub fn topic_hex(address: &Subject) -> String {
    word_hex(&address_to_topic(address))
}

pub fn word_hex(word: &B256) -> String {
    format!("0x{}", hex::encode(word))
}
