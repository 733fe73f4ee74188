// src/models.rs
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;

use alloy::primitives::Address;
use num_bigint::{BigInt, BigUint};
use serde::Serializer;

/// An account or contract address. Parsed once from hex, then compared as
/// raw 20-byte keys.
pub type Subject = Address;

/// Canonical lowercase `0x`-prefixed form of a subject.
pub fn subject_hex(subject: &Subject) -> String {
    format!("0x{}", hex::encode(subject.as_slice()))
}

pub fn serialize_subject<S: Serializer>(subject: &Subject, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&subject_hex(subject))
}

/// Big integers go out as decimal strings so JSON consumers never round them.
pub fn serialize_display<T: Display, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(value)
}

pub fn serialize_token_ids<S: Serializer>(ids: &BTreeSet<BigUint>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(ids.iter().map(ToString::to_string))
}

// ---------- Raw batch records (as delivered by an event source) ----------

/// An undecoded event log.
#[derive(Debug, Clone, Default)]
pub struct RawLog {
    /// Emitting contract; some sources omit it when not selected.
    pub address: Option<Subject>,
    /// Hex topics, `topic0` first.
    pub topics: Vec<String>,
    /// Hex-encoded body.
    pub data: String,
    pub block_number: u64,
    pub log_index: u64,
}

/// A transaction companion record. Fields are optional because the query's
/// field selection decides which ones arrive.
#[derive(Debug, Clone, Default)]
pub struct RawTransaction {
    pub from: Option<Subject>,
    pub to: Option<Subject>,
    pub value: Option<BigUint>,
    pub effective_gas_price: Option<BigUint>,
    pub gas_used: Option<BigUint>,
}

/// A call trace (external or internal value movement).
#[derive(Debug, Clone, Default)]
pub struct RawTrace {
    pub from: Option<Subject>,
    pub to: Option<Subject>,
    pub value: Option<BigUint>,
}

/// One page of the stream. `next_block` is a progress cursor only.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub next_block: u64,
    pub logs: Vec<RawLog>,
    pub transactions: Vec<RawTransaction>,
    pub traces: Vec<RawTrace>,
}

// ---------- Normalized records ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovementKind {
    /// Internal or external call trace.
    Trace,
    /// Top-level transaction; the sender pays `gas_fee`.
    Transaction { gas_fee: BigUint },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    TokenTransfer {
        token: Subject,
        from: Subject,
        to: Subject,
        amount: BigUint,
    },
    Approval {
        token: Subject,
        owner: Subject,
        spender: Subject,
        amount: BigUint,
    },
    EtherMovement {
        from: Subject,
        to: Option<Subject>,
        amount: BigUint,
        kind: MovementKind,
    },
    NftTransfer {
        token: Subject,
        from: Subject,
        to: Subject,
        token_id: BigUint,
    },
}

// ---------- Aggregate entities ----------

/// Per-token activity of the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenLedgerEntry {
    pub balance: BigInt,
    pub volume_in: BigUint,
    pub volume_out: BigUint,
    pub count_in: u64,
    pub count_out: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtherFlow {
    pub volume_in: BigUint,
    pub volume_out: BigUint,
    /// Only for transactions the target sent.
    pub gas_paid: BigUint,
    pub traces_in: u64,
    pub traces_out: u64,
    pub transactions_in: u64,
    pub transactions_out: u64,
}

impl EtherFlow {
    /// Wei in minus wei out minus gas.
    pub fn net_balance(&self) -> BigInt {
        BigInt::from(self.volume_in.clone())
            - BigInt::from(self.volume_out.clone())
            - BigInt::from(self.gas_paid.clone())
    }
}

/// Holdings observed since the stream's start block. Counters are not
/// corrected for history that predates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NftHolding {
    pub token_ids: BTreeSet<BigUint>,
    pub transfers_in: u64,
    pub transfers_out: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub batches: u64,
    pub records_applied: u64,
    pub malformed_skipped: u64,
    pub invariant_skips: u64,
    pub last_block: u64,
}

/// Everything one run accumulates for its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateState {
    pub target: Subject,
    pub tokens: HashMap<Subject, TokenLedgerEntry>,
    /// token -> spender -> latest allowance
    pub approvals: HashMap<Subject, HashMap<Subject, BigUint>>,
    pub ether: EtherFlow,
    pub holders: HashMap<Subject, NftHolding>,
    pub stats: RunStats,
}

impl AggregateState {
    pub fn new(target: Subject) -> Self {
        Self {
            target,
            tokens: HashMap::new(),
            approvals: HashMap::new(),
            ether: EtherFlow::default(),
            holders: HashMap::new(),
            stats: RunStats::default(),
        }
    }

    pub fn allowance(&self, token: &Subject, spender: &Subject) -> Option<&BigUint> {
        self.approvals.get(token)?.get(spender)
    }
}
