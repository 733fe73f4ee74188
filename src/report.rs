// src/report.rs
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use num_bigint::{BigInt, BigUint};
use serde::Serialize;

use crate::error::IndexerError;
use crate::models::{
    serialize_display, serialize_subject, serialize_token_ids, AggregateState, EtherFlow, NftHolding,
    RunStats, Subject, TokenLedgerEntry,
};

/// How an observed count is compared against its configured minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `>=`
    AtLeast,
    /// `>`
    GreaterThan,
    /// `<=`
    AtMost,
    /// `<`
    LessThan,
}

impl Comparison {
    pub fn passes<T: PartialOrd>(self, observed: T, threshold: T) -> bool {
        match self {
            Self::AtLeast => observed >= threshold,
            Self::GreaterThan => observed > threshold,
            Self::AtMost => observed <= threshold,
            Self::LessThan => observed < threshold,
        }
    }
}

impl FromStr for Comparison {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">=" => Ok(Self::AtLeast),
            ">" => Ok(Self::GreaterThan),
            "<=" => Ok(Self::AtMost),
            "<" => Ok(Self::LessThan),
            other => Err(IndexerError::Config(format!("unknown comparison `{other}`"))),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AtLeast => ">=",
            Self::GreaterThan => ">",
            Self::AtMost => "<=",
            Self::LessThan => "<",
        })
    }
}

/// Inclusion thresholds. Token activity and NFT holdings keep separate
/// comparison policies (`>=` and `>` by default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdConfig {
    pub min_inbound: u64,
    pub inbound_comparison: Comparison,
    pub min_outbound: u64,
    pub outbound_comparison: Comparison,
    pub min_holding: usize,
    pub holding_comparison: Comparison,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            min_inbound: 3,
            inbound_comparison: Comparison::AtLeast,
            min_outbound: 3,
            outbound_comparison: Comparison::AtLeast,
            min_holding: 10,
            holding_comparison: Comparison::GreaterThan,
        }
    }
}

impl ThresholdConfig {
    pub fn token_passes(&self, entry: &TokenLedgerEntry) -> bool {
        self.inbound_comparison.passes(entry.count_in, self.min_inbound)
            && self.outbound_comparison.passes(entry.count_out, self.min_outbound)
    }

    pub fn holding_passes(&self, holding: &NftHolding) -> bool {
        self.holding_comparison
            .passes(holding.token_ids.len(), self.min_holding)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AllowanceReport {
    #[serde(serialize_with = "serialize_subject")]
    pub spender: Subject,
    #[serde(serialize_with = "serialize_display")]
    pub allowance: BigUint,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenReport {
    #[serde(serialize_with = "serialize_subject")]
    pub token: Subject,
    #[serde(serialize_with = "serialize_display")]
    pub balance: BigInt,
    #[serde(serialize_with = "serialize_display")]
    pub volume_in: BigUint,
    #[serde(serialize_with = "serialize_display")]
    pub volume_out: BigUint,
    pub count_in: u64,
    pub count_out: u64,
    /// Only the latest allowance per spender.
    pub approvals: Vec<AllowanceReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HolderReport {
    #[serde(serialize_with = "serialize_subject")]
    pub holder: Subject,
    #[serde(serialize_with = "serialize_token_ids")]
    pub token_ids: BTreeSet<BigUint>,
    pub transfers_in: u64,
    pub transfers_out: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EtherReport {
    #[serde(serialize_with = "serialize_display")]
    pub net_balance: BigInt,
    #[serde(serialize_with = "serialize_display")]
    pub volume_in: BigUint,
    #[serde(serialize_with = "serialize_display")]
    pub volume_out: BigUint,
    #[serde(serialize_with = "serialize_display")]
    pub gas_paid: BigUint,
    pub traces_in: u64,
    pub traces_out: u64,
    pub transactions_sent: u64,
    pub transactions_received: u64,
}

impl From<&EtherFlow> for EtherReport {
    fn from(flow: &EtherFlow) -> Self {
        Self {
            net_balance: flow.net_balance(),
            volume_in: flow.volume_in.clone(),
            volume_out: flow.volume_out.clone(),
            gas_paid: flow.gas_paid.clone(),
            traces_in: flow.traces_in,
            traces_out: flow.traces_out,
            transactions_sent: flow.transactions_out,
            transactions_received: flow.transactions_in,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub batches: u64,
    pub records_applied: u64,
    pub malformed_skipped: u64,
    pub invariant_skips: u64,
    pub last_block: u64,
}

impl From<&RunStats> for RunSummary {
    fn from(stats: &RunStats) -> Self {
        Self {
            batches: stats.batches,
            records_applied: stats.records_applied,
            malformed_skipped: stats.malformed_skipped,
            invariant_skips: stats.invariant_skips,
            last_block: stats.last_block,
        }
    }
}

/// Read-only projection of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct FilteredView {
    #[serde(serialize_with = "serialize_subject")]
    pub target: Subject,
    pub generated_at: DateTime<Utc>,
    pub ether: EtherReport,
    pub tokens: Vec<TokenReport>,
    pub holders: Vec<HolderReport>,
    pub run: RunSummary,
}

impl FilteredView {
    pub fn token(&self, token: &Subject) -> Option<&TokenReport> {
        self.tokens.iter().find(|t| &t.token == token)
    }
}

/// Filters the final state by the configured thresholds. Approvals appear
/// only under a token whose transfer activity passed.
pub fn report(state: &AggregateState, config: &ThresholdConfig) -> FilteredView {
    let mut tokens: Vec<TokenReport> = state
        .tokens
        .iter()
        .filter(|(_, entry)| config.token_passes(entry))
        .map(|(token, entry)| {
            let mut approvals: Vec<AllowanceReport> = state
                .approvals
                .get(token)
                .into_iter()
                .flatten()
                .map(|(spender, allowance)| AllowanceReport {
                    spender: *spender,
                    allowance: allowance.clone(),
                })
                .collect();
            approvals.sort_by_key(|a| a.spender);

            TokenReport {
                token: *token,
                balance: entry.balance.clone(),
                volume_in: entry.volume_in.clone(),
                volume_out: entry.volume_out.clone(),
                count_in: entry.count_in,
                count_out: entry.count_out,
                approvals,
            }
        })
        .collect();
    tokens.sort_by_key(|t| t.token);

    let mut holders: Vec<HolderReport> = state
        .holders
        .iter()
        .filter(|(_, holding)| config.holding_passes(holding))
        .map(|(holder, holding)| HolderReport {
            holder: *holder,
            token_ids: holding.token_ids.clone(),
            transfers_in: holding.transfers_in,
            transfers_out: holding.transfers_out,
        })
        .collect();
    holders.sort_by(|a, b| b.token_ids.len().cmp(&a.token_ids.len()).then(a.holder.cmp(&b.holder)));

    FilteredView {
        target: state.target,
        generated_at: Utc::now(),
        ether: EtherReport::from(&state.ether),
        tokens,
        holders,
        run: RunSummary::from(&state.stats),
    }
}
