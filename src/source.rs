//! The event source seam: what to ask for, and how batches come back.

use async_trait::async_trait;

use crate::config::{Config, Mode};
use crate::error::IndexerError;
use crate::models::{Batch, Subject};
use crate::parser::{address_to_topic, APPROVAL_TOPIC, TRANSFER_TOPIC};
use alloy::primitives::B256;

/// One log selection. `topics[i]` empty means "any value" at position `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Vec<Subject>,
    pub topics: [Vec<B256>; 4],
}

/// Selects traces or transactions by sender and/or recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressFilter {
    pub from: Vec<Subject>,
    pub to: Vec<Subject>,
}

/// Which raw companion fields the core needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldSelection {
    pub logs: bool,
    pub transaction_value: bool,
    pub transaction_gas: bool,
    pub traces: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamQuery {
    pub from_block: u64,
    pub to_block: Option<u64>,
    pub logs: Vec<LogFilter>,
    pub traces: Vec<AddressFilter>,
    pub transactions: Vec<AddressFilter>,
    pub fields: FieldSelection,
}

impl StreamQuery {
    pub fn for_config(cfg: &Config) -> Self {
        let target = cfg.target;
        let target_topic = address_to_topic(&target);
        let transfer_by_position = |position: usize| {
            let mut filter = LogFilter::default();
            filter.topics[0] = vec![TRANSFER_TOPIC];
            filter.topics[position] = vec![target_topic];
            filter
        };

        let mut query = Self {
            from_block: cfg.from_block,
            to_block: cfg.to_block,
            ..Default::default()
        };

        match cfg.mode {
            Mode::Erc20Approvals => {
                let mut approvals = LogFilter::default();
                approvals.topics[0] = vec![APPROVAL_TOPIC];
                approvals.topics[1] = vec![target_topic];
                query.logs = vec![transfer_by_position(1), transfer_by_position(2), approvals];
                query.fields.logs = true;
            }
            Mode::AllTransfers => {
                if !cfg.ignore_erc20 {
                    query.logs = vec![transfer_by_position(2), transfer_by_position(1)];
                    query.fields.logs = true;
                }
                query.traces = vec![
                    AddressFilter {
                        to: vec![target],
                        ..Default::default()
                    },
                    AddressFilter {
                        from: vec![target],
                        ..Default::default()
                    },
                ];
                query.transactions = vec![AddressFilter {
                    from: vec![target],
                    ..Default::default()
                }];
                query.fields.traces = true;
                query.fields.transaction_gas = true;
            }
            Mode::NftHolders => {
                let mut transfers = LogFilter {
                    address: vec![target],
                    ..Default::default()
                };
                transfers.topics[0] = vec![TRANSFER_TOPIC];
                query.logs = vec![transfers];
                query.fields.logs = true;
            }
        }

        query
    }
}

/// A remote query service that can open a paginated stream.
#[async_trait]
pub trait EventSource: Send + Sync {
    type Stream: BatchStream;

    /// Fails with [`IndexerError::Connection`] once the source's own retry
    /// budget is spent.
    async fn open_stream(&self, query: &StreamQuery) -> Result<Self::Stream, IndexerError>;
}

#[async_trait]
pub trait BatchStream: Send {
    /// `Ok(None)` is end of stream.
    async fn next_batch(&mut self) -> Result<Option<Batch>, IndexerError>;
}
