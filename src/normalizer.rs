//! Normalization of decoded logs and raw companions into typed records

use num_bigint::BigUint;

use crate::config::Mode;
use crate::error::IndexerError;
use crate::models::{MovementKind, RawLog, RawTrace, RawTransaction, Record, Subject};
use crate::parser::{
    DecodedLog, DecodedValue, APPROVAL_TOPIC, ERC20_APPROVAL, ERC20_TRANSFER, NFT_TRANSFER_INDEXED,
    NFT_TRANSFER_UNINDEXED, TRANSFER_TOPIC,
};

/// Where an NFT transfer keeps its from/to/tokenId fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NftLayout {
    Indexed,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogShape {
    Erc20,
    Nft(NftLayout),
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    shape: LogShape,
}

impl Normalizer {
    pub fn erc20() -> Self {
        Self { shape: LogShape::Erc20 }
    }

    pub fn nft(layout: NftLayout) -> Self {
        Self {
            shape: LogShape::Nft(layout),
        }
    }

    pub fn for_mode(mode: Mode, nft_layout: NftLayout) -> Self {
        match mode {
            Mode::Erc20Approvals | Mode::AllTransfers => Self::erc20(),
            Mode::NftHolders => Self::nft(nft_layout),
        }
    }

    /// The decoder signatures this normalizer understands.
    pub fn signatures(&self) -> Vec<&'static str> {
        match self.shape {
            LogShape::Erc20 => vec![ERC20_TRANSFER, ERC20_APPROVAL],
            LogShape::Nft(NftLayout::Indexed) => vec![NFT_TRANSFER_INDEXED],
            LogShape::Nft(NftLayout::Body) => vec![NFT_TRANSFER_UNINDEXED],
        }
    }

    pub fn log(&self, decoded: Option<&DecodedLog>, raw: &RawLog) -> Result<Record, IndexerError> {
        let decoded = decoded.ok_or_else(|| IndexerError::malformed("log failed to decode"))?;
        let token = raw
            .address
            .ok_or_else(|| IndexerError::malformed("log without emitting address"))?;

        match self.shape {
            LogShape::Erc20 => {
                if decoded.indexed.len() < 2 || decoded.body.is_empty() {
                    return Err(IndexerError::malformed(format!(
                        "expected 2 indexed and 1 body field, got {} and {}",
                        decoded.indexed.len(),
                        decoded.body.len()
                    )));
                }
                let first = address_at(&decoded.indexed, 0)?;
                let second = address_at(&decoded.indexed, 1)?;
                let amount = uint_at(&decoded.body, 0)?;

                if decoded.selector == TRANSFER_TOPIC {
                    Ok(Record::TokenTransfer {
                        token,
                        from: first,
                        to: second,
                        amount,
                    })
                } else if decoded.selector == APPROVAL_TOPIC {
                    Ok(Record::Approval {
                        token,
                        owner: first,
                        spender: second,
                        amount,
                    })
                } else {
                    Err(IndexerError::malformed(format!("unexpected selector {}", decoded.selector)))
                }
            }
            LogShape::Nft(layout) => {
                let fields = match layout {
                    NftLayout::Indexed => &decoded.indexed,
                    NftLayout::Body => &decoded.body,
                };
                if fields.len() < 3 {
                    return Err(IndexerError::malformed(format!(
                        "expected 3 NFT transfer fields, got {}",
                        fields.len()
                    )));
                }
                Ok(Record::NftTransfer {
                    token,
                    from: address_at(fields, 0)?,
                    to: address_at(fields, 1)?,
                    token_id: uint_at(fields, 2)?,
                })
            }
        }
    }

    /// Gas only; value is optional because it is usually not selected.
    pub fn transaction(&self, tx: &RawTransaction) -> Result<Record, IndexerError> {
        let (Some(from), Some(price), Some(gas_used)) = (tx.from, &tx.effective_gas_price, &tx.gas_used)
        else {
            return Err(IndexerError::malformed("transaction missing from/effective_gas_price/gas_used"));
        };

        Ok(Record::EtherMovement {
            from,
            to: tx.to,
            amount: tx.value.clone().unwrap_or_default(),
            kind: MovementKind::Transaction {
                gas_fee: price * gas_used,
            },
        })
    }

    pub fn trace(&self, trace: &RawTrace) -> Result<Record, IndexerError> {
        let (Some(from), Some(to), Some(value)) = (trace.from, trace.to, &trace.value) else {
            return Err(IndexerError::malformed("trace missing from/to/value"));
        };

        Ok(Record::EtherMovement {
            from,
            to: Some(to),
            amount: value.clone(),
            kind: MovementKind::Trace,
        })
    }
}

fn address_at(fields: &[DecodedValue], index: usize) -> Result<Subject, IndexerError> {
    fields
        .get(index)
        .and_then(DecodedValue::as_address)
        .ok_or_else(|| IndexerError::malformed(format!("field {index} is not an address")))
}

fn uint_at(fields: &[DecodedValue], index: usize) -> Result<BigUint, IndexerError> {
    fields
        .get(index)
        .and_then(DecodedValue::as_uint)
        .cloned()
        .ok_or_else(|| IndexerError::malformed(format!("field {index} is not an unsigned integer")))
}
