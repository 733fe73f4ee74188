// src/aggregator.rs
use num_bigint::{BigInt, BigUint};
use tracing::debug;

use crate::error::IndexerError;
use crate::models::{AggregateState, MovementKind, Record, Subject};

/// Applies normalized records to the running state of one target.
///
/// Every entry point is a pure mutation of [`AggregateState`]. A record that
/// does not involve the target leaves the target's counters untouched. A
/// record that would overflow a counter is rejected whole with
/// [`IndexerError::InvariantViolation`] and nothing is written.
#[derive(Debug)]
pub struct Aggregator {
    state: AggregateState,
}

impl Aggregator {
    pub fn new(target: Subject) -> Self {
        Self {
            state: AggregateState::new(target),
        }
    }

    /// Continues from an existing state; its target is kept.
    pub fn resume(state: AggregateState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AggregateState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut AggregateState {
        &mut self.state
    }

    pub fn into_state(self) -> AggregateState {
        self.state
    }

    /// Applies one record. Only records that touched the state count
    /// towards `records_applied`.
    pub fn apply(&mut self, record: &Record) -> Result<(), IndexerError> {
        let changed = match record {
            Record::TokenTransfer {
                token,
                from,
                to,
                amount,
            } => self.apply_token_transfer(*token, *from, *to, amount)?,
            Record::Approval {
                token,
                owner,
                spender,
                amount,
            } => self.apply_approval(*token, *owner, *spender, amount),
            Record::EtherMovement {
                from,
                to,
                amount,
                kind,
            } => self.apply_ether_movement(*from, *to, amount, kind)?,
            Record::NftTransfer {
                token,
                from,
                to,
                token_id,
            } => self.apply_nft_transfer(*token, *from, *to, token_id)?,
        };
        if changed {
            self.state.stats.records_applied += 1;
        }
        Ok(())
    }

    pub fn apply_token_transfer(
        &mut self,
        token: Subject,
        from: Subject,
        to: Subject,
        amount: &BigUint,
    ) -> Result<bool, IndexerError> {
        let target = self.state.target;
        let outbound = from == target;
        let inbound = to == target;
        if !outbound && !inbound {
            return Ok(false);
        }

        let (count_in, count_out) = self
            .state
            .tokens
            .get(&token)
            .map_or((0, 0), |e| (e.count_in, e.count_out));
        let count_in = if inbound { bump(count_in, "token inbound count")? } else { count_in };
        let count_out = if outbound { bump(count_out, "token outbound count")? } else { count_out };

        let entry = self.state.tokens.entry(token).or_default();
        entry.count_in = count_in;
        entry.count_out = count_out;
        if outbound {
            entry.balance -= BigInt::from(amount.clone());
            entry.volume_out += amount;
        }
        if inbound {
            entry.balance += BigInt::from(amount.clone());
            entry.volume_in += amount;
        }
        Ok(true)
    }

    /// Last write wins per (token, spender).
    pub fn apply_approval(&mut self, token: Subject, owner: Subject, spender: Subject, amount: &BigUint) -> bool {
        if owner != self.state.target {
            return false;
        }
        self.state
            .approvals
            .entry(token)
            .or_default()
            .insert(spender, amount.clone());
        true
    }

    pub fn apply_ether_movement(
        &mut self,
        from: Subject,
        to: Option<Subject>,
        amount: &BigUint,
        kind: &MovementKind,
    ) -> Result<bool, IndexerError> {
        let target = self.state.target;
        let outbound = from == target;
        let inbound = to == Some(target);
        if !outbound && !inbound {
            return Ok(false);
        }

        let flow = &self.state.ether;
        let (mut traces_in, mut traces_out) = (flow.traces_in, flow.traces_out);
        let (mut txs_in, mut txs_out) = (flow.transactions_in, flow.transactions_out);
        match kind {
            MovementKind::Trace => {
                if inbound {
                    traces_in = bump(traces_in, "ether trace inbound count")?;
                }
                if outbound {
                    traces_out = bump(traces_out, "ether trace outbound count")?;
                }
            }
            MovementKind::Transaction { .. } => {
                if inbound {
                    txs_in = bump(txs_in, "transaction inbound count")?;
                }
                if outbound {
                    txs_out = bump(txs_out, "transaction outbound count")?;
                }
            }
        }

        let flow = &mut self.state.ether;
        flow.traces_in = traces_in;
        flow.traces_out = traces_out;
        flow.transactions_in = txs_in;
        flow.transactions_out = txs_out;
        if inbound {
            flow.volume_in += amount;
        }
        if outbound {
            flow.volume_out += amount;
            if let MovementKind::Transaction { gas_fee } = kind {
                flow.gas_paid += gas_fee;
            }
        }
        Ok(true)
    }

    /// Moves `token_id` from `from` to `to`. Counters move even when `from`
    /// never held the id, since holdings before the start block are unknown.
    pub fn apply_nft_transfer(
        &mut self,
        token: Subject,
        from: Subject,
        to: Subject,
        token_id: &BigUint,
    ) -> Result<bool, IndexerError> {
        if token != self.state.target {
            debug!("ignoring NFT transfer from foreign contract {}", token);
            return Ok(false);
        }

        let holders = &self.state.holders;
        let transfers_out = bump(
            holders.get(&from).map_or(0, |h| h.transfers_out),
            "NFT transfers out",
        )?;
        let transfers_in = bump(
            holders.get(&to).map_or(0, |h| h.transfers_in),
            "NFT transfers in",
        )?;

        let sender = self.state.holders.entry(from).or_default();
        sender.token_ids.remove(token_id);
        sender.transfers_out = transfers_out;

        let receiver = self.state.holders.entry(to).or_default();
        receiver.token_ids.insert(token_id.clone());
        receiver.transfers_in = transfers_in;
        Ok(true)
    }
}

fn bump(count: u64, what: &str) -> Result<u64, IndexerError> {
    count
        .checked_add(1)
        .ok_or_else(|| IndexerError::InvariantViolation(format!("{what} overflowed")))
}
