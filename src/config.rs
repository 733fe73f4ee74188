use dotenvy::dotenv;
use eyre::Result;
use std::{env, str::FromStr};
use tracing::info;

use crate::error::IndexerError;
use crate::models::{subject_hex, Subject};
use crate::normalizer::NftLayout;
use crate::report::{Comparison, ThresholdConfig};

/// Which of the supported scans a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// ERC20 balances plus the target's latest approvals.
    Erc20Approvals,
    /// Ether flow (traces + gas) plus ERC20 volumes.
    AllTransfers,
    /// Holdings of every address for one NFT contract.
    NftHolders,
}

impl FromStr for Mode {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "erc20-approvals" | "approvals" => Ok(Self::Erc20Approvals),
            "all-transfers" | "transfers" => Ok(Self::AllTransfers),
            "nft-holders" | "nft" => Ok(Self::NftHolders),
            other => Err(IndexerError::Config(format!("unknown MODE `{other}`"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub target: Subject,
    pub mode: Mode,
    pub rpc_http_url: String,
    pub from_block: u64,
    pub to_block: Option<u64>,
    pub batch_blocks: u64,
    pub confirmations: u64,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub ignore_erc20: bool,
    pub nft_layout: NftLayout,
    pub thresholds: ThresholdConfig,
    pub port: Option<u16>,
}

pub fn load() -> Result<Config> {
    dotenv().ok(); // Load from .env file

    let cfg = from_lookup(|key| env::var(key).ok())?;

    info!("Loaded config: {:?}", cfg);

    Ok(cfg)
}

/// Builds a config from any key lookup; `load` feeds it the process env.
pub fn from_lookup<F>(lookup: F) -> Result<Config, IndexerError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let target_raw = var("TARGET_ADDRESS")
        .ok_or_else(|| IndexerError::Config("TARGET_ADDRESS is required".to_string()))?;
    let target = parse_subject(&target_raw)?;

    let mode = match var("MODE") {
        Some(m) => m.parse()?,
        None => Mode::AllTransfers,
    };

    // Prefer RPC_HTTP_URL, fall back to ETH_RPC
    let rpc_http_url = var("RPC_HTTP_URL")
        .or_else(|| var("ETH_RPC"))
        .unwrap_or_else(|| "https://ethereum-rpc.publicnode.com".to_string());

    let from_block = parse_or(&var, "FROM_BLOCK", 0u64)?;
    let to_block = var("TO_BLOCK").map(|v| parse_value("TO_BLOCK", &v)).transpose()?;
    let batch_blocks = parse_or(&var, "BATCH_BLOCKS", 2000u64)?;
    if batch_blocks == 0 {
        return Err(IndexerError::Config("BATCH_BLOCKS must be positive".to_string()));
    }
    let confirmations = parse_or(&var, "CONFIRMATIONS", 2u64)?;
    let max_retries = parse_or(&var, "MAX_RETRIES", 3u32)?.max(1);
    let request_timeout_secs = parse_or(&var, "REQUEST_TIMEOUT_SECS", 15u64)?;

    let ignore_erc20 = parse_flag(&var, "IGNORE_ERC20")?;
    let nft_layout = if parse_flag(&var, "NOT_INDEXED_TO_FROM")? {
        NftLayout::Body
    } else {
        NftLayout::Indexed
    };

    let defaults = ThresholdConfig::default();
    let thresholds = ThresholdConfig {
        min_inbound: parse_or(&var, "ERC20_IN_THRESHOLD", defaults.min_inbound)?,
        inbound_comparison: parse_or(&var, "ERC20_IN_COMPARISON", defaults.inbound_comparison)?,
        min_outbound: parse_or(&var, "ERC20_OUT_THRESHOLD", defaults.min_outbound)?,
        outbound_comparison: parse_or(&var, "ERC20_OUT_COMPARISON", defaults.outbound_comparison)?,
        min_holding: parse_or(&var, "NFT_HOLD_THRESHOLD", defaults.min_holding)?,
        holding_comparison: parse_or(&var, "NFT_HOLD_COMPARISON", defaults.holding_comparison)?,
    };

    let port = var("PORT").map(|v| parse_value("PORT", &v)).transpose()?;

    Ok(Config {
        target,
        mode,
        rpc_http_url,
        from_block,
        to_block,
        batch_blocks,
        confirmations,
        max_retries,
        request_timeout_secs,
        ignore_erc20,
        nft_layout,
        thresholds,
        port,
    })
}

/// `0x` + 40 hex digits, any case; stored as raw bytes.
pub fn parse_subject(raw: &str) -> Result<Subject, IndexerError> {
    let hex_part = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .filter(|h| h.len() == 40 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| IndexerError::Config(format!("invalid address `{raw}`")))?;
    let bytes = hex::decode(hex_part).map_err(|e| IndexerError::Config(format!("invalid address `{raw}`: {e}")))?;
    Ok(Subject::from_slice(&bytes))
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, IndexerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| IndexerError::Config(format!("{key}=`{raw}`: {e}")))
}

fn parse_or<T, V>(var: &V, key: &str, default: T) -> Result<T, IndexerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    var(key).map_or(Ok(default), |raw| parse_value(key, &raw))
}

fn parse_flag<V>(var: &V, key: &str) -> Result<bool, IndexerError>
where
    V: Fn(&str) -> Option<String>,
{
    match var(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if v == "true" || v == "1" => Ok(true),
        Some(v) if v == "false" || v == "0" => Ok(false),
        Some(v) => Err(IndexerError::Config(format!("{key}=`{v}` is not a boolean"))),
    }
}

impl Config {
    pub fn target_hex(&self) -> String {
        subject_hex(&self.target)
    }
}
