// src/rpc.rs
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use num_bigint::BigUint;
use num_traits::Zero;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::IndexerError;
use crate::models::{subject_hex, Batch, RawLog, RawTrace, RawTransaction, Subject};
use crate::parser::word_hex;
use crate::source::{AddressFilter, BatchStream, EventSource, LogFilter, StreamQuery};

/// JSON-RPC envelope. `result` stays raw until `error` has been ruled out,
/// since `null` is a valid result for some methods.
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize, Clone)]
struct Log {
    address: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    data: String,

    #[serde(rename = "blockNumber")]
    block_number_hex: Option<String>,

    #[serde(rename = "transactionHash")]
    tx_hash: Option<String>,

    #[serde(rename = "logIndex")]
    log_index_hex: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct TraceAction {
    from: Option<String>,
    to: Option<String>,
    value: Option<String>,
    #[serde(rename = "callType")]
    call_type: Option<String>,
}

/// One entry of a `trace_filter` response (OpenEthereum/Erigon format).
#[derive(Debug, Deserialize, Clone)]
struct Trace {
    action: TraceAction,
    #[serde(rename = "blockNumber", default)]
    block_number: u64,
    #[serde(rename = "transactionHash")]
    tx_hash: Option<String>,
    #[serde(rename = "transactionPosition")]
    tx_position: Option<u64>,
    #[serde(rename = "traceAddress", default)]
    trace_address: Vec<u64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Receipt {
    from: Option<String>,
    to: Option<String>,
    #[serde(rename = "effectiveGasPrice")]
    effective_gas_price: Option<String>,
    #[serde(rename = "gasUsed")]
    gas_used: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionValue {
    value: Option<String>,
}

/// Thin JSON-RPC client with a fixed retry budget.
#[derive(Debug)]
struct RpcClient {
    client: Client,
    url: String,
    max_retries: u32,
    retry_pause: Duration,
}

impl RpcClient {
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, IndexerError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut last_failure = String::new();
        for attempt in 1..=self.max_retries {
            debug!("📡 Sending {} → {} (attempt {})", method, self.url, attempt);

            match self.client.post(&self.url).json(&payload).send().await {
                Ok(resp) if resp.status() == StatusCode::OK => match resp.text().await {
                    Ok(text) => match read_response(&text) {
                        Ok(result) => return Ok(result),
                        Err(reason) => last_failure = reason,
                    },
                    Err(e) => last_failure = e.to_string(),
                },
                Ok(resp) => last_failure = format!("HTTP {}", resp.status()),
                Err(e) => last_failure = e.to_string(),
            }

            if attempt < self.max_retries {
                warn!(
                    "⚠️ {} failed (attempt {}): {}. Retrying...",
                    method, attempt, last_failure
                );
                tokio::time::sleep(self.retry_pause).await;
            }
        }

        Err(IndexerError::Connection {
            endpoint: self.url.clone(),
            attempts: self.max_retries,
            reason: format!("{method}: {last_failure}"),
        })
    }

    async fn block_number(&self) -> Result<u64, IndexerError> {
        let hex_str: String = self.call("eth_blockNumber", json!([])).await?;
        parse_u64(&hex_str).ok_or_else(|| IndexerError::Decode(format!("bad block number `{hex_str}`")))
    }
}

/// Every way a reply can fail (an `error` member, a body that is not JSON, a
/// result of the wrong shape) comes back as a retryable reason.
fn read_response<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let response: RpcResponse = serde_json::from_str(text).map_err(|e| format!("unreadable body: {e}"))?;
    if let Some(error) = response.error {
        return Err(format!("RPC error {}: {}", error.code, error.message));
    }
    serde_json::from_value(response.result).map_err(|e| format!("unexpected result: {e}"))
}

/// Ethereum JSON-RPC implementation of [`EventSource`]. Traces need a node
/// that serves `trace_filter`.
#[derive(Debug, Clone)]
pub struct RpcEventSource {
    client: Arc<RpcClient>,
    confirmations: u64,
    batch_blocks: u64,
}

impl RpcEventSource {
    pub fn new(cfg: &Config) -> Result<Self, IndexerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| IndexerError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client: Arc::new(RpcClient {
                client,
                url: cfg.rpc_http_url.clone(),
                max_retries: cfg.max_retries,
                retry_pause: Duration::from_secs(2),
            }),
            confirmations: cfg.confirmations,
            batch_blocks: cfg.batch_blocks,
        })
    }
}

#[async_trait]
impl EventSource for RpcEventSource {
    type Stream = RpcStream;

    async fn open_stream(&self, query: &StreamQuery) -> Result<RpcStream, IndexerError> {
        let latest = self.client.block_number().await?;
        let confirmed = latest.saturating_sub(self.confirmations);
        let head = query.to_block.map_or(confirmed, |to| to.min(confirmed));

        info!(
            "Stream open: blocks {} → {} (chain head {})",
            query.from_block, head, latest
        );

        Ok(RpcStream {
            client: Arc::clone(&self.client),
            query: query.clone(),
            cursor: query.from_block,
            head,
            batch_blocks: self.batch_blocks,
        })
    }
}

pub struct RpcStream {
    client: Arc<RpcClient>,
    query: StreamQuery,
    cursor: u64,
    head: u64,
    batch_blocks: u64,
}

#[async_trait]
impl BatchStream for RpcStream {
    async fn next_batch(&mut self) -> Result<Option<Batch>, IndexerError> {
        if self.cursor > self.head {
            return Ok(None);
        }

        let from = self.cursor;
        let to = from.saturating_add(self.batch_blocks - 1).min(self.head);

        let logs = if self.query.fields.logs {
            self.fetch_logs(from, to).await?
        } else {
            Vec::new()
        };
        let traces = if self.query.fields.traces {
            self.fetch_traces(&self.query.traces, from, to, false).await?
        } else {
            Vec::new()
        };
        let transactions = self.fetch_transactions(from, to).await?;

        self.cursor = to + 1;
        Ok(Some(Batch {
            next_block: to + 1,
            logs,
            transactions,
            traces: traces.iter().map(to_raw_trace).collect(),
        }))
    }
}

impl RpcStream {
    async fn fetch_logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, IndexerError> {
        let mut seen = HashSet::new();
        let mut logs = Vec::new();

        for filter in &self.query.logs {
            let fetched: Vec<Log> = self
                .client
                .call("eth_getLogs", json!([log_filter_params(filter, from, to)]))
                .await?;

            for log in fetched {
                // a self-transfer matches both the `from` and the `to` filter
                let key = (log.tx_hash.clone(), log.log_index_hex.clone());
                if key.0.is_some() && !seen.insert(key) {
                    continue;
                }
                logs.push(to_raw_log(&log));
            }
        }

        logs.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(logs)
    }

    async fn fetch_traces(
        &self,
        filters: &[AddressFilter],
        from: u64,
        to: u64,
        keep_reverted: bool,
    ) -> Result<Vec<Trace>, IndexerError> {
        let mut seen = HashSet::new();
        let mut traces = Vec::new();

        for filter in filters {
            let fetched: Vec<Trace> = self
                .client
                .call("trace_filter", json!([trace_filter_params(filter, from, to)]))
                .await?;

            for trace in fetched {
                if !seen.insert((trace.tx_hash.clone(), trace.trace_address.clone())) {
                    continue;
                }
                // delegatecalls move no value of their own
                if trace.action.call_type.as_deref() == Some("delegatecall") {
                    continue;
                }
                // a reverted call moves no value but its transaction still paid gas
                if trace.error.is_some() && !keep_reverted {
                    continue;
                }
                traces.push(trace);
            }
        }

        traces.sort_by(|a, b| {
            (a.block_number, a.tx_position, &a.trace_address).cmp(&(b.block_number, b.tx_position, &b.trace_address))
        });
        Ok(traces)
    }

    /// Transactions are located through their top-level traces, reverted
    /// ones included, then completed from receipts.
    async fn fetch_transactions(&self, from: u64, to: u64) -> Result<Vec<RawTransaction>, IndexerError> {
        let fields = self.query.fields;
        if self.query.transactions.is_empty() || !(fields.transaction_gas || fields.transaction_value) {
            return Ok(Vec::new());
        }

        let top_level: Vec<Trace> = self
            .fetch_traces(&self.query.transactions, from, to, true)
            .await?
            .into_iter()
            .filter(|t| t.trace_address.is_empty())
            .collect();

        let mut transactions = Vec::with_capacity(top_level.len());
        for trace in top_level {
            let Some(hash) = trace.tx_hash.as_deref() else {
                transactions.push(RawTransaction::default());
                continue;
            };

            let mut tx = RawTransaction {
                from: trace.action.from.as_deref().and_then(parse_subject),
                to: trace.action.to.as_deref().and_then(parse_subject),
                ..Default::default()
            };

            if fields.transaction_gas {
                let receipt: Option<Receipt> = self
                    .client
                    .call("eth_getTransactionReceipt", json!([hash]))
                    .await?;
                if let Some(receipt) = receipt {
                    tx.from = receipt.from.as_deref().and_then(parse_subject).or(tx.from);
                    tx.to = receipt.to.as_deref().and_then(parse_subject).or(tx.to);
                    tx.effective_gas_price = receipt.effective_gas_price.as_deref().and_then(parse_quantity);
                    tx.gas_used = receipt.gas_used.as_deref().and_then(parse_quantity);
                }
            }

            if fields.transaction_value && trace.error.is_none() {
                let body: Option<TransactionValue> = self
                    .client
                    .call("eth_getTransactionByHash", json!([hash]))
                    .await?;
                tx.value = body.and_then(|b| b.value).as_deref().and_then(parse_quantity);
            }

            transactions.push(tx);
        }

        Ok(transactions)
    }
}

fn log_filter_params(filter: &LogFilter, from: u64, to: u64) -> Value {
    let mut topics: Vec<Value> = filter
        .topics
        .iter()
        .map(|position| {
            if position.is_empty() {
                Value::Null
            } else {
                Value::from(position.iter().map(word_hex).collect::<Vec<_>>())
            }
        })
        .collect();
    while topics.last() == Some(&Value::Null) {
        topics.pop();
    }

    let mut params = json!({
        "fromBlock": format!("0x{:x}", from),
        "toBlock": format!("0x{:x}", to),
        "topics": topics,
    });
    if !filter.address.is_empty() {
        params["address"] = Value::from(filter.address.iter().map(subject_hex).collect::<Vec<_>>());
    }
    params
}

fn trace_filter_params(filter: &AddressFilter, from: u64, to: u64) -> Value {
    let mut params = json!({
        "fromBlock": format!("0x{:x}", from),
        "toBlock": format!("0x{:x}", to),
    });
    if !filter.from.is_empty() {
        params["fromAddress"] = Value::from(filter.from.iter().map(subject_hex).collect::<Vec<_>>());
    }
    if !filter.to.is_empty() {
        params["toAddress"] = Value::from(filter.to.iter().map(subject_hex).collect::<Vec<_>>());
    }
    params
}

fn to_raw_log(log: &Log) -> RawLog {
    RawLog {
        address: log.address.as_deref().and_then(parse_subject),
        topics: log.topics.clone(),
        data: log.data.clone(),
        block_number: log.block_number_hex.as_deref().and_then(parse_u64).unwrap_or(0),
        log_index: log.log_index_hex.as_deref().and_then(parse_u64).unwrap_or(0),
    }
}

fn to_raw_trace(trace: &Trace) -> RawTrace {
    RawTrace {
        from: trace.action.from.as_deref().and_then(parse_subject),
        to: trace.action.to.as_deref().and_then(parse_subject),
        value: trace.action.value.as_deref().and_then(parse_quantity),
    }
}

fn parse_subject(s: &str) -> Option<Subject> {
    s.parse::<Subject>().ok()
}

fn parse_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

/// Hex quantities (`0x` + digits, `0x` alone is zero) at full precision.
fn parse_quantity(s: &str) -> Option<BigUint> {
    let digits = s.trim_start_matches("0x");
    if digits.is_empty() {
        return Some(BigUint::zero());
    }
    BigUint::parse_bytes(digits.as_bytes(), 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{address_to_topic, TRANSFER_TOPIC};

    #[test]
    fn test_log_filter_params_trim_wildcards() {
        let target = Subject::repeat_byte(0xab);
        let mut filter = LogFilter::default();
        filter.topics[0] = vec![TRANSFER_TOPIC];
        filter.topics[1] = vec![address_to_topic(&target)];

        let params = log_filter_params(&filter, 16, 31);
        assert_eq!(params["fromBlock"], "0x10");
        assert_eq!(params["toBlock"], "0x1f");
        assert_eq!(params["topics"].as_array().unwrap().len(), 2);
        assert_eq!(params["topics"][1][0], format!("0x{}{}", "00".repeat(12), "ab".repeat(20)));
        assert!(params.get("address").is_none());
    }

    #[test]
    fn test_trace_filter_params() {
        let filter = AddressFilter {
            to: vec![Subject::repeat_byte(0x01)],
            ..Default::default()
        };
        let params = trace_filter_params(&filter, 1, 2);
        assert!(params.get("fromAddress").is_none());
        assert_eq!(params["toAddress"][0], format!("0x{}", "01".repeat(20)));
    }

    #[test]
    fn test_parse_quantity_keeps_precision() {
        let big = parse_quantity("0x1000000000000000000000000000000000000").unwrap();
        assert_eq!(big, BigUint::from(1u8) << 144usize);
        assert_eq!(parse_quantity("0x"), Some(BigUint::zero()));
        assert_eq!(parse_quantity("0xzz"), None);
    }

    #[test]
    fn test_trace_response_decodes() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":[{"action":{"from":"0x0101010101010101010101010101010101010101","to":"0x0202020202020202020202020202020202020202","value":"0xde0b6b3a7640000","callType":"call"},"blockNumber":17000000,"transactionHash":"0xabc","transactionPosition":3,"traceAddress":[],"type":"call"}]}"#;
        let result: Vec<Trace> = read_response(body).unwrap();
        let raw = to_raw_trace(&result[0]);
        assert_eq!(raw.from, Some(Subject::repeat_byte(0x01)));
        assert_eq!(raw.value, Some(BigUint::from(1_000_000_000_000_000_000u64)));
    }

    #[test]
    fn test_error_member_wins_over_missing_result() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"rate limited"}}"#;
        let err = read_response::<Option<Receipt>>(body).unwrap_err();
        assert!(err.contains("rate limited"));

        let err = read_response::<Vec<Log>>(body).unwrap_err();
        assert!(err.contains("-32000"));
    }

    #[test]
    fn test_null_result_is_an_answer() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        assert!(read_response::<Option<Receipt>>(body).unwrap().is_none());
        assert!(read_response::<Vec<Log>>(body).is_err());
        assert!(read_response::<String>("<html>502 Bad Gateway</html>").is_err());
    }

    mod node {
        use std::sync::{Arc, Mutex};

        use axum::{extract::State, routing::post, Router};
        use serde_json::Value;

        type Responder = dyn Fn(&str, &Value, usize) -> String + Send + Sync;

        /// A local JSON-RPC endpoint answering from a closure of
        /// (method, params, nth call of that method).
        #[derive(Clone)]
        pub struct FakeNode {
            respond: Arc<Responder>,
            calls: Arc<Mutex<Vec<String>>>,
        }

        impl FakeNode {
            pub fn calls(&self, method: &str) -> usize {
                self.calls.lock().unwrap().iter().filter(|m| *m == method).count()
            }
        }

        async fn handle(State(node): State<FakeNode>, body: String) -> String {
            let request: Value = serde_json::from_str(&body).unwrap();
            let method = request["method"].as_str().unwrap_or_default().to_string();
            let nth = {
                let mut calls = node.calls.lock().unwrap();
                calls.push(method.clone());
                calls.iter().filter(|m| **m == method).count()
            };
            (node.respond)(&method, &request["params"][0], nth)
        }

        pub async fn spawn(
            respond: impl Fn(&str, &Value, usize) -> String + Send + Sync + 'static,
        ) -> (String, FakeNode) {
            let node = FakeNode {
                respond: Arc::new(respond),
                calls: Arc::default(),
            };
            let app = Router::new().route("/", post(handle)).with_state(node.clone());
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (url, node)
        }
    }

    fn client(url: String) -> Arc<RpcClient> {
        Arc::new(RpcClient {
            client: Client::new(),
            url,
            max_retries: 3,
            retry_pause: Duration::from_millis(5),
        })
    }

    fn stream_over(client: Arc<RpcClient>, query: StreamQuery) -> RpcStream {
        RpcStream {
            client,
            query,
            cursor: 100,
            head: 100,
            batch_blocks: 10,
        }
    }

    fn ok(result: Value) -> String {
        json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string()
    }

    fn target() -> Subject {
        Subject::repeat_byte(0x01)
    }

    fn trace(from: Subject, to: Subject, value: u64, tx: &str, position: u64, path: &[u64], reverted: bool) -> Value {
        let mut trace = json!({
            "action": {
                "from": subject_hex(&from),
                "to": subject_hex(&to),
                "value": format!("0x{:x}", value),
                "callType": "call",
            },
            "blockNumber": 100,
            "transactionHash": tx,
            "transactionPosition": position,
            "traceAddress": path,
            "type": "call",
        });
        if reverted {
            trace["error"] = json!("Reverted");
        }
        trace
    }

    #[tokio::test]
    async fn test_reverted_transaction_still_pays_gas() {
        let (url, node) = node::spawn(|method, params, _| match method {
            "trace_filter" if params.get("fromAddress").is_some() => ok(json!([
                trace(target(), Subject::repeat_byte(3), 5, "0xaa", 0, &[], false),
                trace(target(), Subject::repeat_byte(3), 1, "0xaa", 0, &[0], false),
                trace(target(), Subject::repeat_byte(4), 7, "0xbb", 1, &[], true),
            ])),
            "trace_filter" => ok(json!([trace(Subject::repeat_byte(2), target(), 100, "0xcc", 2, &[], false)])),
            "eth_getTransactionReceipt" => ok(json!({
                "from": subject_hex(&target()),
                "to": subject_hex(&Subject::repeat_byte(3)),
                "effectiveGasPrice": "0xa",
                "gasUsed": "0x5208",
            })),
            _ => ok(Value::Null),
        })
        .await;

        let query = StreamQuery {
            traces: vec![
                AddressFilter {
                    to: vec![target()],
                    ..Default::default()
                },
                AddressFilter {
                    from: vec![target()],
                    ..Default::default()
                },
            ],
            transactions: vec![AddressFilter {
                from: vec![target()],
                ..Default::default()
            }],
            fields: crate::source::FieldSelection {
                traces: true,
                transaction_gas: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let client = client(url);
        let mut stream = stream_over(Arc::clone(&client), query.clone());

        let batch = stream.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.next_block, 101);
        assert_eq!(batch.transactions.len(), 2);
        assert!(batch
            .transactions
            .iter()
            .all(|tx| tx.gas_used == Some(BigUint::from(21_000u32)) && tx.from == Some(target())));
        // reverted value trace dropped, nested call kept
        assert_eq!(batch.traces.len(), 3);
        assert_eq!(node.calls("eth_getTransactionReceipt"), 2);
        assert!(stream.next_batch().await.unwrap().is_none());

        let consumer = crate::StreamConsumer::new(target(), crate::normalizer::Normalizer::erc20()).unwrap();
        let (_handle, signal) = crate::cancel_pair();
        let flow = consumer
            .consume(&mut stream_over(client, query), signal)
            .await
            .unwrap()
            .state
            .ether;
        assert_eq!(flow.gas_paid, BigUint::from(420_000u32));
        assert_eq!(flow.transactions_out, 2);
        assert_eq!(flow.volume_out, BigUint::from(6u8));
        assert_eq!(flow.volume_in, BigUint::from(100u8));
    }

    #[tokio::test]
    async fn test_logs_are_merged_deduplicated_and_sorted() {
        let log = |block: u64, index: u64, tx: &str| {
            json!({
                "address": subject_hex(&Subject::repeat_byte(0xaa)),
                "topics": [word_hex(&TRANSFER_TOPIC)],
                "data": "0x",
                "blockNumber": format!("0x{:x}", block),
                "transactionHash": tx,
                "logIndex": format!("0x{:x}", index),
            })
        };
        let (url, node) = node::spawn(move |method, _, nth| match (method, nth) {
            ("eth_getLogs", 1) => ok(json!([log(101, 2, "0x01"), log(100, 5, "0x02")])),
            ("eth_getLogs", _) => ok(json!([log(100, 5, "0x02"), log(100, 1, "0x03")])),
            _ => ok(Value::Null),
        })
        .await;

        let query = StreamQuery {
            logs: vec![LogFilter::default(), LogFilter::default()],
            fields: crate::source::FieldSelection {
                logs: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let batch = stream_over(client(url), query).next_batch().await.unwrap().unwrap();

        let order: Vec<(u64, u64)> = batch.logs.iter().map(|l| (l.block_number, l.log_index)).collect();
        assert_eq!(order, vec![(100, 1), (100, 5), (101, 2)]);
        assert_eq!(node.calls("eth_getLogs"), 2);
        assert!(batch.transactions.is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_is_retried() {
        let (url, node) = node::spawn(|method, _, nth| match (method, nth) {
            ("eth_getTransactionReceipt", 1) => {
                json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "rate limited"}}).to_string()
            }
            _ => ok(json!({"effectiveGasPrice": "0x1", "gasUsed": "0x2"})),
        })
        .await;

        let receipt: Option<Receipt> = client(url)
            .call("eth_getTransactionReceipt", json!(["0xcc"]))
            .await
            .unwrap();
        assert_eq!(receipt.unwrap().gas_used.as_deref(), Some("0x2"));
        assert_eq!(node.calls("eth_getTransactionReceipt"), 2);
    }

    #[tokio::test]
    async fn test_unreadable_body_exhausts_into_connection_error() {
        let (url, node) = node::spawn(|_, _, _| "<html>502 Bad Gateway</html>".to_string()).await;

        let err = client(url).block_number().await.unwrap_err();
        assert!(matches!(err, IndexerError::Connection { attempts: 3, .. }));
        assert!(err.to_string().contains("unreadable body"));
        assert_eq!(node.calls("eth_blockNumber"), 3);
    }
}
