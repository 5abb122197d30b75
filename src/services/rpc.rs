// src/services/rpc.rs
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::services::chain::{ChainBackend, ChainConnector, ChainError, NeuronInfo, Submission};

/// Ledger access over JSON-RPC 2.0 on HTTP. The node holds the signing
/// keys; this side only names the wallet.
pub struct JsonRpcChain {
    client: Client,
    endpoint: String,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

#[derive(Debug, Deserialize)]
struct RpcFault {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl JsonRpcChain {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ChainError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(JsonRpcChain {
            client,
            endpoint: endpoint.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("RPC {} #{} {}", method, id, params);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| ChainError::Transient(format!("{}: {}", method, e)))?;

        let status = response.status();
        if let Some(e) = classify_status(method, status) {
            return Err(e);
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Transient(format!("{}: malformed response: {}", method, e)))?;

        if let Some(fault) = body.error {
            return Err(ChainError::Rejected(format!("{} ({}): {}", method, fault.code, fault.message)));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

fn classify_status(method: &str, status: StatusCode) -> Option<ChainError> {
    if status.is_success() {
        None
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(ChainError::Transient(format!("{}: node returned {}", method, status)))
    } else {
        Some(ChainError::Rejected(format!("{}: node returned {}", method, status)))
    }
}

/// Reads an amount sent either as a JSON number or as a decimal string.
fn amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn require_amount(method: &str, value: &Value) -> Result<f64, ChainError> {
    amount(value).ok_or_else(|| ChainError::Rejected(format!("{}: expected an amount, got {}", method, value)))
}

fn neuron_from(value: &Value) -> Result<Option<NeuronInfo>, ChainError> {
    match value {
        Value::Null => Ok(None),
        Value::Object(fields) => {
            let stake = fields.get("stake").and_then(amount).unwrap_or(0.0);
            Ok(Some(NeuronInfo { stake }))
        }
        other => Err(ChainError::Rejected(format!("unexpected neuron payload: {}", other))),
    }
}

fn submission_from(value: &Value) -> Submission {
    match value {
        Value::String(hash) => Submission {
            success: true,
            tx_ref: Some(hash.clone()),
            message: None,
        },
        Value::Object(fields) => Submission {
            success: fields.get("success").and_then(Value::as_bool).unwrap_or(false),
            tx_ref: fields
                .get("tx_hash")
                .or_else(|| fields.get("extrinsic_hash"))
                .and_then(Value::as_str)
                .map(str::to_string),
            message: fields.get("message").and_then(Value::as_str).map(str::to_string),
        },
        Value::Bool(success) => Submission {
            success: *success,
            tx_ref: None,
            message: None,
        },
        other => Submission {
            success: false,
            tx_ref: None,
            message: Some(format!("unexpected submission payload: {}", other)),
        },
    }
}

#[async_trait]
impl ChainBackend for JsonRpcChain {
    async fn get_block_hash(&self) -> Result<String, ChainError> {
        match self.call("chain_getBlockHash", json!([])).await? {
            Value::String(hash) => Ok(hash),
            other => Err(ChainError::Rejected(format!("unexpected block hash: {}", other))),
        }
    }

    async fn get_neuron(&self, hotkey: &str, netuid: i32, block_hash: Option<&str>) -> Result<Option<NeuronInfo>, ChainError> {
        let result = self
            .call("subtensor_getNeuron", json!([netuid, hotkey, block_hash]))
            .await?;
        neuron_from(&result)
    }

    async fn get_dividends(&self, netuid: i32, hotkey: &str, block_hash: &str) -> Result<f64, ChainError> {
        let result = self
            .call("subtensor_getDividends", json!([netuid, hotkey, block_hash]))
            .await?;
        if result.is_null() {
            return Ok(0.0);
        }
        require_amount("subtensor_getDividends", &result)
    }

    async fn get_balance(&self, address: &str, block_hash: Option<&str>) -> Result<f64, ChainError> {
        let result = self
            .call("subtensor_getBalance", json!([address, block_hash]))
            .await?;
        if result.is_null() {
            return Ok(0.0);
        }
        require_amount("subtensor_getBalance", &result)
    }

    async fn submit_stake(&self, wallet: &str, hotkey: &str, netuid: i32, amount: f64) -> Result<Submission, ChainError> {
        let result = self
            .call("subtensor_addStake", json!([wallet, hotkey, netuid, amount]))
            .await?;
        Ok(submission_from(&result))
    }

    async fn submit_unstake(&self, wallet: &str, hotkey: &str, netuid: i32, amount: f64) -> Result<Submission, ChainError> {
        let result = self
            .call("subtensor_removeStake", json!([wallet, hotkey, netuid, amount]))
            .await?;
        Ok(submission_from(&result))
    }
}

/// Opens a `JsonRpcChain` and proves the node answers before handing it out.
pub struct JsonRpcConnector {
    endpoint: String,
    request_timeout: Duration,
}

impl JsonRpcConnector {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Self {
        JsonRpcConnector {
            endpoint: endpoint.to_string(),
            request_timeout,
        }
    }
}

#[async_trait]
impl ChainConnector for JsonRpcConnector {
    async fn connect(&self) -> Result<Arc<dyn ChainBackend>, ChainError> {
        info!("Opening chain session at {}", self.endpoint);
        let chain = JsonRpcChain::new(&self.endpoint, self.request_timeout)?;
        let head = chain
            .get_block_hash()
            .await
            .map_err(|e| ChainError::Unavailable(format!("{} did not answer: {}", self.endpoint, e)))?;
        info!("Chain head at {}", head);
        Ok(Arc::new(chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amounts_accept_numbers_and_strings() {
        assert_eq!(amount(&json!(1.25)), Some(1.25));
        assert_eq!(amount(&json!("  42.5 ")), Some(42.5));
        assert_eq!(amount(&json!(7)), Some(7.0));
        assert_eq!(amount(&json!("lots")), None);
        assert_eq!(amount(&json!([1])), None);
    }

    #[test]
    fn test_neuron_payloads() {
        assert_eq!(neuron_from(&Value::Null).unwrap(), None);
        assert_eq!(
            neuron_from(&json!({"stake": "12.5", "uid": 4})).unwrap(),
            Some(NeuronInfo { stake: 12.5 })
        );
        assert_eq!(neuron_from(&json!({"uid": 4})).unwrap(), Some(NeuronInfo { stake: 0.0 }));
        assert!(neuron_from(&json!("neuron")).is_err());
    }

    #[test]
    fn test_submission_payloads() {
        let by_hash = submission_from(&json!("0xabc"));
        assert!(by_hash.success);
        assert_eq!(by_hash.tx_ref.as_deref(), Some("0xabc"));

        let refused = submission_from(&json!({"success": false, "message": "NotEnoughBalanceToStake"}));
        assert!(!refused.success);
        assert_eq!(refused.message.as_deref(), Some("NotEnoughBalanceToStake"));

        assert!(!submission_from(&json!(3)).success);
    }

    #[test]
    fn test_http_status_classification() {
        assert!(classify_status("m", StatusCode::OK).is_none());
        assert!(classify_status("m", StatusCode::BAD_GATEWAY).unwrap().is_transient());
        assert!(classify_status("m", StatusCode::TOO_MANY_REQUESTS).unwrap().is_transient());
        assert!(matches!(classify_status("m", StatusCode::UNAUTHORIZED), Some(ChainError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_connect_to_dead_endpoint_is_unavailable() {
        let connector = JsonRpcConnector::new("http://127.0.0.1:1", Duration::from_secs(2));
        match connector.connect().await {
            Err(ChainError::Unavailable(msg)) => assert!(msg.contains("127.0.0.1:1")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
