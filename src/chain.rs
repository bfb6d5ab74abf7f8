use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::constants::{QUAI_DECIMALS, WEI_PER_QUAI};
use crate::error::{E2eError, Result};

/// Balance and receipt lookups against a Quai node.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn balance_wei(&self, address: &str) -> Result<u128>;
    /// `None` until the transaction is mined.
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<Value>>;
}

/// Minimal JSON-RPC client for balance and receipt lookups.
#[derive(Clone)]
pub struct ChainClient {
    rpc_url: String,
    http: Client,
}

impl ChainClient {
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            rpc_url: rpc_url.into(),
            http,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let response: Value = self
            .http
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.get("error").filter(|error| !error.is_null()) {
            return Err(E2eError::Rpc(format!("{method}: {error}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ChainReader for ChainClient {
    async fn balance_wei(&self, address: &str) -> Result<u128> {
        let result = self
            .call("quai_getBalance", json!([address, "latest"]))
            .await?;
        let hex = result
            .as_str()
            .ok_or_else(|| E2eError::Rpc(format!("invalid balance payload: {result}")))?;
        parse_hex_quantity(hex)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<Value>> {
        let result = self
            .call("quai_getTransactionReceipt", json!([tx_hash]))
            .await?;
        Ok(if result.is_null() { None } else { Some(result) })
    }
}

pub fn receipt_succeeded(receipt: &Value) -> bool {
    match receipt.get("status") {
        Some(Value::String(status)) => parse_hex_quantity(status).is_ok_and(|status| status == 1),
        Some(Value::Number(status)) => status.as_u64() == Some(1),
        Some(Value::Bool(status)) => *status,
        _ => false,
    }
}

pub fn parse_hex_quantity(raw: &str) -> Result<u128> {
    let digits = raw.trim().trim_start_matches("0x").trim_start_matches("0X");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|error| E2eError::Rpc(format!("invalid hex quantity {raw}: {error}")))
}

/// Converts a decimal QUAI amount to wei without going through floats.
/// Digits beyond 18 decimals are truncated.
pub fn parse_quai_amount(raw: &str) -> Result<u128> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    let invalid = || E2eError::Rpc(format!("invalid QUAI amount: {raw}"));
    if raw.starts_with('-') {
        return Err(invalid());
    }
    let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(whole) || !all_digits(fraction) || (whole.is_empty() && fraction.is_empty()) {
        return Err(invalid());
    }

    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut fraction: String = fraction.chars().take(QUAI_DECIMALS).collect();
    while fraction.len() < QUAI_DECIMALS {
        fraction.push('0');
    }
    let fraction: u128 = fraction.parse().map_err(|_| invalid())?;
    whole
        .checked_mul(WEI_PER_QUAI)
        .and_then(|wei| wei.checked_add(fraction))
        .ok_or_else(invalid)
}

pub fn format_wei(wei: u128) -> String {
    let whole = wei / WEI_PER_QUAI;
    let fraction = wei % WEI_PER_QUAI;
    if fraction == 0 {
        return whole.to_string();
    }
    let fraction = format!("{fraction:0width$}", width = QUAI_DECIMALS);
    format!("{whole}.{}", fraction.trim_end_matches('0'))
}
