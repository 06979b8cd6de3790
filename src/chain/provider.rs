//! Cosmos LCD provider with multi-endpoint support and automatic failover

use crate::config::ForeignChainConfig;
use crate::error::{EscrowError, EscrowResult};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Transaction as reported by `/cosmos/tx/v1beta1/txs/{hash}`
#[derive(Debug, Clone, Deserialize)]
pub struct TxResponse {
    pub height: String,
    pub txhash: String,
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub raw_log: String,
    /// Block time, RFC 3339
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub events: Vec<TxEvent>,
}

impl TxResponse {
    pub fn height(&self) -> EscrowResult<u64> {
        self.height.parse().map_err(|_| {
            EscrowError::VerificationTransient(format!(
                "tx {} has unparsable height {}",
                self.txhash, self.height
            ))
        })
    }

    pub fn timestamp(&self) -> EscrowResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| {
                EscrowError::VerificationTransient(format!(
                    "tx {} has unparsable timestamp {:?}",
                    self.txhash, self.timestamp
                ))
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<EventAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Deserialize)]
struct GetTxResponse {
    tx_response: TxResponse,
}

#[derive(Deserialize)]
struct LatestBlockResponse {
    block: Block,
}

#[derive(Deserialize)]
struct Block {
    header: BlockHeader,
}

#[derive(Deserialize)]
struct BlockHeader {
    height: String,
}

/// Multi-endpoint LCD client with automatic failover
pub struct LcdProvider {
    config: ForeignChainConfig,
    client: reqwest::Client,
    /// Current active endpoint index
    current: AtomicUsize,
}

impl LcdProvider {
    pub fn new(config: ForeignChainConfig) -> EscrowResult<Self> {
        if config.lcd_urls.is_empty() {
            return Err(EscrowError::Config(format!(
                "No LCD endpoints for chain {}",
                config.chain_id
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| EscrowError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            current: AtomicUsize::new(0),
        })
    }

    pub fn chain_id(&self) -> &str {
        &self.config.chain_id
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.config.confirmation_blocks
    }

    fn base_url(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed);
        self.config.lcd_urls[idx % self.config.lcd_urls.len()].trim_end_matches('/')
    }

    /// Switch to next available endpoint
    fn failover(&self) {
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.config.lcd_urls.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to LCD endpoint {}", self.config.chain_id, next);
    }

    /// Fetch a transaction by hash; `None` when the chain does not know it (yet)
    pub async fn get_tx(&self, tx_hash: &str) -> EscrowResult<Option<TxResponse>> {
        for _ in 0..self.config.lcd_urls.len() {
            let url = format!("{}/cosmos/tx/v1beta1/txs/{}", self.base_url(), tx_hash);
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                    debug!("Tx {} not found on chain {}", tx_hash, self.config.chain_id);
                    return Ok(None);
                }
                Ok(resp) if resp.status().is_success() => {
                    let body: GetTxResponse = resp.json().await.map_err(|e| {
                        EscrowError::VerificationTransient(format!(
                            "Malformed tx response from {}: {}",
                            url, e
                        ))
                    })?;
                    return Ok(Some(body.tx_response));
                }
                Ok(resp) if resp.status().is_client_error() => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    // Older LCDs report unknown hashes as a 400 with a gRPC message
                    if text.to_ascii_lowercase().contains("not found") {
                        debug!("Tx {} not found on chain {}", tx_hash, self.config.chain_id);
                        return Ok(None);
                    }
                    return Err(EscrowError::VerificationTransient(format!(
                        "LCD rejected tx query {} ({}): {}",
                        tx_hash, status, text
                    )));
                }
                Ok(resp) => {
                    warn!(
                        "LCD endpoint for chain {} answered {}",
                        self.config.chain_id,
                        resp.status()
                    );
                    self.failover();
                }
                Err(e) => {
                    warn!(
                        "Failed to query tx {} on chain {}: {}",
                        tx_hash, self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(EscrowError::VerificationTransient(format!(
            "All LCD endpoints failed for chain {}",
            self.config.chain_id
        )))
    }

    /// Get latest block height with failover
    pub async fn latest_height(&self) -> EscrowResult<u64> {
        for _ in 0..self.config.lcd_urls.len() {
            let url = format!(
                "{}/cosmos/base/tendermint/v1beta1/blocks/latest",
                self.base_url()
            );
            let result = async {
                let resp = self.client.get(&url).send().await?.error_for_status()?;
                resp.json::<LatestBlockResponse>().await
            }
            .await;

            match result {
                Ok(body) => {
                    return body.block.header.height.parse().map_err(|_| {
                        EscrowError::VerificationTransient(format!(
                            "Unparsable block height {}",
                            body.block.header.height
                        ))
                    });
                }
                Err(e) => {
                    warn!(
                        "Failed to get latest block from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(EscrowError::VerificationTransient(format!(
            "All LCD endpoints failed for chain {}",
            self.config.chain_id
        )))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.latest_height().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(urls: Vec<String>) -> ForeignChainConfig {
        ForeignChainConfig {
            chain_id: "osmosis-1".to_string(),
            lcd_urls: urls,
            confirmation_blocks: 1,
            request_timeout_ms: 2_000,
        }
    }

    #[tokio::test]
    async fn test_get_tx_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cosmos/tx/v1beta1/txs/ABCD"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "code": 5,
                "message": "tx not found: ABCD"
            })))
            .mount(&server)
            .await;

        let provider = LcdProvider::new(config(vec![server.uri()])).unwrap();
        assert!(provider.get_tx("ABCD").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failover_to_healthy_endpoint() {
        let broken = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&broken)
            .await;

        let healthy = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cosmos/base/tendermint/v1beta1/blocks/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "block": { "header": { "height": "1042" } }
            })))
            .mount(&healthy)
            .await;

        let provider = LcdProvider::new(config(vec![broken.uri(), healthy.uri()])).unwrap();
        assert_eq!(provider.latest_height().await.unwrap(), 1042);
        assert!(provider.health_check().await);
    }

    #[tokio::test]
    async fn test_all_endpoints_down_is_transient() {
        let broken = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&broken)
            .await;

        let provider = LcdProvider::new(config(vec![broken.uri()])).unwrap();
        let err = provider.get_tx("ABCD").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_requires_an_endpoint() {
        assert!(matches!(
            LcdProvider::new(config(Vec::new())),
            Err(EscrowError::Config(_))
        ));
    }
}
