//! Chain backend over HTTP.
//!
//! Queries go straight to a Cosmos LCD endpoint; execute messages are
//! forwarded to a signing relay that holds the admin key.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde_json::{json, Value};

use super::{EscrowBackend, EscrowConfig, EscrowError};

/// Escrow backend speaking to an LCD node and a signer relay.
#[derive(Debug, Clone)]
pub struct HttpEscrowBackend {
    client: Client,
    lcd_url: String,
    signer_url: String,
    contract_address: String,
    admin_key: String,
    request_timeout: Duration,
}

impl HttpEscrowBackend {
    /// Build from configuration. Requires LCD, signer and contract settings.
    pub fn from_config(config: &EscrowConfig) -> Result<Self, EscrowError> {
        let require = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| EscrowError::Transport(format!("{} is not set", name)))
        };

        let request_timeout = Duration::from_millis(config.request_timeout_ms.max(1));
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EscrowError::Transport(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            lcd_url: require(&config.lcd_url, "XION_LCD_URL")?
                .trim_end_matches('/')
                .to_string(),
            signer_url: require(&config.signer_url, "ESCROW_SIGNER_URL")?,
            contract_address: require(&config.contract_address, "ESCROW_CONTRACT_ADDRESS")?,
            admin_key: config.admin_key.clone().unwrap_or_default(),
            request_timeout,
        })
    }

    /// Upper bound on any single LCD or signer request.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn smart_query_url(&self, msg: &Value) -> String {
        let encoded = STANDARD.encode(msg.to_string());
        format!(
            "{}/cosmwasm/wasm/v1/contract/{}/smart/{}",
            self.lcd_url, self.contract_address, encoded
        )
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, EscrowError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                EscrowError::Transport(format!("{} - {}", status, body))
            } else {
                EscrowError::Contract(format!("{} - {}", status, body))
            });
        }
        response
            .json()
            .await
            .map_err(|e| EscrowError::Decode(e.to_string()))
    }
}

#[async_trait]
impl EscrowBackend for HttpEscrowBackend {
    async fn execute(&self, msg: Value) -> Result<Value, EscrowError> {
        let response = self
            .client
            .post(&self.signer_url)
            .header("Authorization", format!("Bearer {}", self.admin_key))
            .json(&json!({ "contract": self.contract_address, "msg": msg }))
            .send()
            .await
            .map_err(|e| EscrowError::Transport(e.to_string()))?;
        Self::read_json(response).await
    }

    async fn query(&self, msg: Value) -> Result<Value, EscrowError> {
        let response = self
            .client
            .get(self.smart_query_url(&msg))
            .send()
            .await
            .map_err(|e| EscrowError::Transport(e.to_string()))?;
        let mut body = Self::read_json(response).await?;
        match body.get_mut("data") {
            Some(data) => Ok(data.take()),
            None => Err(EscrowError::Decode("smart query response missing data".into())),
        }
    }

    async fn balance(&self, address: &str, denom: &str) -> Result<u64, EscrowError> {
        let url = format!(
            "{}/cosmos/bank/v1beta1/balances/{}/by_denom",
            self.lcd_url, address
        );
        let response = self
            .client
            .get(&url)
            .query(&[("denom", denom)])
            .send()
            .await
            .map_err(|e| EscrowError::Transport(e.to_string()))?;
        let body = Self::read_json(response).await?;
        parse_balance(&body)
    }
}

fn parse_balance(body: &Value) -> Result<u64, EscrowError> {
    body.get("balance")
        .and_then(|b| b.get("amount"))
        .and_then(Value::as_str)
        .ok_or_else(|| EscrowError::Decode("balance response missing amount".into()))?
        .parse()
        .map_err(|e| EscrowError::Decode(format!("bad balance amount: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EscrowConfig {
        EscrowConfig {
            lcd_url: Some("https://lcd.example/".into()),
            signer_url: Some("https://signer.example/execute".into()),
            contract_address: Some("xion1contract".into()),
            ..EscrowConfig::default()
        }
    }

    #[test]
    fn test_requires_endpoints() {
        let mut cfg = config();
        cfg.signer_url = None;
        assert!(HttpEscrowBackend::from_config(&cfg).is_err());
        assert!(HttpEscrowBackend::from_config(&config()).is_ok());
    }

    #[test]
    fn test_smart_query_url_is_base64() {
        let backend = HttpEscrowBackend::from_config(&config()).unwrap();
        let msg = json!({"escrow": {"game_id": "m1"}});
        let url = backend.smart_query_url(&msg);
        let prefix = "https://lcd.example/cosmwasm/wasm/v1/contract/xion1contract/smart/";
        assert!(url.starts_with(prefix));

        let decoded = STANDARD.decode(&url[prefix.len()..]).unwrap();
        let back: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_request_timeout_from_config() {
        let backend = HttpEscrowBackend::from_config(&config()).unwrap();
        assert_eq!(backend.request_timeout(), Duration::from_secs(10));

        let cfg = EscrowConfig { request_timeout_ms: 0, ..config() };
        let backend = HttpEscrowBackend::from_config(&cfg).unwrap();
        assert_eq!(backend.request_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn test_parse_balance() {
        let body = json!({"balance": {"denom": "uxion", "amount": "1234"}});
        assert_eq!(parse_balance(&body).unwrap(), 1234);
        assert!(parse_balance(&json!({})).is_err());
    }
}
