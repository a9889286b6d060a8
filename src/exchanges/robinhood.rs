//! Robinhood Crypto venue - Ed25519-signed REST client.
//!
//! Credentials come from `ROBINHOOD_API_KEY` / `ROBINHOOD_PRIVATE_KEY`
//! (base64 seed) in the process environment; they are never logged and never
//! persisted. Every request carries a client timeout, and a timed-out call
//! surfaces as a transient error the loop skips for one cycle.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::core::error::{Error, Result};
use crate::core::traits::VenueAdapter;
use crate::core::types::{Order, OrderStatus, Side, Symbol};

const BASE_URL: &str = "https://trading.robinhood.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct RobinhoodVenue {
    client: Client,
    api_key: String,
    signing_key: SigningKey,
    base_url: String,
    /// Orders this process placed and still considers open; the
    /// reconciliation set for `poll_and_fill`.
    open_orders: RwLock<HashMap<String, Order>>,
}

impl RobinhoodVenue {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ROBINHOOD_API_KEY")
            .map_err(|_| Error::Config("ROBINHOOD_API_KEY not set".into()))?;
        let private_key = std::env::var("ROBINHOOD_PRIVATE_KEY")
            .map_err(|_| Error::Config("ROBINHOOD_PRIVATE_KEY not set".into()))?;
        Self::new(api_key, &private_key, None)
    }

    pub fn new(api_key: String, private_key_b64: &str, base_url: Option<String>) -> Result<Self> {
        let secret = BASE64
            .decode(private_key_b64)
            .map_err(|e| Error::Config(format!("ROBINHOOD_PRIVATE_KEY is not valid base64: {e}")))?;
        // 32-byte seed, or a 64-byte seed+public concatenation.
        let signing_key = match secret.len() {
            32 => SigningKey::from_bytes(secret.as_slice().try_into().unwrap()),
            64 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&secret[..32]);
                SigningKey::from_bytes(&seed)
            }
            n => {
                return Err(Error::Config(format!(
                    "ROBINHOOD_PRIVATE_KEY must decode to 32 or 64 bytes, got {n}"
                )));
            }
        };
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key,
            signing_key,
            base_url: base_url.unwrap_or_else(|| BASE_URL.to_string()),
            open_orders: RwLock::new(HashMap::new()),
        })
    }

    /// Internal notation to venue notation ("ETH/USD" -> "ETH-USD").
    fn venue_symbol(symbol: &Symbol) -> String {
        symbol.as_str().replace('/', "-")
    }

    /// Signature over `api_key + timestamp + path + method + body`, base64.
    fn sign(&self, timestamp: i64, path: &str, method: &str, body: &str) -> String {
        let message = format!("{}{}{}{}{}", self.api_key, timestamp, path, method, body);
        BASE64.encode(self.signing_key.sign(message.as_bytes()).to_bytes())
    }

    /// GET returning `Ok(None)` on 404 so reconciliation can treat a missing
    /// order as non-fatal.
    async fn get_json(&self, path: &str) -> Result<Option<Value>> {
        let timestamp = Utc::now().timestamp();
        let signature = self.sign(timestamp, path, "GET", "");
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("x-timestamp", timestamp.to_string())
            .header("x-signature", signature)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        Ok(Some(resp.json().await?))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let payload = serde_json::to_string(body)?;
        let timestamp = Utc::now().timestamp();
        let signature = self.sign(timestamp, path, "POST", &payload);
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("x-timestamp", timestamp.to_string())
            .header("x-signature", signature)
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        Ok(resp.json().await?)
    }

    async fn place_limit(&self, symbol: &Symbol, side: Side, price: f64, amount: f64) -> Result<Order> {
        // The client id doubles as the venue-side idempotency key: a retried
        // submission with the same id cannot double-place.
        let client_order_id = Uuid::new_v4().to_string();
        let body = json!({
            "client_order_id": client_order_id,
            "side": side.as_str(),
            "symbol": Self::venue_symbol(symbol),
            "type": "limit",
            "limit_order_config": {
                "asset_quantity": amount.to_string(),
                "limit_price": price.to_string(),
                "time_in_force": "gtc",
            },
        });
        let resp = self.post_json("/api/v1/crypto/trading/orders/", &body).await?;
        let id = resp
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(&client_order_id)
            .to_string();

        let mut order = Order::new_limit(self.name(), symbol.clone(), side, price, amount);
        order.id = id;
        self.open_orders.write().insert(order.id.clone(), order.clone());
        Ok(order)
    }
}

#[async_trait]
impl VenueAdapter for RobinhoodVenue {
    fn name(&self) -> &str {
        "robinhood"
    }

    async fn fetch_price(&self, symbol: &Symbol) -> Result<f64> {
        let path = format!(
            "/api/v1/crypto/marketdata/best_bid_ask/?symbol={}",
            Self::venue_symbol(symbol)
        );
        let resp = self
            .get_json(&path)
            .await?
            .ok_or_else(|| Error::Unavailable(format!("no quote endpoint for {symbol}")))?;
        resp.get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .and_then(|quote| quote.get("price"))
            .and_then(value_to_f64)
            .ok_or_else(|| Error::Unavailable(format!("venue returned no price for {symbol}")))
    }

    async fn place_limit_buy(&self, symbol: &Symbol, price: f64, amount: f64) -> Result<Order> {
        self.place_limit(symbol, Side::Buy, price, amount).await
    }

    async fn place_limit_sell(&self, symbol: &Symbol, price: f64, amount: f64) -> Result<Order> {
        self.place_limit(symbol, Side::Sell, price, amount).await
    }

    async fn fetch_open_orders(&self, symbol: &Symbol) -> Result<Vec<Order>> {
        let path = format!(
            "/api/v1/crypto/trading/orders/?symbol={}&state=open",
            Self::venue_symbol(symbol)
        );
        let resp = self
            .get_json(&path)
            .await?
            .ok_or_else(|| Error::Unavailable(format!("no order listing for {symbol}")))?;
        let results = resp
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(results
            .iter()
            .filter_map(|v| parse_remote_order(symbol, v, self.name()))
            .collect())
    }

    async fn poll_and_fill(&self, symbol: &Symbol) -> Result<Vec<Order>> {
        let ids: Vec<String> = self
            .open_orders
            .read()
            .iter()
            .filter(|(_, o)| o.symbol == *symbol)
            .map(|(id, _)| id.clone())
            .collect();

        let mut filled = Vec::new();
        for id in ids {
            let Some(resp) = self.get_json(&format!("/api/v1/crypto/trading/orders/{id}/")).await?
            else {
                // Venue no longer knows the order. Non-fatal: drop it from
                // the reconciliation set; the audit row stays for the operator.
                tracing::warn!(order_id = %id, "order not found on venue, dropping as stale");
                self.open_orders.write().remove(&id);
                continue;
            };
            let state = resp.get("state").and_then(Value::as_str).unwrap_or("");
            match state {
                "filled" => {
                    let Some(mut order) = self.open_orders.write().remove(&id) else {
                        continue;
                    };
                    // Executed price when the venue reports one, else limit.
                    if let Some(px) = resp.get("average_price").and_then(value_to_f64) {
                        order.price = px;
                    }
                    order.status = OrderStatus::Closed;
                    order.updated_at = Utc::now();
                    filled.push(order);
                }
                "canceled" | "cancelled" | "rejected" | "expired" => {
                    tracing::warn!(order_id = %id, state, "order left the book without filling");
                    self.open_orders.write().remove(&id);
                }
                _ => {}
            }
        }
        Ok(filled)
    }
}

fn classify_status(status: StatusCode, body: &str) -> Error {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::Transient(format!("status {status}: {body}"))
    } else {
        Error::Rejected(format!("status {status}: {body}"))
    }
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_remote_order(symbol: &Symbol, v: &Value, venue: &str) -> Option<Order> {
    let config = v.get("limit_order_config")?;
    let mut order = Order::new_limit(
        venue,
        symbol.clone(),
        v.get("side")?.as_str()?.parse().ok()?,
        config.get("limit_price").and_then(value_to_f64)?,
        config.get("asset_quantity").and_then(value_to_f64)?,
    );
    order.id = v.get("id")?.as_str()?.to_string();
    Some(order)
}
