// =============================================================================
// Deribit broker client — REST + WebSocket, JSON-RPC 2.0
// =============================================================================
//
// Deribit authenticates via OAuth2 `client_credentials` (POST
// `/public/auth`) rather than HMAC-signed query strings, so there is no
// `sign()`/`signed_query()` pair here — only a bearer token refreshed on
// expiry. A thin `rpc_call` wrapper, `#[instrument(skip(self))]` on every
// network call, and a `Debug` impl that never prints credentials.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc::Sender;
use tokio_tungstenite::tungstenite::Message;
use tracing::{instrument, warn};

use crate::broker::{
    BrokerClient, InstrumentInfo, OrderRequest, OrderResult, OrderSummary, OrderType, Position,
    TickerUpdate,
};
use crate::error::BrokerError;
use crate::types::Side;

#[derive(Clone)]
struct Token {
    access_token: String,
    expires_at_ms: i64,
}

pub struct DeribitClient {
    client_id: String,
    client_secret: String,
    rest_base: String,
    ws_url: String,
    http: reqwest::Client,
    token: RwLock<Option<Token>>,
    connected: std::sync::atomic::AtomicBool,
    clock_skew_guard_ms: AtomicI64,
}

impl std::fmt::Debug for DeribitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeribitClient")
            .field("client_id", &"<redacted>")
            .field("client_secret", &"<redacted>")
            .field("rest_base", &self.rest_base)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl DeribitClient {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>, testnet: bool) -> Self {
        let (rest_base, ws_url) = if testnet {
            ("https://test.deribit.com/api/v2", "wss://test.deribit.com/ws/api/v2")
        } else {
            ("https://www.deribit.com/api/v2", "wss://www.deribit.com/ws/api/v2")
        };
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            rest_base: rest_base.to_string(),
            ws_url: ws_url.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
            token: RwLock::new(None),
            connected: std::sync::atomic::AtomicBool::new(false),
            clock_skew_guard_ms: AtomicI64::new(5_000),
        }
    }

    #[instrument(skip(self), name = "deribit::authenticate")]
    async fn authenticate(&self) -> Result<String, BrokerError> {
        let url = format!(
            "{}/public/auth?grant_type=client_credentials&client_id={}&client_secret={}",
            self.rest_base, self.client_id, self.client_secret
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Unknown(format!("auth request failed: {e}")))?;

        let body: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Unknown(format!("auth response not json: {e}")))?;

        if let Some(err) = body.get("error") {
            return Err(BrokerError::Unknown(format!("auth rejected: {err}")));
        }

        let result = body
            .get("result")
            .ok_or_else(|| BrokerError::Unknown("auth response missing result".into()))?;
        let access_token = result
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::Unknown("auth response missing access_token".into()))?
            .to_string();
        let expires_in_s = result.get("expires_in").and_then(Value::as_i64).unwrap_or(600);

        let skew = self.clock_skew_guard_ms.load(Ordering::Relaxed);
        let token = Token {
            access_token: access_token.clone(),
            expires_at_ms: now_ms() + expires_in_s * 1000 - skew,
        };
        *self.token.write() = Some(token);
        self.connected.store(true, Ordering::Relaxed);
        Ok(access_token)
    }

    async fn bearer_token(&self) -> Result<String, BrokerError> {
        {
            let guard = self.token.read();
            if let Some(tok) = guard.as_ref() {
                if tok.expires_at_ms > now_ms() {
                    return Ok(tok.access_token.clone());
                }
            }
        }
        self.authenticate().await
    }

    /// A single Deribit JSON-RPC 2.0 call against a private method.
    #[instrument(skip(self, params), name = "deribit::rpc_call")]
    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, BrokerError> {
        let token = self.bearer_token().await?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": now_ms(),
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(format!("{}/{}", self.rest_base, method.trim_start_matches('/')))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.connected.store(false, Ordering::Relaxed);
                BrokerError::Unknown(format!("request failed: {e}"))
            })?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BrokerError::RateLimited);
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Unknown(format!("response not json: {e}")))?;

        if let Some(error) = payload.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(classify_error(code, message));
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| BrokerError::Unknown("missing result field".into()))
    }
}

fn classify_error(code: i64, message: String) -> BrokerError {
    match code {
        // Deribit error family: 10009/11044 order-not-found, 10010/11048 too-small/closed
        10009 | 11044 => BrokerError::NotFound,
        10028 => BrokerError::RateLimited,
        11008 | 10005 => BrokerError::RejectedInsufficientFunds,
        _ => BrokerError::RejectedInvalid(message),
    }
}

fn side_method(side: Side) -> &'static str {
    match side {
        Side::Buy => "private/buy",
        Side::Sell => "private/sell",
    }
}

fn order_type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
        OrderType::StopMarket => "stop_market",
    }
}

fn parse_order_result(result: &Value, label: String) -> Result<OrderResult, BrokerError> {
    let order = result
        .get("order")
        .ok_or_else(|| BrokerError::Unknown("order response missing order object".into()))?;
    let order_id = order
        .get("order_id")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::Unknown("order missing order_id".into()))?
        .to_string();
    let state = order.get("order_state").and_then(Value::as_str).unwrap_or("open");
    let filled = state == "filled";
    let filled_price = result
        .get("trades")
        .and_then(Value::as_array)
        .and_then(|trades| trades.first())
        .and_then(|t| t.get("price"))
        .and_then(Value::as_f64);
    Ok(OrderResult {
        order_id,
        label,
        filled_price,
        filled,
    })
}

#[async_trait]
impl BrokerClient for DeribitClient {
    #[instrument(skip(self, req), name = "deribit::place_order")]
    async fn place_order(&self, req: OrderRequest) -> Result<OrderResult, BrokerError> {
        let mut params = json!({
            "instrument_name": req.instrument,
            "amount": req.amount,
            "type": order_type_str(req.order_type),
            "label": req.label,
            "reduce_only": req.reduce_only,
        });
        if let Some(price) = req.price {
            params["price"] = json!(price);
        }
        if let Some(trigger_price) = req.trigger_price {
            params["trigger_price"] = json!(trigger_price);
            params["trigger"] = json!("mark_price");
        }
        if !req.otoco_children.is_empty() {
            let children: Vec<Value> = req
                .otoco_children
                .iter()
                .map(|c| {
                    let mut child = json!({
                        "direction": match c.side { Side::Buy => "buy", Side::Sell => "sell" },
                        "amount": c.amount,
                        "type": order_type_str(c.order_type),
                        "label": c.label,
                        "reduce_only": true,
                    });
                    if let Some(price) = c.price {
                        child["price"] = json!(price);
                    }
                    if let Some(trigger_price) = c.trigger_price {
                        child["trigger_price"] = json!(trigger_price);
                        child["trigger"] = json!("mark_price");
                    }
                    child
                })
                .collect();
            params["linked_order_type"] = json!("one_triggers_other");
            params["otoco_config"] = json!(children);
        }

        let result = self.rpc_call(side_method(req.side), params).await?;
        parse_order_result(&result, req.label)
    }

    #[instrument(skip(self), name = "deribit::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        match self
            .rpc_call("private/cancel", json!({ "order_id": order_id }))
            .await
        {
            Ok(_) => Ok(()),
            Err(BrokerError::NotFound) => Ok(()),
            Err(other) => Err(other),
        }
    }

    #[instrument(skip(self), name = "deribit::cancel_all_for_instrument")]
    async fn cancel_all_for_instrument(&self, instrument: &str) -> Result<(), BrokerError> {
        self.rpc_call(
            "private/cancel_all_by_instrument",
            json!({ "instrument_name": instrument }),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), name = "deribit::list_open_orders")]
    async fn list_open_orders(&self, instrument: &str) -> Result<Vec<OrderSummary>, BrokerError> {
        let result = self
            .rpc_call(
                "private/get_open_orders_by_instrument",
                json!({ "instrument_name": instrument }),
            )
            .await?;
        let orders = result.as_array().cloned().unwrap_or_default();
        Ok(orders
            .iter()
            .filter_map(|o| {
                Some(OrderSummary {
                    order_id: o.get("order_id")?.as_str()?.to_string(),
                    instrument: o.get("instrument_name")?.as_str()?.to_string(),
                    label: o.get("label").and_then(Value::as_str).unwrap_or("").to_string(),
                    side: match o.get("direction")?.as_str()? {
                        "sell" => Side::Sell,
                        _ => Side::Buy,
                    },
                    order_type: match o.get("order_type").and_then(Value::as_str).unwrap_or("limit") {
                        "market" => OrderType::Market,
                        "stop_market" => OrderType::StopMarket,
                        _ => OrderType::Limit,
                    },
                    amount: o.get("amount")?.as_f64()?,
                    price: o.get("price").and_then(Value::as_f64),
                    trigger_price: o.get("trigger_price").and_then(Value::as_f64),
                    reduce_only: o.get("reduce_only").and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect())
    }

    #[instrument(skip(self), name = "deribit::list_positions")]
    async fn list_positions(&self, currency: &str) -> Result<Vec<Position>, BrokerError> {
        let result = self
            .rpc_call(
                "private/get_positions",
                json!({ "currency": currency, "kind": "future" }),
            )
            .await?;
        let positions = result.as_array().cloned().unwrap_or_default();
        Ok(positions
            .iter()
            .filter_map(|p| {
                Some(Position {
                    instrument: p.get("instrument_name")?.as_str()?.to_string(),
                    size: p.get("size")?.as_f64()?,
                })
            })
            .collect())
    }

    #[instrument(skip(self), name = "deribit::get_instrument")]
    async fn get_instrument(&self, instrument: &str) -> Result<InstrumentInfo, BrokerError> {
        let result = self
            .rpc_call("public/get_instrument", json!({ "instrument_name": instrument }))
            .await?;
        Ok(InstrumentInfo {
            tick_size: result.get("tick_size").and_then(Value::as_f64).unwrap_or(0.5),
            min_trade_amount: result
                .get("min_trade_amount")
                .and_then(Value::as_f64)
                .unwrap_or(0.001),
            contract_size: result.get("contract_size").and_then(Value::as_f64).unwrap_or(1.0),
        })
    }

    #[instrument(skip(self, handler), name = "deribit::subscribe_ticker")]
    async fn subscribe_ticker(
        &self,
        instrument: &str,
        handler: Sender<TickerUpdate>,
    ) -> Result<(), BrokerError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.ws_url)
            .await
            .map_err(|e| BrokerError::Unknown(format!("ws connect failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let channel = format!("ticker.{instrument}.100ms");
        let subscribe = json!({
            "jsonrpc": "2.0",
            "id": now_ms(),
            "method": "public/subscribe",
            "params": { "channels": [channel] },
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| BrokerError::Unknown(format!("ws subscribe failed: {e}")))?;

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "deribit ws stream error");
                        break;
                    }
                };
                let Message::Text(text) = msg else { continue };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
                let Some(data) = frame.pointer("/params/data") else { continue };
                let (Some(price), Some(ts)) = (
                    data.get("last_price").and_then(Value::as_f64),
                    data.get("timestamp").and_then(Value::as_i64),
                ) else {
                    continue;
                };
                if handler
                    .send(TickerUpdate {
                        instrument_time_ms: ts,
                        price,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
