use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;

use crate::config::Config;
use crate::error::ExchangeError;
use crate::exchange::ExchangeGateway;
use crate::models::{Order, OrderRef, OrderRequest, OrderStatus, OrderType, Side};

type HmacSha256 = Hmac<Sha256>;

// Binance caps REST weight per minute; 8 req/s stays well inside it
const REQUESTS_PER_SECOND: u32 = 8;
const RECV_WINDOW_MS: u64 = 5000;

/// Binance USD-M futures REST gateway.
///
/// Signing is HMAC-SHA256 over the URL-encoded query string, appended as
/// a `signature` parameter. Transport and auth are the only concerns
/// here; all strategy logic lives above the `ExchangeGateway` seam.
pub struct BinanceFutures {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    limiter: DefaultDirectRateLimiter,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    symbol: String,
    status: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(default)]
    orig_qty: String,
    #[serde(default)]
    executed_qty: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    stop_price: String,
}

#[derive(Debug, Deserialize)]
struct PriceTicker {
    price: String,
}

impl BinanceFutures {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            limiter: RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(REQUESTS_PER_SECOND).expect("nonzero"),
            )),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let recv_window = RECV_WINDOW_MS.to_string();

        let mut pairs: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        pairs.push(format!("recvWindow={}", recv_window));
        pairs.push(format!("timestamp={}", timestamp));

        let query = pairs.join("&");
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> Result<reqwest::Response, ExchangeError> {
        self.limiter.until_ready().await;

        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response);
        }

        if response.status().as_u16() == 429 {
            return Err(ExchangeError::RateLimited);
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_error_body(&body))
    }

    fn order_from_response(response: OrderResponse) -> Order {
        Order {
            order_id: response.order_id,
            symbol: response.symbol,
            side: if response.side == "BUY" { Side::Buy } else { Side::Sell },
            order_type: match response.order_type.as_str() {
                "LIMIT" => OrderType::Limit,
                "STOP" => OrderType::StopLimit,
                _ => OrderType::Market,
            },
            quantity: response.orig_qty.parse().unwrap_or(0.0),
            price: response.price.parse().ok().filter(|p: &f64| *p > 0.0),
            stop_price: response.stop_price.parse().ok().filter(|p: &f64| *p > 0.0),
            status: parse_status(&response.status),
            executed_qty: response.executed_qty.parse().unwrap_or(0.0),
            avg_price: response.avg_price.parse().unwrap_or(0.0),
        }
    }
}

fn parse_status(status: &str) -> OrderStatus {
    match status {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Expired,
    }
}

fn map_error_body(body: &str) -> ExchangeError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    match parsed {
        Some(e) => match e.code {
            -1003 => ExchangeError::RateLimited,
            -1121 => ExchangeError::InvalidSymbol(e.msg),
            -2011 | -2013 => ExchangeError::OrderNotFound(0),
            -2019 => ExchangeError::InsufficientMargin,
            _ => ExchangeError::Rejected(format!("{} ({})", e.msg, e.code)),
        },
        None => ExchangeError::Transport(body.to_string()),
    }
}

#[async_trait]
impl ExchangeGateway for BinanceFutures {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderRef, ExchangeError> {
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("quantity", format!("{}", request.quantity)),
        ];

        match request.order_type {
            OrderType::Market => {
                params.push(("type", "MARKET".to_string()));
            }
            OrderType::Limit => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                if let Some(price) = request.price {
                    params.push(("price", format!("{}", price)));
                }
            }
            OrderType::StopLimit => {
                params.push(("type", "STOP".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                if let Some(price) = request.price {
                    params.push(("price", format!("{}", price)));
                }
                if let Some(stop) = request.stop_price {
                    params.push(("stopPrice", format!("{}", stop)));
                }
            }
        }

        let query = self.signed_query(&params);
        let response = self
            .send(reqwest::Method::POST, "/fapi/v1/order", &query)
            .await?;
        let body: OrderResponse = response.json().await?;

        tracing::info!(
            "placed {} {} {} order {} on {}",
            body.side,
            body.order_type,
            body.orig_qty,
            body.order_id,
            body.symbol
        );

        Ok(OrderRef::from_order(&Self::order_from_response(body)))
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let query = self.signed_query(&params);
        self.send(reqwest::Method::DELETE, "/fapi/v1/order", &query)
            .await
            .map_err(|e| match e {
                // Binance reports cancel of a finished order as unknown-order
                ExchangeError::OrderNotFound(_) => ExchangeError::OrderNotFound(order_id),
                other => other,
            })?;
        Ok(())
    }

    async fn order_status(&self, symbol: &str, order_id: u64) -> Result<Order, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let query = self.signed_query(&params);
        let response = self
            .send(reqwest::Method::GET, "/fapi/v1/order", &query)
            .await?;
        let body: OrderResponse = response.json().await?;
        Ok(Self::order_from_response(body))
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<Order>, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let query = self.signed_query(&params);
        let response = self
            .send(reqwest::Method::GET, "/fapi/v1/openOrders", &query)
            .await?;
        let body: Vec<OrderResponse> = response.json().await?;
        Ok(body.into_iter().map(Self::order_from_response).collect())
    }

    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.limiter.until_ready().await;

        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_error_body(&body));
        }

        let ticker: PriceTicker = response.json().await?;
        ticker
            .price
            .parse()
            .map_err(|_| ExchangeError::Transport(format!("bad price: {}", ticker.price)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base_url: &str) -> Config {
        Config {
            base_url: base_url.to_string(),
            api_key: "test-key".to_string(),
            api_secret: "test-secret".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let client = BinanceFutures::new(&test_config("https://example.com"));
        let sig = client.sign("symbol=BTCUSDT&timestamp=1499827319559");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signed_query_appends_signature() {
        let client = BinanceFutures::new(&test_config("https://example.com"));
        let query = client.signed_query(&[("symbol", "BTCUSDT".to_string())]);
        assert!(query.starts_with("symbol=BTCUSDT&recvWindow="));
        assert!(query.contains("&timestamp="));
        assert!(query.contains("&signature="));
    }

    #[test]
    fn test_error_body_mapping() {
        assert!(matches!(
            map_error_body(r#"{"code":-2019,"msg":"Margin is insufficient."}"#),
            ExchangeError::InsufficientMargin
        ));
        assert!(matches!(
            map_error_body(r#"{"code":-2011,"msg":"Unknown order sent."}"#),
            ExchangeError::OrderNotFound(_)
        ));
        assert!(matches!(
            map_error_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#),
            ExchangeError::InvalidSymbol(_)
        ));
        assert!(matches!(
            map_error_body(r#"{"code":-1003,"msg":"Too many requests."}"#),
            ExchangeError::RateLimited
        ));
    }

    #[tokio::test]
    async fn test_current_price() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/fapi/v1/ticker/price?symbol=BTCUSDT")
            .with_status(200)
            .with_body(r#"{"symbol":"BTCUSDT","price":"50123.40"}"#)
            .create_async()
            .await;

        let client = BinanceFutures::new(&test_config(&server.url()));
        let price = client.current_price("BTCUSDT").await.unwrap();

        assert_eq!(price, 50123.40);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_place_order_parses_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", mockito::Matcher::Regex(r"^/fapi/v1/order\?.*".to_string()))
            .with_status(200)
            .with_body(
                r#"{"orderId":123456,"symbol":"BTCUSDT","status":"NEW","side":"BUY",
                   "type":"LIMIT","origQty":"0.010","executedQty":"0.000",
                   "avgPrice":"0.00000","price":"45000","stopPrice":"0"}"#,
            )
            .create_async()
            .await;

        let client = BinanceFutures::new(&test_config(&server.url()));
        let order_ref = client
            .place_order(&OrderRequest::limit("BTCUSDT", Side::Buy, 0.01, 45000.0))
            .await
            .unwrap();

        assert_eq!(order_ref.order_id, 123456);
        assert_eq!(order_ref.last_status, OrderStatus::New);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_placement_maps_margin_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", mockito::Matcher::Regex(r"^/fapi/v1/order\?.*".to_string()))
            .with_status(400)
            .with_body(r#"{"code":-2019,"msg":"Margin is insufficient."}"#)
            .create_async()
            .await;

        let client = BinanceFutures::new(&test_config(&server.url()));
        let result = client
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, 100.0))
            .await;

        assert!(matches!(result, Err(ExchangeError::InsufficientMargin)));
    }
}
