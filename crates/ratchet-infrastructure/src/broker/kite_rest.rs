use ratchet_domain::repositories::broker::{BrokerError, BrokerGateway, BrokerResult};
use ratchet_domain::value_objects::order::{OrderAck, OrderRequest, OrderSnapshot, OrderState};
use ratchet_domain::value_objects::protective::{
    ProtectiveOrderKind, ProtectiveOrderRequest, ProtectiveOrderSnapshot, ProtectiveOrderStatus,
};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_BASE_URL: &str = "https://api.kite.trade";

#[derive(Debug, Clone)]
pub struct KiteSettings {
    pub base_url: String,
    pub api_key: String,
    pub access_token: String,
    pub exchange: String,
    /// CNC for delivery holdings.
    pub product: String,
    pub timeout: Duration,
    /// Extra attempts for idempotent reads on retryable errors.
    pub read_retries: u32,
}

/// Kite Connect v3 REST gateway (orders, GTT triggers, quotes).
#[derive(Debug, Clone)]
pub struct KiteRestGateway {
    client: Client,
    settings: KiteSettings,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    message: Option<String>,
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderIdData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct TriggerIdData {
    trigger_id: i64,
}

#[derive(Debug, Deserialize)]
struct OrderRow {
    order_id: String,
    tradingsymbol: String,
    status: String,
    #[serde(default)]
    filled_quantity: i64,
    #[serde(default)]
    average_price: f64,
}

#[derive(Debug, Deserialize)]
struct GttRow {
    id: i64,
    status: String,
    condition: GttCondition,
    #[serde(default)]
    orders: Vec<GttOrder>,
}

#[derive(Debug, Deserialize)]
struct GttCondition {
    tradingsymbol: String,
}

#[derive(Debug, Deserialize)]
struct GttOrder {
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LtpRow {
    last_price: f64,
}

impl KiteRestGateway {
    pub fn new(settings: KiteSettings) -> Result<Self, String> {
        if settings.api_key.trim().is_empty() || settings.access_token.trim().is_empty() {
            return Err("broker credentials missing (api key and access token)".to_string());
        }
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| format!("failed to build reqwest client: {e}"))?;
        Ok(Self { client, settings })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("X-Kite-Version", "3")
            .header(
                "Authorization",
                format!("token {}:{}", self.settings.api_key, self.settings.access_token),
            )
    }

    fn send<T: DeserializeOwned>(&self, op: &'static str, builder: RequestBuilder) -> BrokerResult<T> {
        let started = Instant::now();
        let result = self.authorized(builder).send();
        metrics::histogram!("ratchet.infra.kite.request_ms", "op" => op)
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let response = result.map_err(|err| {
            metrics::counter!("ratchet.infra.kite.errors_total", "op" => op, "kind" => "transport")
                .increment(1);
            BrokerError::Retryable(format!("{op}: {err}"))
        })?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| BrokerError::Retryable(format!("{op}: failed to read body: {err}")))?;
        decode::<T>(status, &body).map_err(|err| {
            metrics::counter!("ratchet.infra.kite.errors_total", "op" => op, "kind" => err.kind())
                .increment(1);
            tracing::warn!(op, status = status.as_u16(), error = %err, "kite request failed");
            err
        })
    }

    fn get_with_retry<T: DeserializeOwned>(
        &self,
        op: &'static str,
        build: impl Fn() -> RequestBuilder,
    ) -> BrokerResult<T> {
        let mut attempt = 0;
        loop {
            match self.send(op, build()) {
                Err(err) if err.is_retryable() && attempt < self.settings.read_retries => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(200 * u64::from(attempt)));
                }
                other => return other,
            }
        }
    }

    fn gtt_form(&self, request: &ProtectiveOrderRequest) -> Vec<(&'static str, String)> {
        let exchange = &self.settings.exchange;
        let condition = json!({
            "exchange": exchange,
            "tradingsymbol": request.symbol,
            "trigger_values": request.legs.iter().map(|leg| leg.trigger_price).collect::<Vec<_>>(),
            "last_price": request.reference_price,
        });
        let orders: Vec<Value> = request
            .legs
            .iter()
            .map(|leg| {
                json!({
                    "exchange": exchange,
                    "tradingsymbol": request.symbol,
                    "transaction_type": leg.side.as_str(),
                    "quantity": leg.quantity,
                    "order_type": "LIMIT",
                    "product": self.settings.product,
                    "price": leg.trigger_price,
                })
            })
            .collect();
        let kind = match request.kind {
            ProtectiveOrderKind::SingleLeg => "single",
            ProtectiveOrderKind::TwoLeg => "two-leg",
        };
        vec![
            ("type", kind.to_string()),
            ("condition", condition.to_string()),
            ("orders", Value::Array(orders).to_string()),
        ]
    }
}

/// Maps HTTP status and Kite's `error_type` onto the broker error taxonomy.
fn decode<T: DeserializeOwned>(status: StatusCode, body: &str) -> BrokerResult<T> {
    let envelope: Envelope<T> = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(err) if status.is_success() => {
            return Err(BrokerError::Retryable(format!("unparseable response: {err}")))
        }
        Err(_) => return Err(classify(status, None, body.chars().take(200).collect())),
    };
    if envelope.status == "success" {
        return envelope
            .data
            .ok_or_else(|| BrokerError::Retryable("success response without data".to_string()));
    }
    let message = envelope
        .message
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    Err(classify(status, envelope.error_type.as_deref(), message))
}

fn classify(status: StatusCode, error_type: Option<&str>, message: String) -> BrokerError {
    match error_type {
        Some("TokenException") | Some("PermissionException") => BrokerError::Fatal(message),
        Some("NetworkException") | Some("DataException") => BrokerError::Retryable(message),
        Some(_) if status.is_server_error() => BrokerError::Retryable(message),
        Some(_) => BrokerError::Rejected(message),
        None if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() => {
            BrokerError::Retryable(message)
        }
        None if status == StatusCode::FORBIDDEN => BrokerError::Fatal(message),
        None => BrokerError::Rejected(message),
    }
}

fn gtt_status(row: &GttRow) -> ProtectiveOrderStatus {
    match row.status.as_str() {
        "active" => ProtectiveOrderStatus::Active,
        "triggered" => ProtectiveOrderStatus::Triggered {
            leg: row.orders.iter().position(|o| o.result.is_some()),
        },
        "cancelled" => ProtectiveOrderStatus::Cancelled,
        "expired" => ProtectiveOrderStatus::Expired,
        "rejected" => ProtectiveOrderStatus::Rejected,
        // "deleted", "disabled" and anything new: the trigger no longer protects.
        _ => ProtectiveOrderStatus::Deleted,
    }
}

impl BrokerGateway for KiteRestGateway {
    fn name(&self) -> &str {
        "kite"
    }

    fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderAck> {
        let mut form = vec![
            ("tradingsymbol", request.symbol.clone()),
            ("exchange", self.settings.exchange.clone()),
            ("transaction_type", request.side.as_str().to_string()),
            ("order_type", request.kind.as_str().to_string()),
            ("quantity", request.quantity.to_string()),
            ("product", self.settings.product.clone()),
            ("validity", "DAY".to_string()),
        ];
        if let Some(price) = request.price {
            form.push(("price", price.to_string()));
        }
        let data: OrderIdData = self.send(
            "place_order",
            self.client.post(self.url("/orders/regular")).form(&form),
        )?;
        tracing::info!(order_id = %data.order_id, symbol = %request.symbol, side = request.side.as_str(), quantity = request.quantity, "order placed");
        // Kite fills asynchronously; the reconciler picks up the average price.
        Ok(OrderAck {
            order_id: data.order_id,
            average_price: None,
            filled_quantity: None,
        })
    }

    fn place_protective_order(&self, request: &ProtectiveOrderRequest) -> BrokerResult<String> {
        let data: TriggerIdData = self.send(
            "place_gtt",
            self.client
                .post(self.url("/gtt/triggers"))
                .form(&self.gtt_form(request)),
        )?;
        Ok(data.trigger_id.to_string())
    }

    fn modify_protective_order(
        &self,
        protective_order_id: &str,
        request: &ProtectiveOrderRequest,
    ) -> BrokerResult<()> {
        let _: TriggerIdData = self.send(
            "modify_gtt",
            self.client
                .put(self.url(&format!("/gtt/triggers/{protective_order_id}")))
                .form(&self.gtt_form(request)),
        )?;
        Ok(())
    }

    fn delete_protective_order(&self, protective_order_id: &str) -> BrokerResult<()> {
        let _: TriggerIdData = self.send(
            "delete_gtt",
            self.client
                .delete(self.url(&format!("/gtt/triggers/{protective_order_id}"))),
        )?;
        Ok(())
    }

    fn last_prices(&self, symbols: &[String]) -> BrokerResult<HashMap<String, f64>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let exchange = &self.settings.exchange;
        let query: Vec<(&str, String)> = symbols
            .iter()
            .map(|s| ("i", format!("{exchange}:{s}")))
            .collect();
        let data: HashMap<String, LtpRow> = self.get_with_retry("ltp", || {
            self.client.get(self.url("/quote/ltp")).query(&query)
        })?;
        Ok(data
            .into_iter()
            .filter_map(|(key, row)| {
                let symbol = key.split_once(':').map(|(_, s)| s.to_string())?;
                (row.last_price.is_finite() && row.last_price > 0.0)
                    .then_some((symbol, row.last_price))
            })
            .collect())
    }

    fn list_open_orders(&self) -> BrokerResult<Vec<OrderSnapshot>> {
        let rows: Vec<OrderRow> =
            self.get_with_retry("orders", || self.client.get(self.url("/orders")))?;
        Ok(rows
            .into_iter()
            .map(|row| OrderSnapshot {
                order_id: row.order_id,
                symbol: row.tradingsymbol,
                state: OrderState::parse(&row.status),
                filled_quantity: row.filled_quantity,
                average_price: (row.average_price > 0.0).then_some(row.average_price),
            })
            .collect())
    }

    fn list_protective_orders(&self) -> BrokerResult<Vec<ProtectiveOrderSnapshot>> {
        let rows: Vec<GttRow> =
            self.get_with_retry("gtt_list", || self.client.get(self.url("/gtt/triggers")))?;
        Ok(rows
            .iter()
            .map(|row| ProtectiveOrderSnapshot {
                id: row.id.to_string(),
                symbol: row.condition.tradingsymbol.clone(),
                status: gtt_status(row),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_success_and_error_envelopes() {
        let ok: OrderIdData = decode(
            StatusCode::OK,
            r#"{"status":"success","data":{"order_id":"151220000000000"}}"#,
        )
        .expect("success");
        assert_eq!(ok.order_id, "151220000000000");

        let err = decode::<OrderIdData>(
            StatusCode::FORBIDDEN,
            r#"{"status":"error","message":"Incorrect api_key or access_token.","error_type":"TokenException"}"#,
        )
        .expect_err("token");
        assert_eq!(err.kind(), "fatal");

        let err = decode::<OrderIdData>(
            StatusCode::BAD_REQUEST,
            r#"{"status":"error","message":"Insufficient funds","error_type":"InputException"}"#,
        )
        .expect_err("input");
        assert_eq!(err.kind(), "rejected");

        let err = decode::<OrderIdData>(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>")
            .expect_err("gateway");
        assert!(err.is_retryable());
        let err = decode::<OrderIdData>(StatusCode::TOO_MANY_REQUESTS, "slow down")
            .expect_err("rate");
        assert!(err.is_retryable());
    }

    #[test]
    fn triggered_gtt_reports_the_fired_leg() {
        let rows: Vec<GttRow> = serde_json::from_str(
            r#"[
                {"id": 1, "status": "triggered", "condition": {"tradingsymbol": "INFY"},
                 "orders": [{"result": null}, {"result": {"order_result": {"status": "success"}}}]},
                {"id": 2, "status": "active", "condition": {"tradingsymbol": "TCS"}, "orders": [{}]},
                {"id": 3, "status": "disabled", "condition": {"tradingsymbol": "TCS"}}
            ]"#,
        )
        .expect("gtt rows");
        assert_eq!(
            gtt_status(&rows[0]),
            ProtectiveOrderStatus::Triggered { leg: Some(1) }
        );
        assert_eq!(gtt_status(&rows[1]), ProtectiveOrderStatus::Active);
        assert!(gtt_status(&rows[2]).is_gone());
    }

    #[test]
    fn gtt_form_encodes_two_leg_orders() {
        let gateway = KiteRestGateway::new(KiteSettings {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: "key".to_string(),
            access_token: "token".to_string(),
            exchange: "NSE".to_string(),
            product: "CNC".to_string(),
            timeout: Duration::from_secs(1),
            read_retries: 0,
        })
        .expect("gateway");
        let request =
            ProtectiveOrderRequest::for_long("INFY", 10, 1500.0, 1485.0, Some(1530.0))
                .expect("request");
        let form = gateway.gtt_form(&request);
        assert_eq!(form[0], ("type", "two-leg".to_string()));
        let condition: Value = serde_json::from_str(&form[1].1).expect("condition");
        assert_eq!(condition["trigger_values"], json!([1485.0, 1530.0]));
        let orders: Value = serde_json::from_str(&form[2].1).expect("orders");
        assert_eq!(orders[1]["transaction_type"], json!("SELL"));
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let err = KiteRestGateway::new(KiteSettings {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            access_token: "token".to_string(),
            exchange: "NSE".to_string(),
            product: "CNC".to_string(),
            timeout: Duration::from_secs(1),
            read_retries: 0,
        })
        .expect_err("no key");
        assert!(err.contains("credentials"));
    }
}
