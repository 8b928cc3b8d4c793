//! Client of the SmartPark backend.
//!
//! Slot status changes are reported as events, either right away or buffered and sent in bulk.
//! Every request goes through one retry loop which also renews the access token when the backend
//! answers 401 and credentials are configured.
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT},
    Client, Method,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::watch;

use crate::{
    config::ApiConfig,
    detector::{Detections, Ema, SlotStatus},
    unix_now,
};

/// Backend ids of the vehicle types.
pub fn vehicle_type_id(vehicle_type: &str) -> Option<u32> {
    match vehicle_type {
        "car" => Some(1),
        "truck" => Some(2),
        "bus" => Some(3),
        "motorcycle" => Some(4),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotStatusEvent {
    pub slot_id: i64,
    pub status: SlotStatus,
    /// Formatted with three decimals.
    pub confidence: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_type_id: Option<u32>,
}

impl SlotStatusEvent {
    pub fn new(
        slot_id: i64,
        status: SlotStatus,
        confidence: f32,
        vehicle_type_id: Option<u32>,
    ) -> Self {
        Self {
            slot_id,
            status,
            confidence: format!("{confidence:.3}"),
            vehicle_type_id,
        }
    }
}

/// Outcome of a backend request. Failures are values here, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    /// HTTP status, 0 if no response was received.
    pub status_code: u16,
    pub data: Value,
    pub error_message: Option<String>,
    /// Seconds until the response arrived.
    pub response_time: f64,
}

impl ApiResponse {
    /// A successful response which never touched the network.
    fn synthetic(message: &str) -> Self {
        Self {
            success: true,
            status_code: 200,
            data: json!({ "message": message }),
            error_message: None,
            response_time: 0.0,
        }
    }

    fn failure(status_code: u16, data: Value, message: String, response_time: f64) -> Self {
        Self {
            success: false,
            status_code,
            data,
            error_message: Some(message),
            response_time,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Connected,
    Error,
}

#[derive(Debug, Default)]
struct RequestStats {
    total: u64,
    successful: u64,
    failed: u64,
    response_time: Ema,
    last_error: Option<String>,
}

impl RequestStats {
    fn record(&mut self, success: bool, response_time: f64, error: Option<String>) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
            self.last_error = error;
        }
        self.response_time.update(response_time);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub last_error: Option<String>,
    pub connection_status: ConnectionStatus,
    pub last_heartbeat: Option<f64>,
    pub buffer_size: usize,
    pub hardware_code: String,
    pub base_url: String,
}

/// Runtime changes of the client settings. Unset fields stay as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfigUpdate {
    pub api_key: Option<String>,
    pub hardware_code: Option<String>,
    pub lot_id: Option<String>,
    pub timeout_secs: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone)]
struct Session {
    access: String,
    refresh: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: String,
    refresh: Option<String>,
}

pub struct ApiClient {
    config: ApiConfig,
    client: Client,
    session: Option<Session>,
    event_buffer: Vec<SlotStatusEvent>,
    last_flush: Instant,
    last_heartbeat: Option<f64>,
    connection_status: ConnectionStatus,
    stats: RequestStats,
    /// Latest statistics, readable while a request is in flight.
    stats_tx: watch::Sender<ApiStats>,
}

fn build_client(config: &ApiConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("SmartPark-Camera/{}", config.hardware_code))
            .context("invalid hardware code")?,
    );
    if !config.api_key.is_empty() {
        headers.insert(
            "X-API-Key",
            HeaderValue::from_str(&config.api_key).context("invalid API key")?,
        );
    }

    let client = Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    Ok(client)
}

/// Pull a readable message out of an error body.
fn error_message(body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        match map.get("error") {
            Some(Value::String(message)) => return message.clone(),
            Some(other) => return other.to_string(),
            None => (),
        }
    }

    // ASCII lowercasing keeps the byte offsets of `body`
    let lowercase = body.to_ascii_lowercase();
    if let (Some(start), Some(end)) = (lowercase.find("<title>"), lowercase.find("</title>")) {
        let start = start + "<title>".len();
        if let Some(title) = body.get(start..end) {
            return title.trim().to_owned();
        }
    }

    "HTTP Error".to_owned()
}

fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_owned()))
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = build_client(&config)?;
        log::info!(
            "API client for {} initialized as {}",
            config.base_url,
            config.hardware_code
        );

        let (stats_tx, _) = watch::channel(ApiStats::default());
        let api = Self {
            config,
            client,
            session: None,
            event_buffer: vec![],
            last_flush: Instant::now(),
            last_heartbeat: None,
            connection_status: ConnectionStatus::Unknown,
            stats: RequestStats::default(),
            stats_tx,
        };
        api.publish_stats();

        Ok(api)
    }

    /// Receiver of the statistics, updated after every request.
    pub fn subscribe_stats(&self) -> watch::Receiver<ApiStats> {
        self.stats_tx.subscribe()
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.statistics());
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    fn has_credentials(&self) -> bool {
        self.config.username.is_some() && self.config.password.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection_status
    }

    pub fn buffered_events(&self) -> usize {
        self.event_buffer.len()
    }

    /// One request against an auth endpoint, outside of the retry loop.
    async fn request_tokens(&self, endpoint: &str, body: Value) -> Result<TokenResponse> {
        let resp = self
            .client
            .post(self.url(endpoint))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("HTTP {}: {}", status.as_u16(), error_message(&text));
        }

        Ok(serde_json::from_str(&text)?)
    }

    /// Obtain access and refresh tokens with the configured credentials.
    pub async fn login(&mut self) -> Result<()> {
        let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        else {
            bail!("no credentials configured");
        };

        let body = json!({ "username": username, "password": password });
        let tokens = self
            .request_tokens(&self.config.endpoints.login, body)
            .await
            .context("login failed")?;

        self.session = Some(Session {
            access: tokens.access,
            refresh: tokens.refresh.unwrap_or_default(),
        });
        log::info!("Logged in to {}", self.config.base_url);

        Ok(())
    }

    /// Renew the access token, logging in again if the refresh token is not accepted.
    pub async fn refresh_session(&mut self) -> Result<()> {
        if let Some(session) = self.session.clone() {
            let body = json!({ "refresh": session.refresh });
            match self
                .request_tokens(&self.config.endpoints.refresh, body)
                .await
            {
                Ok(tokens) => {
                    self.session = Some(Session {
                        access: tokens.access,
                        refresh: tokens.refresh.unwrap_or(session.refresh),
                    });
                    log::debug!("Access token refreshed");
                    return Ok(());
                }
                Err(e) => log::warn!("Token refresh failed, logging in again: {e}"),
            }
        }

        self.session = None;
        self.login().await
    }

    async fn make_request(
        &mut self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> ApiResponse {
        let response = self.request_with_retries(method, endpoint, body).await;
        self.publish_stats();
        response
    }

    async fn request_with_retries(
        &mut self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> ApiResponse {
        let url = self.url(endpoint);

        if self.session.is_none() && self.has_credentials() {
            if let Err(e) = self.login().await {
                log::warn!("{e:#}");
            }
        }

        let attempts = self.config.retry_attempts.max(1);
        let mut refreshed = false;
        let mut last_error = String::new();
        let mut attempt = 0;

        while attempt < attempts {
            let start = Instant::now();

            let mut request = self.client.request(method.clone(), &url);
            if let Some(session) = &self.session {
                request = request.bearer_auth(&session.access);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    let response_time = start.elapsed().as_secs_f64();

                    if (200..300).contains(&status) {
                        self.stats.record(true, response_time, None);
                        log::debug!("{method} {url}: {status} in {response_time:.3}s");
                        return ApiResponse {
                            success: true,
                            status_code: status,
                            data: parse_body(&text),
                            error_message: None,
                            response_time,
                        };
                    }

                    let message = error_message(&text);
                    self.stats
                        .record(false, response_time, Some(format!("HTTP {status}: {message}")));

                    if status == 401 && !refreshed && self.has_credentials() {
                        refreshed = true;
                        match self.refresh_session().await {
                            // Retry with the new token without using up an attempt
                            Ok(()) => continue,
                            Err(e) => log::warn!("Could not renew session: {e:#}"),
                        }
                    }

                    if status < 500 {
                        if status != 401 {
                            log::warn!("{method} {url} failed with {status}: {message}");
                        }
                        return ApiResponse::failure(
                            status,
                            parse_body(&text),
                            message,
                            response_time,
                        );
                    }

                    last_error = format!("HTTP {status}: {message}");
                }
                Err(e) => {
                    let response_time = start.elapsed().as_secs_f64();
                    self.stats
                        .record(false, response_time, Some(e.to_string()));
                    last_error = e.to_string();
                }
            }

            log::warn!(
                "{method} {url} attempt {}/{attempts} failed: {last_error}",
                attempt + 1
            );
            attempt += 1;
            if attempt < attempts {
                let delay = self.config.retry_delay_secs.max(0.0) * attempt as f64;
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        log::error!("{method} {url} failed after {attempts} attempts");
        ApiResponse::failure(
            0,
            Value::Null,
            format!("failed after {attempts} attempts: {last_error}"),
            0.0,
        )
    }

    /// Report a slot status, right away or through the event buffer.
    pub async fn send_slot_status_event(
        &mut self,
        slot_id: i64,
        status: SlotStatus,
        confidence: f32,
        vehicle_type_id: Option<u32>,
        immediate: bool,
    ) -> ApiResponse {
        let event = SlotStatusEvent::new(slot_id, status, confidence, vehicle_type_id);

        if immediate {
            let body = json!(event);
            let endpoint = self.config.endpoints.slot_status.clone();
            let response = self.make_request(Method::POST, &endpoint, Some(&body)).await;
            if response.success {
                log::info!("Slot {slot_id} reported as {status}");
            }
            return response;
        }

        self.event_buffer.push(event);
        let flush_interval = Duration::from_secs(self.config.flush_interval_secs);
        if self.event_buffer.len() >= self.config.batch_size
            || self.last_flush.elapsed() >= flush_interval
        {
            return self.flush_event_buffer().await;
        }

        self.publish_stats();
        ApiResponse::synthetic("Event buffered")
    }

    pub async fn send_bulk_status_events(&mut self, events: Vec<SlotStatusEvent>) -> ApiResponse {
        if events.is_empty() {
            return ApiResponse::synthetic("No events to send");
        }

        let count = events.len();
        let body = json!({
            "hardware_code": self.config.hardware_code,
            "lot_id": self.config.lot_id,
            "events": events,
        });
        let endpoint = self.config.endpoints.slot_status.clone();
        let response = self.make_request(Method::POST, &endpoint, Some(&body)).await;
        if response.success {
            log::info!("Sent {count} buffered slot events");
        }

        response
    }

    /// Send and drain the event buffer.
    pub async fn flush_event_buffer(&mut self) -> ApiResponse {
        if self.event_buffer.is_empty() {
            return ApiResponse::synthetic("No events to flush");
        }

        let events = std::mem::take(&mut self.event_buffer);
        self.last_flush = Instant::now();
        self.send_bulk_status_events(events).await
    }

    pub async fn send_heartbeat(&mut self, extra: Map<String, Value>) -> ApiResponse {
        let mut body = Map::new();
        body.insert("hardware_code".into(), json!(self.config.hardware_code));
        body.insert("lot_id".into(), json!(self.config.lot_id));
        body.insert("timestamp".into(), json!(unix_now()));
        body.extend(extra);

        let endpoint = self.config.endpoints.heartbeat.clone();
        let response = self
            .make_request(Method::POST, &endpoint, Some(&Value::Object(body)))
            .await;
        if response.success {
            self.last_heartbeat = Some(unix_now());
            self.publish_stats();
            log::debug!("Heartbeat sent");
        }

        response
    }

    pub async fn test_connection(&mut self) -> ApiResponse {
        let endpoint = self.config.endpoints.health_check.clone();
        let response = self.make_request(Method::GET, &endpoint, None).await;

        self.connection_status = if response.success {
            log::info!("Backend {} reachable", self.config.base_url);
            ConnectionStatus::Connected
        } else {
            log::warn!(
                "Backend {} not reachable: {}",
                self.config.base_url,
                response.error_message.as_deref().unwrap_or("unknown error")
            );
            ConnectionStatus::Error
        };
        self.publish_stats();

        response
    }

    /// Queue the decided zones of a frame. Unmapped zones and unknown states are skipped.
    pub async fn send_detection_results(
        &mut self,
        results: &Detections,
        zone_mapping: &HashMap<String, i64>,
    ) -> Vec<ApiResponse> {
        let mut responses = vec![];
        for (code, result) in results {
            if result.status == SlotStatus::Unknown {
                continue;
            }
            let Some(slot_id) = zone_mapping.get(code) else {
                log::debug!("Zone {code} has no slot mapping");
                continue;
            };

            let vehicle_type = result.vehicle_type().and_then(vehicle_type_id);
            responses.push(
                self.send_slot_status_event(
                    *slot_id,
                    result.status,
                    result.confidence,
                    vehicle_type,
                    false,
                )
                .await,
            );
        }

        responses
    }

    pub fn update_config(&mut self, update: ApiConfigUpdate) -> Result<()> {
        let mut config = self.config.clone();
        if let Some(api_key) = update.api_key {
            config.api_key = api_key;
        }
        if let Some(hardware_code) = update.hardware_code {
            config.hardware_code = hardware_code;
        }
        if let Some(lot_id) = update.lot_id {
            config.lot_id = lot_id;
        }
        if let Some(timeout_secs) = update.timeout_secs {
            config.timeout_secs = timeout_secs;
        }
        if let Some(retry_attempts) = update.retry_attempts {
            config.retry_attempts = retry_attempts;
        }
        if let Some(batch_size) = update.batch_size {
            config.batch_size = batch_size;
        }

        self.client = build_client(&config)?;
        self.config = config;
        self.publish_stats();
        log::info!("API client configuration updated");

        Ok(())
    }

    pub fn statistics(&self) -> ApiStats {
        let success_rate = match self.stats.total {
            0 => 0.0,
            total => self.stats.successful as f64 / total as f64 * 100.0,
        };

        ApiStats {
            total_requests: self.stats.total,
            successful_requests: self.stats.successful,
            failed_requests: self.stats.failed,
            success_rate,
            avg_response_time: self.stats.response_time.get(),
            last_error: self.stats.last_error.clone(),
            connection_status: self.connection_status,
            last_heartbeat: self.last_heartbeat,
            buffer_size: self.event_buffer.len(),
            hardware_code: self.config.hardware_code.clone(),
            base_url: self.config.base_url.clone(),
        }
    }

    /// Flush pending events.
    pub async fn close(&mut self) {
        if !self.event_buffer.is_empty() {
            let response = self.flush_event_buffer().await;
            if !response.success {
                log::warn!(
                    "Pending events lost on close: {}",
                    response.error_message.unwrap_or_default()
                );
            }
        }
        log::info!("API client closed");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_message() {
        assert_eq!(error_message(r#"{"error": "slot not found"}"#), "slot not found");
        assert_eq!(error_message(r#"{"error": {"code": 7}}"#), r#"{"code":7}"#);
        assert_eq!(
            error_message("<html><head><TITLE> Bad Gateway </TITLE></head></html>"),
            "Bad Gateway"
        );
        assert_eq!(error_message("İ<title>éé</title>"), "éé");
        assert_eq!(
            error_message("\u{212A}\u{212A}\u{212A}<title>Bad Gateway</title>"),
            "Bad Gateway"
        );
        assert_eq!(error_message("</title> Ünïcode <title>"), "HTTP Error");
        assert_eq!(error_message(r#"{"detail": "nope"}"#), "HTTP Error");
        assert_eq!(error_message(""), "HTTP Error");
    }

    #[test]
    fn test_event_payload() -> Result<()> {
        let event = SlotStatusEvent::new(3, SlotStatus::Occupied, 0.87654, Some(1));
        assert_eq!(
            serde_json::to_value(&event)?,
            json!({"slot_id": 3, "status": "OCCUPIED", "confidence": "0.877", "vehicle_type_id": 1})
        );

        let event = SlotStatusEvent::new(4, SlotStatus::Free, 0.9, None);
        assert_eq!(
            serde_json::to_value(&event)?,
            json!({"slot_id": 4, "status": "FREE", "confidence": "0.900"})
        );

        Ok(())
    }

    #[test]
    fn test_vehicle_type_ids() {
        assert_eq!(vehicle_type_id("car"), Some(1));
        assert_eq!(vehicle_type_id("motorcycle"), Some(4));
        assert_eq!(vehicle_type_id("bicycle"), None);
    }

    #[tokio::test]
    async fn test_buffering_without_network() -> Result<()> {
        let mut client = ApiClient::new(ApiConfig {
            batch_size: 5,
            ..Default::default()
        })?;

        let response = client
            .send_slot_status_event(1, SlotStatus::Free, 0.9, None, false)
            .await;
        assert!(response.success);
        assert_eq!(response.data["message"], "Event buffered");
        assert_eq!(client.buffered_events(), 1);

        let empty = client.send_bulk_status_events(vec![]).await;
        assert!(empty.success);

        let stats_rx = client.subscribe_stats();
        client
            .send_slot_status_event(2, SlotStatus::Occupied, 0.8, Some(1), false)
            .await;
        assert_eq!(stats_rx.borrow().buffer_size, 2);

        Ok(())
    }

    #[test]
    fn test_update_config() -> Result<()> {
        let mut client = ApiClient::new(ApiConfig::default())?;
        client.update_config(ApiConfigUpdate {
            hardware_code: Some("CAM-07".into()),
            batch_size: Some(2),
            ..Default::default()
        })?;

        let stats = client.statistics();
        assert_eq!(stats.hardware_code, "CAM-07");
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.success_rate, 0.0);

        Ok(())
    }
}
