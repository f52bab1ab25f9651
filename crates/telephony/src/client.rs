//! Carrier call-control client
//!
//! Thin wrapper over the provider's REST API. All methods are stateless
//! apart from the purchased-number cache; per-call state lives with the
//! dispatcher worker that owns the call.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use outdial_config::CarrierConfig;
use outdial_core::phone::normalize_phone;

use crate::{CarrierError, ClientState};

const NUMBER_CACHE_TTL: Duration = Duration::from_secs(300);

/// Result of a successful origination
#[derive(Debug, Clone)]
pub struct CreatedCall {
    pub call_id: String,
}

#[derive(Debug, Serialize)]
struct CreateCallRequest<'a> {
    connection_id: &'a str,
    to: &'a str,
    from: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    answering_machine_detection: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateCallResponse {
    data: CreateCallData,
}

#[derive(Debug, Deserialize)]
struct CreateCallData {
    call_control_id: String,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    to: &'a str,
    from: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamingStartRequest<'a> {
    stream_url: &'a str,
    stream_track: &'a str,
    stream_bidirectional_mode: &'a str,
    stream_bidirectional_codec: &'a str,
}

#[derive(Debug, Serialize)]
struct SpeakRequest<'a> {
    payload: &'a str,
    voice: &'a str,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Deserialize)]
struct NumbersResponse {
    data: Vec<NumberEntry>,
}

#[derive(Debug, Deserialize)]
struct NumberEntry {
    phone_number: String,
}

/// Call-control REST client
pub struct CarrierClient {
    http: Client,
    config: CarrierConfig,
    number_cache: RwLock<Option<(Instant, Vec<String>)>>,
}

impl CarrierClient {
    pub fn new(config: CarrierConfig) -> Result<Self, CarrierError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            config,
            number_cache: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint, path)
    }

    fn action_url(&self, call_id: &str, action: &str) -> String {
        self.url(&format!("/calls/{}/actions/{}", call_id, action))
    }

    /// Originate an outbound call.
    ///
    /// `client_state` is echoed by the carrier on every webhook for this
    /// call; it carries the lead snapshot and the DID used.
    pub async fn create_call(
        &self,
        to: &str,
        from: &str,
        client_state: &ClientState,
    ) -> Result<CreatedCall, CarrierError> {
        let to = normalize_phone(to);
        let from = normalize_phone(from);
        let request = CreateCallRequest {
            connection_id: &self.config.connection_id,
            to: &to,
            from: &from,
            client_state: Some(client_state.encode()),
            answering_machine_detection: Some("detect"),
        };

        let response = self
            .http
            .post(self.url("/calls"))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let body: CreateCallResponse = response
            .json()
            .await
            .map_err(|e| CarrierError::InvalidResponse(e.to_string()))?;

        tracing::info!(
            call_id = %body.data.call_control_id,
            to = %to,
            from = %from,
            "Call originated"
        );

        Ok(CreatedCall {
            call_id: body.data.call_control_id,
        })
    }

    /// Answer an inbound leg. Already-ended calls are not an error.
    pub async fn answer(&self, call_id: &str) -> Result<(), CarrierError> {
        self.simple_action(call_id, "answer", serde_json::json!({}))
            .await
            .or_else(ignore_call_ended)
    }

    /// Hang up the call. Already-ended calls are not an error.
    pub async fn hangup(&self, call_id: &str) -> Result<(), CarrierError> {
        self.simple_action(call_id, "hangup", serde_json::json!({}))
            .await
            .or_else(ignore_call_ended)
    }

    /// Ask the carrier to open a duplex media WebSocket to `ws_url`
    /// carrying mu-law 8 kHz both directions. Fails gracefully when the
    /// call has already ended.
    pub async fn start_bidirectional_stream(
        &self,
        call_id: &str,
        ws_url: &str,
    ) -> Result<(), CarrierError> {
        let request = StreamingStartRequest {
            stream_url: ws_url,
            stream_track: "inbound_track",
            stream_bidirectional_mode: "rtp",
            stream_bidirectional_codec: "PCMU",
        };
        self.simple_action(call_id, "streaming_start", serde_json::to_value(request)?)
            .await
            .or_else(ignore_call_ended)
    }

    /// Blind-transfer the call.
    ///
    /// `UnverifiedNumber` and `CallEnded` are surfaced for the caller to
    /// treat as "transfer not performed".
    pub async fn transfer(&self, call_id: &str, to: &str, from: &str) -> Result<(), CarrierError> {
        let to = normalize_phone(to);
        let from = normalize_phone(from);
        let request = TransferRequest {
            to: &to,
            from: &from,
        };
        let result = self
            .simple_action(call_id, "transfer", serde_json::to_value(request)?)
            .await;
        if result.is_ok() {
            tracing::info!(call_id = %call_id, to = %to, "Call transferred");
        }
        result
    }

    /// Speak a prompt through the provider's own TTS. Not used on the
    /// streaming path; retained for ring-back prompts before the media
    /// socket is up.
    pub async fn speak(&self, call_id: &str, text: &str, voice: &str) -> Result<(), CarrierError> {
        let request = SpeakRequest {
            payload: text,
            voice,
            language: "en-US",
        };
        self.simple_action(call_id, "speak", serde_json::to_value(request)?)
            .await
            .or_else(ignore_call_ended)
    }

    /// List the account's purchased numbers, cached for five minutes.
    pub async fn list_purchased_numbers(&self) -> Result<Vec<String>, CarrierError> {
        if let Some((fetched, numbers)) = self.number_cache.read().as_ref() {
            if fetched.elapsed() < NUMBER_CACHE_TTL {
                return Ok(numbers.clone());
            }
        }

        let response = self
            .http
            .get(self.url("/phone_numbers"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let body: NumbersResponse = response
            .json()
            .await
            .map_err(|e| CarrierError::InvalidResponse(e.to_string()))?;
        let numbers: Vec<String> = body
            .data
            .into_iter()
            .map(|n| normalize_phone(&n.phone_number))
            .collect();

        *self.number_cache.write() = Some((Instant::now(), numbers.clone()));
        Ok(numbers)
    }

    async fn simple_action(
        &self,
        call_id: &str,
        action: &str,
        body: serde_json::Value,
    ) -> Result<(), CarrierError> {
        let response = self
            .http
            .post(self.action_url(call_id, action))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify_failure(response).await)
        }
    }

    /// Map a non-2xx carrier response onto the error taxonomy.
    async fn classify_failure(response: reqwest::Response) -> CarrierError {
        let status = response.status();
        let body: ApiErrorBody = response.json().await.unwrap_or(ApiErrorBody { errors: vec![] });
        let first = body.errors.into_iter().next().unwrap_or(ApiError {
            code: String::new(),
            title: String::new(),
            detail: String::new(),
        });

        let haystack = format!("{} {} {}", first.code, first.title, first.detail).to_lowercase();

        if haystack.contains("channel_limit") || haystack.contains("channel limit") {
            return CarrierError::ChannelLimit;
        }
        if haystack.contains("unverified") {
            return CarrierError::UnverifiedNumber(first.detail);
        }
        if haystack.contains("invalid") && haystack.contains("number") {
            return CarrierError::InvalidNumber(first.detail);
        }
        if status == StatusCode::NOT_FOUND
            || haystack.contains("call has already ended")
            || haystack.contains("call_has_already_ended")
        {
            return CarrierError::CallEnded;
        }

        CarrierError::Rejected {
            code: if first.code.is_empty() {
                status.as_u16().to_string()
            } else {
                first.code
            },
            detail: if first.detail.is_empty() {
                first.title
            } else {
                first.detail
            },
        }
    }
}

fn ignore_call_ended(err: CarrierError) -> Result<(), CarrierError> {
    match err {
        CarrierError::CallEnded => Ok(()),
        other => Err(other),
    }
}

impl From<serde_json::Error> for CarrierError {
    fn from(e: serde_json::Error) -> Self {
        CarrierError::InvalidResponse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_call_ended() {
        assert!(ignore_call_ended(CarrierError::CallEnded).is_ok());
        assert!(ignore_call_ended(CarrierError::ChannelLimit).is_err());
    }

    #[test]
    fn test_create_call_request_shape() {
        let state = ClientState::for_dial(
            uuid::Uuid::new_v4(),
            "Terry Hodges",
            "+15307748286",
            "+16592389182",
        );
        let request = CreateCallRequest {
            connection_id: "conn-1",
            to: "+15307748286",
            from: "+16592389182",
            client_state: Some(state.encode()),
            answering_machine_detection: Some("detect"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["connection_id"], "conn-1");
        assert_eq!(json["answering_machine_detection"], "detect");
        assert!(json["client_state"].is_string());
    }

    #[test]
    fn test_error_body_decoding() {
        let body: ApiErrorBody = serde_json::from_value(serde_json::json!({
            "errors": [{"code": "90010", "title": "Channel limit exceeded",
                        "detail": "The account channel_limit_exceeded"}]
        }))
        .unwrap();
        assert_eq!(body.errors.len(), 1);
        assert_eq!(body.errors[0].code, "90010");
    }
}
