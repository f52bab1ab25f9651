//! Carrier webhook endpoint
//!
//! `POST /webhooks/carrier` always answers 2xx quickly; all heavy work is
//! dispatched into the owning call's event task by the router.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use outdial_dialer::route_webhook;
use outdial_telephony::WebhookEnvelope;

use crate::state::AppState;

/// POST /webhooks/carrier
pub async fn carrier_webhook(
    State(state): State<AppState>,
    body: Json<serde_json::Value>,
) -> StatusCode {
    match serde_json::from_value::<WebhookEnvelope>(body.0.clone()) {
        Ok(envelope) => {
            tracing::debug!(
                event_type = %envelope.data.event_type,
                call_id = %envelope.data.payload.call_control_id,
                "Carrier webhook"
            );
            route_webhook(&state.services, envelope.data);
        }
        Err(e) => {
            // Malformed or unknown event shapes are acknowledged anyway;
            // the carrier retries on non-2xx and that never helps here
            tracing::warn!("Undecodable carrier webhook: {}", e);
        }
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use outdial_telephony::WebhookEnvelope;

    #[test]
    fn test_envelope_decodes_from_carrier_shape() {
        let body = serde_json::json!({
            "data": {
                "event_type": "call.answered",
                "payload": {"call_control_id": "cc-1"}
            }
        });
        let envelope: WebhookEnvelope = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.data.event_type, "call.answered");
    }
}
