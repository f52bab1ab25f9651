//! Carrier adapter
//!
//! A stateless facade over the telephony provider's call-control REST API,
//! plus the webhook event model and the opaque client-state blob attached
//! to originations and echoed back on every webhook.

mod client;
mod client_state;
mod error;
mod events;

pub use client::{CarrierClient, CreatedCall};
pub use client_state::ClientState;
pub use error::CarrierError;
pub use events::{
    event_types, MachineDetectionResult, TranscriptionData, WebhookEnvelope, WebhookEvent,
    WebhookPayload,
};

use async_trait::async_trait;

/// Carrier call-control operations.
///
/// [`CarrierClient`] is the production implementation; tests substitute a
/// scripted fake so call flows run without a live carrier.
#[async_trait]
pub trait CarrierApi: Send + Sync {
    async fn create_call(
        &self,
        to: &str,
        from: &str,
        client_state: &ClientState,
    ) -> Result<CreatedCall, CarrierError>;

    async fn answer(&self, call_id: &str) -> Result<(), CarrierError>;

    async fn hangup(&self, call_id: &str) -> Result<(), CarrierError>;

    async fn start_bidirectional_stream(
        &self,
        call_id: &str,
        ws_url: &str,
    ) -> Result<(), CarrierError>;

    async fn transfer(&self, call_id: &str, to: &str, from: &str) -> Result<(), CarrierError>;

    async fn speak(&self, call_id: &str, text: &str, voice: &str) -> Result<(), CarrierError>;

    async fn list_purchased_numbers(&self) -> Result<Vec<String>, CarrierError>;
}

#[async_trait]
impl CarrierApi for CarrierClient {
    async fn create_call(
        &self,
        to: &str,
        from: &str,
        client_state: &ClientState,
    ) -> Result<CreatedCall, CarrierError> {
        CarrierClient::create_call(self, to, from, client_state).await
    }

    async fn answer(&self, call_id: &str) -> Result<(), CarrierError> {
        CarrierClient::answer(self, call_id).await
    }

    async fn hangup(&self, call_id: &str) -> Result<(), CarrierError> {
        CarrierClient::hangup(self, call_id).await
    }

    async fn start_bidirectional_stream(
        &self,
        call_id: &str,
        ws_url: &str,
    ) -> Result<(), CarrierError> {
        CarrierClient::start_bidirectional_stream(self, call_id, ws_url).await
    }

    async fn transfer(&self, call_id: &str, to: &str, from: &str) -> Result<(), CarrierError> {
        CarrierClient::transfer(self, call_id, to, from).await
    }

    async fn speak(&self, call_id: &str, text: &str, voice: &str) -> Result<(), CarrierError> {
        CarrierClient::speak(self, call_id, text, voice).await
    }

    async fn list_purchased_numbers(&self) -> Result<Vec<String>, CarrierError> {
        CarrierClient::list_purchased_numbers(self).await
    }
}
