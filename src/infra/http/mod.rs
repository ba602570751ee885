//! HTTP surface of the farm: the inbound instruction route and the outbound
//! transport.

mod transport;

pub use transport::{HttpTransport, instructions_endpoint};

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tracing::debug;

use crate::cache::messenger::{MessageEnvelope, ReceiveOutcome, ServerMessenger};

pub const INSTRUCTIONS_PATH: &str = "/cache/instructions";

#[derive(Clone)]
pub struct FarmState {
    pub messenger: Arc<ServerMessenger>,
}

/// Router exposing `POST /cache/instructions`.
pub fn build_router(messenger: Arc<ServerMessenger>) -> Router {
    Router::new()
        .route(INSTRUCTIONS_PATH, post(receive_instructions))
        .with_state(FarmState { messenger })
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ReceiveBody {
    Processed {
        applied: usize,
        ignored: usize,
        rejected: usize,
    },
    FromSelf,
    Duplicate,
}

impl From<ReceiveOutcome> for ReceiveBody {
    fn from(outcome: ReceiveOutcome) -> Self {
        match outcome {
            ReceiveOutcome::Processed {
                applied,
                ignored,
                rejected,
            } => Self::Processed {
                applied,
                ignored,
                rejected,
            },
            ReceiveOutcome::FromSelf => Self::FromSelf,
            ReceiveOutcome::Duplicate => Self::Duplicate,
        }
    }
}

async fn receive_instructions(
    State(state): State<FarmState>,
    Json(envelope): Json<MessageEnvelope>,
) -> Response {
    debug!(
        envelope_id = %envelope.id,
        origin = %envelope.origin,
        messages = envelope.messages.len(),
        "Cache instructions received"
    );
    let outcome = state.messenger.receive(envelope).await;
    (StatusCode::ACCEPTED, Json(ReceiveBody::from(outcome))).into_response()
}
