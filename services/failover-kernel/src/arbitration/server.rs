use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{info, warn};

use super::{ArbitrationResponse, ArbitrationStore, HeartbeatRecord, HeartbeatResponse, Verdict};
use crate::telemetry::failover::{record_arbitration_verdict, ArbitrationVerdict};

type SharedStore = Arc<dyn ArbitrationStore>;

#[derive(Debug, Deserialize)]
struct ForgetRequest {
    secret: String,
}

/// HTTP surface of the arbitrator. Paths are served with and without the
/// trailing slash; `/abritrator/` is the spelling deployed monitors use.
pub fn router(store: SharedStore) -> Router {
    Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/heartbeat/", post(heartbeat))
        .route("/abritrator", post(arbitrate))
        .route("/abritrator/", post(arbitrate))
        .route("/arbitrator", post(arbitrate))
        .route("/arbitrator/", post(arbitrate))
        .route("/forget", post(forget))
        .route("/forget/", post(forget))
        .with_state(store)
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|error| {
        (StatusCode::UNPROCESSABLE_ENTITY, error.to_string()).into_response()
    })
}

/// Decodes a monitor request, refusing bodies that carry no identity.
fn decode_record(body: &Bytes) -> Result<HeartbeatRecord, Response> {
    let record: HeartbeatRecord = decode(body)?;
    record
        .validate()
        .map_err(|reason| (StatusCode::UNPROCESSABLE_ENTITY, reason).into_response())?;
    Ok(record)
}

async fn heartbeat(State(store): State<SharedStore>, body: Bytes) -> Response {
    let record = match decode_record(&body) {
        Ok(record) => record,
        Err(response) => return response,
    };
    match store.write_heartbeat(&record).await {
        Ok(()) => (
            StatusCode::OK,
            Json(HeartbeatResponse {
                heartbeat: "succeed".into(),
            }),
        )
            .into_response(),
        Err(error) => {
            warn!(%error, cluster = %record.cluster, "failed to store heartbeat");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(HeartbeatResponse {
                    heartbeat: "failed".into(),
                }),
            )
                .into_response()
        }
    }
}

async fn arbitrate(State(store): State<SharedStore>, body: Bytes) -> Response {
    let record = match decode_record(&body) {
        Ok(record) => record,
        Err(response) => return response,
    };
    let verdict = match store.request_arbitration(&record).await {
        Ok(true) => Verdict::Winner,
        Ok(false) => Verdict::Loser,
        Err(error) => {
            warn!(%error, cluster = %record.cluster, "arbitration store failed, answering looser");
            record_arbitration_verdict(&record.cluster, ArbitrationVerdict::Error);
            Verdict::Loser
        }
    };
    let master = store
        .elected_master(&record.secret, &record.cluster)
        .await
        .ok()
        .flatten()
        .unwrap_or_default();
    info!(
        cluster = %record.cluster,
        uid = record.uid,
        ?verdict,
        %master,
        "arbitration requested"
    );
    (
        StatusCode::CREATED,
        Json(ArbitrationResponse {
            arbitration: verdict,
            master,
        }),
    )
        .into_response()
}

async fn forget(State(store): State<SharedStore>, body: Bytes) -> Response {
    let request: ForgetRequest = match decode(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    match store.forget(&request.secret).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) => {
            warn!(%error, "failed to forget arbitration rows");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
