use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{FeedId, FeedValueData, FeedVolumeData};
use crate::provider::ValueProvider;

const DEFAULT_VOLUME_WINDOW_SEC: i64 = 60;

pub type SharedProvider = Arc<dyn ValueProvider>;

#[derive(Debug, Deserialize)]
pub struct FeedValuesRequest {
    pub feeds: Vec<FeedId>,
}

#[derive(Debug, Serialize)]
pub struct FeedValuesResponse {
    pub data: Vec<FeedValueData>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundFeedValuesResponse {
    pub voting_round_id: u32,
    pub data: Vec<FeedValueData>,
}

#[derive(Debug, Serialize)]
pub struct FeedVolumesResponse {
    pub data: Vec<FeedVolumeData>,
}

#[derive(Debug, Deserialize)]
struct VolumesQuery {
    window: Option<i64>,
}

pub fn router(provider: SharedProvider) -> Router {
    Router::new()
        .route("/feed-values/:voting_round_id", post(feed_values_for_round))
        .route("/feed-values", post(feed_values))
        .route("/volumes", post(feed_volumes))
        .with_state(provider)
}

async fn feed_values_for_round(
    State(provider): State<SharedProvider>,
    Path(voting_round_id): Path<u32>,
    Json(request): Json<FeedValuesRequest>,
) -> Json<RoundFeedValuesResponse> {
    let data = provider.get_values(request.feeds).await;
    info!(voting_round_id, feeds = data.len(), "feed values served");
    Json(RoundFeedValuesResponse {
        voting_round_id,
        data,
    })
}

async fn feed_values(
    State(provider): State<SharedProvider>,
    Json(request): Json<FeedValuesRequest>,
) -> Json<FeedValuesResponse> {
    let data = provider.get_values(request.feeds).await;
    info!(feeds = data.len(), "current feed values served");
    Json(FeedValuesResponse { data })
}

async fn feed_volumes(
    State(provider): State<SharedProvider>,
    Query(query): Query<VolumesQuery>,
    Json(request): Json<FeedValuesRequest>,
) -> Result<Json<FeedVolumesResponse>, (StatusCode, String)> {
    let window_sec = query.window.unwrap_or(DEFAULT_VOLUME_WINDOW_SEC);
    match provider.get_volumes(request.feeds, window_sec).await {
        Ok(data) => {
            info!(window_sec, feeds = data.len(), "feed volumes served");
            Ok(Json(FeedVolumesResponse { data }))
        }
        Err(report) => Err((StatusCode::BAD_REQUEST, report.to_string())),
    }
}
