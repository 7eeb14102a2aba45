//! `GET /metrics` Prometheus scrape endpoint (SPEC_FULL §9.5).

use crate::state::AppState;
use axum::extract::State;

pub async fn scrape(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}
