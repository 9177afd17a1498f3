// SPDX-License-Identifier: MIT
//! HTTP surface of the dice service.
//!
//! Two routes, `/rolldice` and `/rolldice/{player}`, both answering with a
//! single roll of a six-sided die. Every roll increments the `dice.rolls`
//! counter tagged with the rolled value, and the whole router is wrapped in a
//! request-tracing layer so each request gets a span.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::Router;
use opentelemetry::metrics::Counter;
use opentelemetry::{global, KeyValue};
use rand::Rng;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
struct AppState {
    rolls: Counter<u64>,
}

/// Builds the service router. Reads the globally registered meter provider,
/// so call this after telemetry init to get real metrics.
pub fn router() -> Router {
    let meter = global::meter("dice");
    let rolls = meter
        .u64_counter("dice.rolls")
        .with_description("The number of rolls by roll value.")
        .with_unit("{roll}")
        .build();

    Router::new()
        .route("/rolldice", get(roll_anonymous))
        .route("/rolldice/{player}", get(roll_for_player))
        .with_state(AppState { rolls })
        .layer(TraceLayer::new_for_http())
}

async fn roll_anonymous(State(state): State<AppState>) -> String {
    roll(&state, None)
}

async fn roll_for_player(State(state): State<AppState>, Path(player): Path<String>) -> String {
    roll(&state, Some(player))
}

#[tracing::instrument(name = "roll", skip(state))]
fn roll(state: &AppState, player: Option<String>) -> String {
    let rolled: i64 = rand::rng().random_range(1..=6);
    state
        .rolls
        .add(1, &[KeyValue::new("roll.value", rolled)]);
    match player.as_deref() {
        Some(player) => info!(result = rolled, player, "player is rolling the dice"),
        None => info!(result = rolled, "anonymous player is rolling the dice"),
    }
    format!("{rolled}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn rolldice_returns_a_value_between_one_and_six() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/rolldice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: u8 = std::str::from_utf8(&body).unwrap().trim().parse().unwrap();
        assert!((1..=6).contains(&value));
    }

    #[tokio::test]
    async fn rolldice_accepts_a_player_name() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/rolldice/alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/rollcoin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
