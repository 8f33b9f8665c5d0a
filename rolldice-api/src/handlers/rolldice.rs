use std::collections::HashMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use common_kafka::{AckResult, CallContext};
use common_types::DiceRoll;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use super::app::AppState;

pub const DICE_ROLLS: &str = "dice_rolls_total";

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollDiceRequest {
    pub sides: i8,
    pub rolls: i8,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RollError {
    #[error("number of rolls must be >=1 and <=100")]
    Rolls,
    #[error("number of sides must be >=2 and <=100")]
    Sides,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

/// Rolls `sides`-sided dice `rolls` times and counts how often each face came up.
pub fn roll(sides: i8, rolls: i8) -> Result<HashMap<i8, i32>, RollError> {
    if !(1..=100).contains(&rolls) {
        return Err(RollError::Rolls);
    }
    if !(2..=100).contains(&sides) {
        return Err(RollError::Sides);
    }

    let mut rng = rand::thread_rng();
    let mut distribution = HashMap::new();
    for _ in 0..rolls {
        *distribution.entry(rng.gen_range(1..=sides)).or_insert(0) += 1;
    }
    Ok(distribution)
}

#[instrument(name = "rollDice", skip_all)]
pub async fn post_rolldice(
    State(state): State<AppState>,
    payload: Result<Json<RollDiceRequest>, JsonRejection>,
) -> Result<Json<DiceRoll>, HandlerError> {
    metrics::counter!(DICE_ROLLS).increment(1);

    let Json(request) = payload.map_err(|rejection| {
        error!("failed to decode roll request: {}", rejection);
        respond(StatusCode::BAD_REQUEST, "invalid request")
    })?;
    debug!(?request, "rolldice request");

    let distribution = roll(request.sides, request.rolls).map_err(|err| {
        error!("invalid input: {}", err);
        respond(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string())
    })?;
    let response = DiceRoll {
        rolls: request.rolls,
        sides: request.sides,
        distribution,
    };
    info!(?response, "rolldice response");

    let encoded = serde_json::to_vec(&response).map_err(|err| {
        error!("failed to encode roll: {}", err);
        respond(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    })?;

    let ctx = CallContext::default().with_timeout(state.publish_timeout);
    match state.publisher.publish(&ctx, Bytes::from(encoded)).await {
        Ok(AckResult::Success { .. }) => Ok(Json(response)),
        Ok(AckResult::Failure { error, .. }) => {
            error!("failed to publish roll to kafka: {}", error);
            Err(respond(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
        }
        Err(err) => {
            error!("gave up publishing roll to kafka: {}", err);
            Err(respond(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
        }
    }
}

fn respond(status: StatusCode, msg: &str) -> HandlerError {
    (
        status,
        Json(ErrorResponse {
            error: msg.to_owned(),
        }),
    )
}
