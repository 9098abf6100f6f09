//! Bucket administration: change a client's refill rate or capacity.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::http::response::{messages, ApiResponse};
use crate::http::server::AppState;
use crate::rate_limit::{LimiterError, TokenBucketLimiter};
use crate::security::normalize_key;

/// `?ip=<client key or address>&value=<integer>`
#[derive(Debug, Default, Deserialize)]
pub struct BucketParams {
    pub ip: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Setting {
    Rate,
    MaxTokens,
}

impl Setting {
    fn field(self) -> &'static str {
        match self {
            Setting::Rate => "rate",
            Setting::MaxTokens => "max_tokens",
        }
    }

    fn failed(self) -> &'static str {
        match self {
            Setting::Rate => messages::SET_RATE_FAILED,
            Setting::MaxTokens => messages::SET_MAX_FAILED,
        }
    }

    fn updated(self) -> &'static str {
        match self {
            Setting::Rate => messages::RATE_UPDATED,
            Setting::MaxTokens => messages::MAX_UPDATED,
        }
    }

    async fn apply(self, limiter: &TokenBucketLimiter, key: &str, value: i64) -> Result<(), LimiterError> {
        match self {
            Setting::Rate => limiter.set_rate(key, value).await,
            Setting::MaxTokens => limiter.set_max_tokens(key, value).await,
        }
    }
}

pub async fn set_rate(State(state): State<AppState>, Query(params): Query<BucketParams>) -> Response {
    update(&state, params, Setting::Rate).await
}

pub async fn set_max(State(state): State<AppState>, Query(params): Query<BucketParams>) -> Response {
    update(&state, params, Setting::MaxTokens).await
}

async fn update(state: &AppState, params: BucketParams, setting: Setting) -> Response {
    let (Some(ip), Some(value)) = (params.ip.filter(|s| !s.trim().is_empty()), params.value) else {
        return ApiResponse::error(StatusCode::BAD_REQUEST, messages::MISSING_IP_OR_VALUE).into_response();
    };
    let Ok(value) = value.trim().parse::<i64>() else {
        return ApiResponse::error(StatusCode::BAD_REQUEST, messages::BAD_VALUE).into_response();
    };

    let key = normalize_key(&ip, state.salt());
    let Some(limiter) = state.limiter() else {
        return ApiResponse::error(StatusCode::NOT_FOUND, messages::UNKNOWN_CLIENT).into_response();
    };

    match setting.apply(limiter, &key, value).await {
        Ok(()) => {
            let mut data = serde_json::Map::new();
            data.insert("ip".to_string(), key.into());
            data.insert(setting.field().to_string(), value.into());
            ApiResponse::ok(setting.updated())
                .with_data(data.into())
                .into_response()
        }
        Err(LimiterError::InvalidValue { .. }) => {
            ApiResponse::error(StatusCode::BAD_REQUEST, messages::BAD_VALUE).into_response()
        }
        Err(LimiterError::NotFound(_)) => {
            tracing::info!(client = %key, setting = setting.field(), "Admin update for unknown client");
            ApiResponse::error(StatusCode::NOT_FOUND, messages::UNKNOWN_CLIENT).into_response()
        }
        Err(e) => {
            tracing::error!(client = %key, setting = setting.field(), error = %e, "Admin update failed");
            ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, setting.failed()).into_response()
        }
    }
}
