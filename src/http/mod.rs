// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP surface: config fetch and long-poll notifications.
//!
//! Two read endpoints only; mutations go through [`crate::engine`] in the
//! embedding process.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;
use crate::hub::{ClientNotification, PollOutcome, PollRequest};
use crate::resolver::{ConfigRequest, ResolveOutcome};
use crate::service::ConfigRelay;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<ConfigRelay>,
}

pub fn router(relay: Arc<ConfigRelay>) -> Router {
    Router::new()
        .route("/configs/{app_id}/{cluster}/{namespace}", get(get_config))
        .route("/notifications/v2", get(poll_notifications))
        .with_state(AppState { relay })
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(e: crate::store::StoreError) -> Self {
        ApiError(Error::Store(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            Error::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            Error::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, message).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigQuery {
    #[serde(default)]
    data_center: Option<String>,
    #[serde(default)]
    release_key: String,
    #[serde(default)]
    ip: Option<String>,
    /// JSON object of watch key -> notification id, as handed out by the
    /// notification endpoint.
    #[serde(default)]
    messages: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    app_id: String,
    cluster: String,
    namespace_name: String,
    configurations: HashMap<String, String>,
    release_key: String,
}

async fn get_config(
    State(state): State<AppState>,
    Path((app_id, cluster, namespace)): Path<(String, String, String)>,
    Query(query): Query<ConfigQuery>,
) -> Result<Response, ApiError> {
    let messages = match query.messages.as_deref() {
        None | Some("") => HashMap::new(),
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!(error = %e, "malformed messages parameter, ignoring");
            HashMap::new()
        }),
    };

    let request = ConfigRequest {
        app_id,
        cluster,
        namespace,
        data_center: query.data_center,
        client_ip: query.ip.unwrap_or_default(),
        release_key: query.release_key,
        messages,
    };

    match state.relay.resolver.resolve_config(&request).await? {
        ResolveOutcome::NotFound => Err(ApiError(Error::not_found(format!(
            "could not load config for app {}, cluster {}, namespace {}",
            request.app_id, request.cluster, request.namespace
        )))),
        ResolveOutcome::NotModified => Ok(StatusCode::NOT_MODIFIED.into_response()),
        ResolveOutcome::Config(payload) => Ok(Json(ConfigResponse {
            app_id: payload.app_id,
            cluster: payload.cluster,
            namespace_name: payload.namespace,
            configurations: payload.configurations,
            release_key: payload.release_key,
        })
        .into_response()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationsQuery {
    app_id: String,
    cluster: String,
    /// JSON array of `{namespaceName, notificationId}`.
    notifications: String,
    #[serde(default)]
    data_center: Option<String>,
    /// Reported for diagnostics; change detection is per-key, not per-ip.
    #[serde(default)]
    ip: Option<String>,
}

async fn poll_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationsQuery>,
) -> Result<Response, ApiError> {
    let notifications: Vec<ClientNotification> = serde_json::from_str(&query.notifications)
        .map_err(|e| Error::bad_request(format!("malformed notifications parameter: {e}")))?;
    if let Some(ip) = query.ip.as_deref() {
        debug!(app_id = %query.app_id, ip, "long poll");
    }

    let request = PollRequest {
        app_id: query.app_id,
        cluster: query.cluster,
        data_center: query.data_center,
        notifications,
    };

    match state.relay.hub.poll(request).await? {
        PollOutcome::NotModified => Ok(StatusCode::NOT_MODIFIED.into_response()),
        PollOutcome::Notifications(changed) => Ok(Json(changed).into_response()),
    }
}
