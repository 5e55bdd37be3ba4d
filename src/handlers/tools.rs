//! HTTP bridge into a connected client's local tools.
//!
//! `POST /tools/{client_id}/{namespace}` forwards the JSON body to the
//! client over its channel and relays whatever comes back. JSON-RPC
//! notifications (method names starting with `notification`) are forwarded
//! without waiting and acknowledged with 202.

use actix_web::{web, HttpResponse};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::comms::CommandError;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub async fn proxy_tool_request(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<Value>,
) -> AppResult<HttpResponse> {
    let (client_id, namespace) = path.into_inner();

    let client_id = Uuid::parse_str(&client_id)
        .map_err(|_| AppError::BadRequest(format!("Invalid client id '{}'", client_id)))?;

    let allowed = state.get_config().tools.allowed_namespaces;
    if !allowed.iter().any(|n| n == &namespace) {
        return Err(AppError::BadRequest(format!(
            "Unsupported tool namespace '{}'",
            namespace
        )));
    }

    let channel = state.registry.channel_for(client_id).await;
    if channel.is_none() {
        return Err(AppError::NotFound("Client not connected".to_string()));
    }

    let payload = body.into_inner();
    let is_notification = payload["method"]
        .as_str()
        .map(|m| m.starts_with("notification"))
        .unwrap_or(false);

    if is_notification {
        state
            .proxy
            .notify(channel, client_id, &namespace, payload)
            .map_err(|err| AppError::Internal(err.to_string()))?;
        return Ok(HttpResponse::Accepted().json(json!({ "status": "accepted" })));
    }

    match state.proxy.request(channel, client_id, &namespace, payload).await {
        Ok(Some(data)) => Ok(HttpResponse::Ok().json(data)),
        Ok(None) => Ok(HttpResponse::Ok().json(json!({
            "error": "No response received from client"
        }))),
        Err(CommandError::Timeout) => Ok(HttpResponse::GatewayTimeout().json(json!({
            "error": "Request timeout - no response from client"
        }))),
        Err(CommandError::NoConnection(_)) | Err(CommandError::Disconnected) => {
            Err(AppError::NotFound("Client not connected".to_string()))
        }
        Err(err) => Err(AppError::Internal(err.to_string())),
    }
}
