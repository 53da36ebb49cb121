//! JSON-RPC method handlers.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::engine::SubscriptionEngine;
use super::error::SubscriptionError;
use super::types::{SubscriptionRequest, UserContext};
use crate::rpc::{RpcError, RpcRequest, RpcResponse, codes};

pub mod methods {
    pub const SUBSCRIBE: &str = "resources/subscribe";
    pub const UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const BATCH_SUBSCRIBE: &str = "resources/batch_subscribe";
    pub const BATCH_UNSUBSCRIBE: &str = "resources/batch_unsubscribe";
    pub const LIST: &str = "resources/list";
}

/// One client session as seen by the handlers.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: String,
    pub user_context: UserContext,
}

impl Session {
    pub fn new(connection_id: impl Into<String>, user_context: UserContext) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_context,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UnsubscribeParams {
    #[serde(rename = "subscriptionId", alias = "subscription_id")]
    subscription_id: String,
}

#[derive(Debug, Deserialize)]
struct BatchSubscribeParams {
    subscriptions: Vec<SubscriptionRequest>,
}

#[derive(Debug, Deserialize)]
struct BatchUnsubscribeParams {
    subscription_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    cursor: Option<String>,
}

impl From<SubscriptionError> for RpcError {
    fn from(e: SubscriptionError) -> Self {
        RpcError::new(e.code(), e.to_string()).with_data(json!({ "error": e.kind() }))
    }
}

/// Handle one raw text frame. Returns the serialized response, if any.
pub async fn handle_message(
    engine: &SubscriptionEngine,
    session: &Session,
    text: &str,
) -> Option<String> {
    let response = match serde_json::from_str::<RpcRequest>(text) {
        Ok(request) => handle_request(engine, session, request).await?,
        Err(e) => RpcResponse::failure(
            Value::Null,
            RpcError::new(codes::PARSE_ERROR, format!("Parse error: {e}")),
        ),
    };
    match serde_json::to_string(&response) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize JSON-RPC response");
            None
        }
    }
}

/// Handle a decoded request. Requests without an id get no response.
pub async fn handle_request(
    engine: &SubscriptionEngine,
    session: &Session,
    request: RpcRequest,
) -> Option<RpcResponse> {
    tracing::debug!(
        connection_id = %session.connection_id,
        method = %request.method,
        "Handling JSON-RPC request"
    );
    let result = call(engine, session, &request.method, request.params).await;
    if let Err(e) = &result {
        tracing::debug!(
            connection_id = %session.connection_id,
            method = %request.method,
            code = e.code,
            error = %e.message,
            "JSON-RPC request failed"
        );
    }

    let id = request.id?;
    Some(match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(error) => RpcResponse::failure(id, error),
    })
}

async fn call(
    engine: &SubscriptionEngine,
    session: &Session,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    match method {
        methods::SUBSCRIBE => {
            let request: SubscriptionRequest = parse_params(params)?;
            let id = engine
                .subscribe(&session.connection_id, request, session.user_context.clone())
                .await?;
            Ok(json!({ "subscriptionId": id }))
        }
        methods::UNSUBSCRIBE => {
            let params: UnsubscribeParams = parse_params(params)?;
            engine.unsubscribe(&params.subscription_id, &session.connection_id)?;
            Ok(json!({}))
        }
        methods::BATCH_SUBSCRIBE => {
            let params: BatchSubscribeParams = parse_params(params)?;
            let report = engine
                .batch_subscribe(
                    &session.connection_id,
                    params.subscriptions,
                    session.user_context.clone(),
                )
                .await?;
            to_result(&report)
        }
        methods::BATCH_UNSUBSCRIBE => {
            let params: BatchUnsubscribeParams = parse_params(params)?;
            let report =
                engine.batch_unsubscribe(&session.connection_id, &params.subscription_ids);
            to_result(&report)
        }
        methods::LIST => {
            let params: ListParams = parse_params(params)?;
            let page = engine
                .list_resources(params.limit, params.cursor.as_deref())
                .await?;
            to_result(&page)
        }
        other => Err(RpcError::new(
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params)
        .map_err(|e| RpcError::new(codes::INVALID_PARAMS, format!("Invalid params: {e}")))
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::new(codes::INTERNAL_ERROR, e.to_string()))
}
