use std::collections::HashMap;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use octofhir_core::is_known_resource_type;
use octofhir_storage::{SearchParams, StoredResource};
use octofhir_subscriptions::{SubscriptionStatus, validate_subscription};
use octofhir_terminology::{OperationTarget, ValidateCodeParams};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::server::AppState;

const SUBSCRIPTION: &str = "Subscription";

pub async fn root() -> impl IntoResponse {
    Json(json!({
        "service": "octofhir-subscriptions",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("GIT_COMMIT"),
    }))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

pub async fn metadata(State(state): State<AppState>) -> impl IntoResponse {
    let mut operations = vec![
        json!({ "name": "status", "definition": "Subscription/$status" }),
        json!({ "name": "validate-code", "definition": "CodeSystem/$validate-code" }),
        json!({ "name": "validate-code", "definition": "ValueSet/$validate-code" }),
    ];
    if state.config.subscriptions.websocket_enabled {
        operations.push(json!({ "name": "websocket", "definition": "/websocket" }));
    }
    fhir_json(
        StatusCode::OK,
        json!({
            "resourceType": "CapabilityStatement",
            "status": "active",
            "kind": "instance",
            "fhirVersion": "5.0.0",
            "format": ["json"],
            "software": { "name": "octofhir-subscriptions", "version": env!("CARGO_PKG_VERSION") },
            "rest": [{ "mode": "server", "operation": operations }],
        }),
    )
}

// ---------------------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------------------

pub async fn create_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    Json(mut body): Json<Value>,
) -> Result<Response, ApiError> {
    check_body(&resource_type, &body, None)?;
    if resource_type == SUBSCRIPTION {
        reset_requested(&mut body);
        validate_subscription(&body)?;
    }

    let stored = state.storage.create(&body).await?;
    tracing::info!(
        resource_type = %stored.resource_type,
        id = %stored.id,
        version_id = %stored.version_id,
        "resource created"
    );
    Ok(resource_response(StatusCode::CREATED, &stored, true))
}

pub async fn read_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    check_type(&resource_type)?;
    let stored = state
        .storage
        .read(&resource_type, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("{resource_type}/{id} not found")))?;
    Ok(resource_response(StatusCode::OK, &stored, false))
}

/// Update-or-create. Subscription status belongs to the server: the stored
/// status and error survive the update, except that a client may turn a
/// subscription `off`. An updated subscription is re-checked against its
/// topic and channel.
pub async fn update_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Result<Response, ApiError> {
    check_body(&resource_type, &body, Some(&id))?;
    if let Some(obj) = body.as_object_mut() {
        obj.insert("id".into(), Value::String(id.clone()));
    }

    let existing = state.storage.read(&resource_type, &id).await?;
    let Some(existing) = existing else {
        if resource_type == SUBSCRIPTION {
            reset_requested(&mut body);
            validate_subscription(&body)?;
        }
        let stored = state.storage.create(&body).await?;
        return Ok(resource_response(StatusCode::CREATED, &stored, true));
    };

    let mut turn_off = false;
    if resource_type == SUBSCRIPTION {
        turn_off = body.get("status").and_then(Value::as_str) == Some(SubscriptionStatus::Off.as_str());
        keep_server_status(&mut body, &existing.resource);
        validate_subscription(&body)?;
    }

    let if_match = if_match_version(&headers);
    let stored = state.storage.update(&body, if_match.as_deref()).await?;

    if resource_type != SUBSCRIPTION {
        return Ok(resource_response(StatusCode::OK, &stored, false));
    }

    if turn_off {
        state.engine.lifecycle().deactivate(&id).await?;
    } else {
        state.engine.lifecycle().revalidate(&id).await?;
    }
    let current = state
        .storage
        .read(&resource_type, &id)
        .await?
        .unwrap_or(stored);
    Ok(resource_response(StatusCode::OK, &current, false))
}

pub async fn delete_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    check_type(&resource_type)?;
    if resource_type == SUBSCRIPTION {
        if state.storage.read(SUBSCRIPTION, &id).await?.is_none() {
            return Err(ApiError::not_found(format!("{resource_type}/{id} not found")));
        }
        state.engine.delete_subscription(&id).await?;
    } else {
        state.storage.delete(&resource_type, &id).await?;
    }
    tracing::info!(resource_type = %resource_type, id = %id, "resource deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn search_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    check_type(&resource_type)?;

    let mut params = SearchParams::new();
    for (key, value) in &query {
        if key == "_count" {
            let count = value
                .parse()
                .map_err(|_| ApiError::bad_request(format!("Invalid _count: {value}")))?;
            params = params.with_count(count);
        } else if !key.starts_with('_') {
            params = params.with_param(key.clone(), value.clone());
        }
    }

    let result = state.storage.search(&resource_type, &params).await?;
    let entries: Vec<Value> = result
        .entries
        .iter()
        .map(|r| {
            json!({
                "fullUrl": format!("{}/{}", r.resource_type, r.id),
                "resource": r.resource,
            })
        })
        .collect();

    Ok(fhir_json(
        StatusCode::OK,
        json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "total": result.total.unwrap_or(entries.len() as u32),
            "entry": entries,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// `GET /fhir/Subscription/{id}/$status`
pub async fn subscription_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let view = state
        .engine
        .status_view(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Subscription/{id} not found")))?;
    Ok(fhir_json(StatusCode::OK, view))
}

pub async fn code_system_validate_code_get(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    validate_code(&state, ValidateCodeParams::from_query(&query), OperationTarget::CodeSystem).await
}

pub async fn code_system_validate_code_post(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let params = ValidateCodeParams::from_parameters(&body)?;
    validate_code(&state, params, OperationTarget::CodeSystem).await
}

pub async fn value_set_validate_code_get(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    validate_code(&state, ValidateCodeParams::from_query(&query), OperationTarget::ValueSet).await
}

pub async fn value_set_validate_code_post(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let params = ValidateCodeParams::from_parameters(&body)?;
    validate_code(&state, params, OperationTarget::ValueSet).await
}

async fn validate_code(
    state: &AppState,
    params: ValidateCodeParams,
    target: OperationTarget,
) -> Result<Response, ApiError> {
    let request = params.into_request(target)?;
    let result = state.terminology.validate_code(&request).await?;
    tracing::debug!(
        code = %request.code(),
        valid = result.valid,
        source = result.source.as_str(),
        "$validate-code"
    );
    Ok(fhir_json(StatusCode::OK, result.to_parameters()))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn check_type(resource_type: &str) -> Result<(), ApiError> {
    if is_known_resource_type(resource_type) {
        Ok(())
    } else {
        Err(ApiError::not_found(format!(
            "Unknown resource type: {resource_type}"
        )))
    }
}

fn check_body(resource_type: &str, body: &Value, id: Option<&str>) -> Result<(), ApiError> {
    check_type(resource_type)?;
    let declared = body
        .get("resourceType")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("Body must be a resource with resourceType"))?;
    if declared != resource_type {
        return Err(ApiError::bad_request(format!(
            "resourceType {declared} does not match endpoint {resource_type}"
        )));
    }
    if let (Some(id), Some(body_id)) = (id, body.get("id").and_then(Value::as_str)) {
        if id != body_id {
            return Err(ApiError::bad_request(format!(
                "Resource id {body_id} does not match URL id {id}"
            )));
        }
    }
    Ok(())
}

/// New subscriptions always start `requested`; the lifecycle decides the rest.
fn reset_requested(body: &mut Value) {
    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            "status".into(),
            Value::String(SubscriptionStatus::Requested.as_str().to_string()),
        );
        obj.remove("error");
    }
}

fn keep_server_status(body: &mut Value, existing: &Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    for field in ["status", "error"] {
        match existing.get(field) {
            Some(v) => {
                obj.insert(field.into(), v.clone());
            }
            None => {
                obj.remove(field);
            }
        }
    }
}

/// `If-Match: W/"3"` → `3`
fn if_match_version(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::IF_MATCH)?.to_str().ok()?;
    let trimmed = raw.trim().trim_start_matches("W/").trim_matches('"');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn resource_response(status: StatusCode, stored: &StoredResource, location: bool) -> Response {
    let mut response = fhir_json(status, stored.resource.clone());
    let headers = response.headers_mut();
    if let Ok(etag) = HeaderValue::from_str(&format!("W/\"{}\"", stored.version_id)) {
        headers.insert(header::ETAG, etag);
    }
    if location {
        let path = format!(
            "/fhir/{}/{}/_history/{}",
            stored.resource_type, stored.id, stored.version_id
        );
        if let Ok(value) = HeaderValue::from_str(&path) {
            headers.insert(header::LOCATION, value);
        }
    }
    response
}

pub(crate) fn fhir_json(status: StatusCode, body: Value) -> Response {
    (
        status,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/fhir+json"),
        )],
        Json(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn if_match_accepts_weak_and_bare_versions() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MATCH, HeaderValue::from_static("W/\"7\""));
        assert_eq!(if_match_version(&headers).as_deref(), Some("7"));

        headers.insert(header::IF_MATCH, HeaderValue::from_static("7"));
        assert_eq!(if_match_version(&headers).as_deref(), Some("7"));

        assert_eq!(if_match_version(&HeaderMap::new()), None);
    }

    #[test]
    fn client_cannot_set_subscription_status() {
        let mut body = json!({ "resourceType": "Subscription", "status": "active", "error": "x" });
        reset_requested(&mut body);
        assert_eq!(body["status"], "requested");
        assert!(body.get("error").is_none());

        let existing = json!({ "resourceType": "Subscription", "status": "error", "error": "Topic not found: t" });
        let mut update = json!({ "resourceType": "Subscription", "status": "active" });
        keep_server_status(&mut update, &existing);
        assert_eq!(update["status"], "error");
        assert_eq!(update["error"], "Topic not found: t");
    }

    #[test]
    fn body_type_must_match_path() {
        let body = json!({ "resourceType": "Patient" });
        assert!(check_body("Observation", &body, None).is_err());
        assert!(check_body("Patient", &body, None).is_ok());
        assert!(check_body("Patient", &json!({ "resourceType": "Patient", "id": "a" }), Some("b")).is_err());
        assert!(check_body("NotAType", &body, None).is_err());
    }
}
