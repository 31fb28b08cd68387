//! Echo handler
//!
//! Returns the posted JSON object unchanged. Exists so the full middleware
//! stack (body limit, gzip, error formatting) can be exercised end to end.

use axum::Json;
use serde_json::Value;

use crate::error::ApiError;

/// Echo a JSON object back to the caller
pub async fn echo(Json(payload): Json<Value>) -> Result<Json<Value>, ApiError> {
    if !payload.is_object() {
        return Err(ApiError::bad_request("expected a JSON object"));
    }
    Ok(Json(payload))
}
