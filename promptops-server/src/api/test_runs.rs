// Copyright 2025 PromptOps Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! REST lifecycle surface used by the test runner: register a test, push
//! progress/terminal updates, abort, delete, and inspect the registry.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use promptops_core::{RegistryError, StatusSnapshot, TestStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::registry::{CreateTest, TestRecordInfo, TestUpdate};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterTestRequest {
    /// Caller-assigned id; generated when absent.
    #[serde(default)]
    pub test_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub progress: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterTestResponse {
    pub test_id: String,
    pub status: TestStatus,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTestRequest {
    #[serde(default)]
    pub status: Option<TestStatus>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub results: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TestListResponse {
    pub tests: Vec<TestRecordInfo>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// POST /api/v1/projects/:project_id/tests
/// Register a new test run for tracking
pub async fn register_test(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(req): Json<RegisterTestRequest>,
) -> Result<(StatusCode, Json<RegisterTestResponse>), (StatusCode, String)> {
    let test_id = req
        .test_id
        .unwrap_or_else(|| format!("test-{}", Uuid::new_v4()));

    let opts = CreateTest {
        user_id: req.user_id,
        project_id,
        progress: req.progress,
        ..Default::default()
    };

    match state.registry.create(&test_id, opts) {
        Ok(info) => Ok((
            StatusCode::CREATED,
            Json(RegisterTestResponse {
                test_id,
                status: info.status,
            }),
        )),
        Err(err @ RegistryError::MissingOwner) => Err((StatusCode::BAD_REQUEST, err.to_string())),
        Err(err @ RegistryError::InvalidStatus(_)) => {
            Err((StatusCode::BAD_REQUEST, err.to_string()))
        }
        Err(err @ RegistryError::AlreadyExists(_)) => Err((StatusCode::CONFLICT, err.to_string())),
    }
}

/// GET /api/v1/projects/:project_id/tests/:test_id
/// Current status snapshot of a test
pub async fn get_test(
    State(state): State<AppState>,
    Path((project_id, test_id)): Path<(String, String)>,
) -> Result<Json<StatusSnapshot>, (StatusCode, String)> {
    match state.registry.get(&test_id) {
        Some(info) if info.project_id == project_id => state
            .registry
            .status_snapshot(&test_id)
            .map(Json)
            .ok_or_else(|| (StatusCode::NOT_FOUND, "Test not found".to_string())),
        _ => Err((StatusCode::NOT_FOUND, "Test not found".to_string())),
    }
}

/// POST /api/v1/projects/:project_id/tests/:test_id/status
/// Merge a progress or terminal update into a test record
pub async fn update_test(
    State(state): State<AppState>,
    Path((project_id, test_id)): Path<(String, String)>,
    Json(req): Json<UpdateTestRequest>,
) -> Result<Json<StatusSnapshot>, (StatusCode, String)> {
    let Some(info) = state.registry.get(&test_id) else {
        return Err((StatusCode::NOT_FOUND, "Test not found".to_string()));
    };
    if info.project_id != project_id {
        return Err((StatusCode::NOT_FOUND, "Test not found".to_string()));
    }

    let update = TestUpdate {
        status: req.status,
        progress: req.progress,
        results: req.results,
        error: req.error,
    };

    if !state.registry.update(&test_id, update) {
        return Err((
            StatusCode::CONFLICT,
            "Test is already in a terminal state".to_string(),
        ));
    }

    state
        .registry
        .status_snapshot(&test_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Test not found".to_string()))
}

/// POST /api/v1/projects/:project_id/tests/:test_id/abort
/// User-initiated cancellation of an in-flight test
pub async fn abort_test(
    State(state): State<AppState>,
    Path((project_id, test_id)): Path<(String, String)>,
) -> Result<Json<StatusSnapshot>, (StatusCode, String)> {
    let Some(info) = state.registry.get(&test_id) else {
        return Err((StatusCode::NOT_FOUND, "Test not found".to_string()));
    };
    if info.project_id != project_id {
        return Err((StatusCode::NOT_FOUND, "Test not found".to_string()));
    }

    if !state.registry.abort(&test_id) {
        return Err((
            StatusCode::CONFLICT,
            "Test is already in a terminal state".to_string(),
        ));
    }

    state
        .registry
        .status_snapshot(&test_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Test not found".to_string()))
}

/// DELETE /api/v1/projects/:project_id/tests/:test_id
/// Remove a test record, cancelling any in-flight work
pub async fn delete_test(
    State(state): State<AppState>,
    Path((project_id, test_id)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, (StatusCode, String)> {
    match state.registry.get(&test_id) {
        Some(info) if info.project_id == project_id => {
            let deleted = state.registry.delete(&test_id);
            Ok(Json(DeleteResponse {
                success: deleted,
                message: if deleted {
                    "Test deleted successfully".to_string()
                } else {
                    "Test was already gone".to_string()
                },
            }))
        }
        _ => Err((StatusCode::NOT_FOUND, "Test not found".to_string())),
    }
}

/// GET /api/v1/tests
/// Diagnostic listing of every tracked test
pub async fn list_tests(State(state): State<AppState>) -> Json<TestListResponse> {
    let tests = state.registry.list();
    let total = tests.len();
    Json(TestListResponse { tests, total })
}

#[cfg(test)]
mod tests {
    use crate::api::AppState;
    use crate::broadcast::StatusBroadcaster;
    use crate::build_router;
    use crate::registry::{RegistryConfig, TestRegistry};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use promptops_core::TestStatus;
    use tower::ServiceExt;

    fn app() -> (axum::Router, TestRegistry) {
        let registry = TestRegistry::new(RegistryConfig::default(), StatusBroadcaster::new(64));
        let router = build_router(AppState {
            registry: registry.clone(),
        });
        (router, registry)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_register_then_fetch_status() {
        let (router, _registry) = app();

        let response = router
            .clone()
            .oneshot(
                Request::post("/api/v1/projects/p1/tests")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"test_id": "t1", "user_id": "u1", "progress": "queued"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["test_id"], "t1");
        assert_eq!(body["status"], "running");

        let response = router
            .oneshot(
                Request::get("/api/v1/projects/p1/tests/t1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["progress"], "queued");
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate() {
        let (router, registry) = app();
        registry
            .create(
                "t1",
                crate::registry::CreateTest {
                    user_id: "u1".to_string(),
                    project_id: "p1".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        let response = router
            .oneshot(
                Request::post("/api/v1/projects/p1/tests")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"test_id": "t1", "user_id": "u1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_update_and_terminal_conflict() {
        let (router, registry) = app();
        registry
            .create(
                "t1",
                crate::registry::CreateTest {
                    user_id: "u1".to_string(),
                    project_id: "p1".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::post("/api/v1/projects/p1/tests/t1/status")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"status": "completed", "results": {"score": 0.9}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["results"]["score"], 0.9);

        // A late write is refused.
        let response = router
            .oneshot(
                Request::post("/api/v1/projects/p1/tests/t1/status")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"progress": "again"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_abort_flow() {
        let (router, registry) = app();
        registry
            .create(
                "t1",
                crate::registry::CreateTest {
                    user_id: "u1".to_string(),
                    project_id: "p1".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        let token = registry.cancellation_token("t1").unwrap();

        let response = router
            .oneshot(
                Request::post("/api/v1/projects/p1/tests/t1/abort")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "aborted");
        assert!(token.is_cancelled());
        assert_eq!(
            registry.status_snapshot("t1").unwrap().status,
            TestStatus::Aborted
        );
    }

    #[tokio::test]
    async fn test_wrong_project_is_not_found() {
        let (router, registry) = app();
        registry
            .create(
                "t1",
                crate::registry::CreateTest {
                    user_id: "u1".to_string(),
                    project_id: "p1".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        let response = router
            .oneshot(
                Request::get("/api/v1/projects/other/tests/t1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
