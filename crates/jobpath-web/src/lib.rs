//! JSON API over the sync engine and the job-discovery aggregator.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jobpath_core::SyncState;
use jobpath_discovery::{DiscoveredJob, DiscoveryQuery, JobSource};
use jobpath_mailbox::{GmailMailbox, MailboxError, MailboxProvider};
use jobpath_store::{NotificationSink, Store};
use jobpath_sync::{SyncConfig, SyncEngine, SyncError, SyncOptions, SyncOutcome};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobpath-web";

/// Builds a token-scoped mailbox per sync request.
pub trait MailboxFactory: Send + Sync {
    fn for_token(&self, access_token: &str) -> Result<Arc<dyn MailboxProvider>, MailboxError>;
}

/// Production factory: one Gmail client per access token.
pub struct GmailFactory;

impl MailboxFactory for GmailFactory {
    fn for_token(&self, access_token: &str) -> Result<Arc<dyn MailboxProvider>, MailboxError> {
        Ok(Arc::new(GmailMailbox::new(access_token)?))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub notifications: Arc<dyn NotificationSink>,
    pub mailbox_factory: Arc<dyn MailboxFactory>,
    pub sources: Vec<Arc<dyn JobSource>>,
    pub sync_config: SyncConfig,
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    user_id: Uuid,
    range_days: Option<u32>,
    #[serde(default)]
    full_inbox: bool,
}

#[derive(Debug, Deserialize)]
struct SyncStateQuery {
    user_id: Uuid,
}

#[derive(Debug, Serialize)]
struct SyncStatusBody {
    sync_state: SyncState,
    events_recorded: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::Unauthorized => StatusCode::UNAUTHORIZED,
            SyncError::InsufficientScope => StatusCode::FORBIDDEN,
            SyncError::Provider(_) => StatusCode::BAD_GATEWAY,
            SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "sync run failed on the store side");
        }
        ApiError::new(status, err.to_string())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(sync_handler).get(sync_state_handler))
        .route("/discover", post(discover_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("JOBPATH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "missing bearer token in Authorization header",
            )
        })
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncOutcome>, ApiError> {
    let token = bearer_token(&headers)?;
    let mailbox = state
        .mailbox_factory
        .for_token(token)
        .map_err(|err| ApiError::new(StatusCode::BAD_GATEWAY, err.to_string()))?;

    let engine = SyncEngine::new(
        Arc::clone(&state.store),
        mailbox,
        Arc::clone(&state.notifications),
    )
    .with_config(state.sync_config);

    let outcome = engine
        .run(
            req.user_id,
            SyncOptions {
                range_days: req.range_days,
                full_inbox: req.full_inbox,
            },
        )
        .await?;
    Ok(Json(outcome))
}

async fn sync_state_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncStateQuery>,
) -> Result<Json<SyncStatusBody>, ApiError> {
    let provider = jobpath_mailbox::PROVIDER_GMAIL;
    let found = state
        .store
        .sync_state(query.user_id, provider)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let Some(sync_state) = found else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "no sync state recorded for this user",
        ));
    };
    let events_recorded = state
        .store
        .mail_event_count(query.user_id, provider)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(SyncStatusBody {
        sync_state,
        events_recorded,
    }))
}

async fn discover_handler(
    State(state): State<Arc<AppState>>,
    Json(query): Json<DiscoveryQuery>,
) -> Json<Vec<DiscoveredJob>> {
    Json(jobpath_discovery::discover(&state.sources, &query).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use jobpath_mailbox::{
        MailQuery, MessageDetail, MessageHeader, MessagePage, PROVIDER_GMAIL,
    };
    use jobpath_store::{MemoryNotificationSink, MemoryStore, NewApplication};
    use jobpath_sync::SOURCE_GMAIL_SYNC;
    use tower::ServiceExt;

    struct FakeMailbox {
        messages: Vec<MessageDetail>,
    }

    #[async_trait]
    impl MailboxProvider for FakeMailbox {
        fn provider_id(&self) -> &'static str {
            PROVIDER_GMAIL
        }

        async fn list_messages(
            &self,
            _query: &MailQuery,
            _page_token: Option<&str>,
            _page_size: u32,
        ) -> Result<MessagePage, MailboxError> {
            Ok(MessagePage {
                ids: self.messages.iter().map(|m| m.id.clone()).collect(),
                next_page_token: None,
            })
        }

        async fn get_message(&self, id: &str) -> Result<MessageDetail, MailboxError> {
            self.messages
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| MailboxError::HttpStatus {
                    status: 404,
                    url: id.to_string(),
                })
        }
    }

    /// Hands out the same fake mailbox regardless of token; rejects the
    /// token "expired".
    struct FakeFactory;

    impl MailboxFactory for FakeFactory {
        fn for_token(
            &self,
            access_token: &str,
        ) -> Result<Arc<dyn MailboxProvider>, MailboxError> {
            if access_token == "expired" {
                return Ok(Arc::new(ExpiredMailbox));
            }
            Ok(Arc::new(FakeMailbox {
                messages: vec![MessageDetail {
                    id: "m1".to_string(),
                    headers: vec![
                        MessageHeader {
                            name: "Subject".to_string(),
                            value: "Interview invitation: Backend Engineer at Acme Corp"
                                .to_string(),
                        },
                        MessageHeader {
                            name: "From".to_string(),
                            value: "careers@acme.com".to_string(),
                        },
                    ],
                    snippet: "schedule a call".to_string(),
                    internal_date: Utc::now(),
                    payload: None,
                }],
            }))
        }
    }

    struct ExpiredMailbox;

    #[async_trait]
    impl MailboxProvider for ExpiredMailbox {
        fn provider_id(&self) -> &'static str {
            PROVIDER_GMAIL
        }

        async fn list_messages(
            &self,
            _query: &MailQuery,
            _page_token: Option<&str>,
            _page_size: u32,
        ) -> Result<MessagePage, MailboxError> {
            Err(MailboxError::Unauthorized)
        }

        async fn get_message(&self, _id: &str) -> Result<MessageDetail, MailboxError> {
            Err(MailboxError::Unauthorized)
        }
    }

    struct StaticSource;

    #[async_trait]
    impl JobSource for StaticSource {
        fn source_id(&self) -> &'static str {
            "static"
        }

        fn confidence(&self) -> f64 {
            0.5
        }

        async fn fetch(
            &self,
            _query: &DiscoveryQuery,
        ) -> Result<Vec<DiscoveredJob>, jobpath_discovery::SourceError> {
            Ok(vec![DiscoveredJob {
                title: "Backend Engineer".to_string(),
                company_name: "Acme".to_string(),
                description: None,
                url: Some("https://acme.dev/jobs/1".to_string()),
                source: "Static".to_string(),
                source_confidence: 0.5,
                location: None,
            }])
        }
    }

    fn mk_state() -> (Arc<MemoryStore>, AppState) {
        let store = Arc::new(MemoryStore::new());
        let state = AppState {
            store: Arc::clone(&store) as Arc<dyn Store>,
            notifications: Arc::new(MemoryNotificationSink::new()),
            mailbox_factory: Arc::new(FakeFactory),
            sources: vec![Arc::new(StaticSource)],
            sync_config: SyncConfig::default(),
        };
        (store, state)
    }

    fn sync_request(user_id: Uuid, token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri("/sync")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder
            .body(Body::from(
                serde_json::json!({ "user_id": user_id }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn sync_requires_bearer_token() {
        let (_store, state) = mk_state();
        let resp = app(state)
            .oneshot(sync_request(Uuid::new_v4(), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sync_runs_and_returns_outcome() {
        let (store, state) = mk_state();
        let user = Uuid::new_v4();
        store
            .create_application(NewApplication {
                user_id: user,
                company_name: "Acme Corp".to_string(),
                role_title: "Backend Engineer".to_string(),
                role_source: SOURCE_GMAIL_SYNC.to_string(),
                role_url: None,
                role_description: None,
                status: jobpath_core::ApplicationStatus::Applied,
                last_activity_at: Utc::now(),
            })
            .await
            .unwrap();

        let resp = app(state)
            .oneshot(sync_request(user, Some("good-token")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let outcome: SyncOutcome = serde_json::from_slice(&body).unwrap();
        assert_eq!(outcome.scanned, 1);
        assert_eq!(outcome.transitions_applied, 1);
    }

    #[tokio::test]
    async fn sync_maps_provider_auth_failure_to_401() {
        let (_store, state) = mk_state();
        let resp = app(state)
            .oneshot(sync_request(Uuid::new_v4(), Some("expired")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sync_state_endpoint_round_trips() {
        let (_store, state) = mk_state();
        let user = Uuid::new_v4();
        let router = app(state);

        let missing = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/sync?user_id={user}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let run = router
            .clone()
            .oneshot(sync_request(user, Some("good-token")))
            .await
            .unwrap();
        assert_eq!(run.status(), StatusCode::OK);

        let found = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/sync?user_id={user}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        let body = found.into_body().collect().await.unwrap().to_bytes();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["sync_state"]["provider"], PROVIDER_GMAIL);
        assert_eq!(status["sync_state"]["status"], "ACTIVE");
        assert_eq!(status["events_recorded"], 1);
    }

    #[tokio::test]
    async fn discover_returns_ranked_jobs() {
        let (_store, state) = mk_state();
        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/discover")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "target_roles": ["backend engineer"],
                            "locations": [],
                            "limit": 10
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let jobs: Vec<DiscoveredJob> = serde_json::from_slice(&body).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].company_name, "Acme");
    }
}
