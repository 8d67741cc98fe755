//! # Handler Chain Integration Tests
//!
//! Drives the full request pipeline through `tower::ServiceExt::oneshot`:
//! authentication and authorization failures, audit deliveries, panic
//! recovery, impersonation, max-in-flight load shedding, CORS and the
//! request timeout.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request as ExtractedRequest,
    http::{header, Method, Request, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tower::ServiceExt;

use apiserver_core::audit::{AuditBackend, AuditPolicy, FixedLevelPolicy, InMemoryBackend, Level, Stage};
use apiserver_core::auth::user::SYSTEM_PRIVILEGED_GROUP;
use apiserver_core::auth::{
    AlwaysAllowAuthorizer, AlwaysDenyAuthorizer, Attributes, Authorizer, Decision,
    StaticTokenAuthenticator, UserInfo,
};
use apiserver_core::middleware::audit::MAX_AUDITED_BODY_BYTES;
use apiserver_core::middleware::timeout::TIMEOUT_MESSAGE;
use apiserver_core::responses::{Status, PANIC_MESSAGE, TOO_MANY_REQUESTS_MESSAGE};
use apiserver_core::{build_handler_chain, ApiServerResult, Collaborators, RequestContext, ServerConfig};

const PODS: &str = "/api/v1/namespaces/default/pods";

fn authenticator() -> StaticTokenAuthenticator {
    let mut authn = StaticTokenAuthenticator::new();
    authn.insert("jane-token", UserInfo::new("jane"));
    authn.insert(
        "admin-token",
        UserInfo::new("admin").with_groups([SYSTEM_PRIVILEGED_GROUP]),
    );
    authn
}

fn collaborators(backend: Option<Arc<InMemoryBackend>>, policy: Arc<dyn AuditPolicy>) -> Collaborators {
    Collaborators {
        authenticator: Some(Arc::new(authenticator())),
        authorizer: Some(Arc::new(AlwaysAllowAuthorizer)),
        audit_backend: backend.map(|b| b as Arc<dyn AuditBackend>),
        audit_policy: policy,
    }
}

fn pods_router() -> Router {
    Router::new().route(
        PODS,
        get(|| async { Json(json!({"kind": "PodList", "items": []})) })
            .post(|Json(body): Json<Value>| async move { (StatusCode::CREATED, Json(body)) }),
    )
}

fn request(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn with_headers(mut request: Request<Body>, headers: &[(&str, &str)]) -> Request<Body> {
    for (name, value) in headers {
        let name = header::HeaderName::from_bytes(name.as_bytes()).unwrap();
        request.headers_mut().append(name, value.parse().unwrap());
    }
    request
}

/// Allows everything except impersonating the listed resources
struct ImpersonationPolicy {
    denied: Vec<&'static str>,
}

#[async_trait]
impl Authorizer for ImpersonationPolicy {
    async fn authorize(&self, attributes: &Attributes) -> ApiServerResult<Decision> {
        if attributes.verb == "impersonate" && self.denied.contains(&attributes.resource.as_str()) {
            return Ok(Decision::deny("impersonation not allowed"));
        }
        Ok(Decision::allow())
    }
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn status_body(response: Response) -> Status {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn missing_credentials_are_rejected_before_audit() {
    let backend = InMemoryBackend::shared();
    let mut config = ServerConfig::default();
    config.authentication.supports_basic_auth = true;
    let app = build_handler_chain(
        pods_router(),
        &config,
        &collaborators(Some(backend.clone()), Arc::new(FixedLevelPolicy(Level::Metadata))),
    )
    .unwrap();

    let response = app.oneshot(request(Method::GET, PODS, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        "Basic realm=\"kubernetes-master\""
    );
    let status = status_body(response).await;
    assert_eq!(status.reason, "Unauthorized");
    assert_eq!(status.code, 401);
    assert!(backend.events().is_empty());
}

#[tokio::test]
async fn denial_names_user_verb_and_namespace() {
    let backend = InMemoryBackend::shared();
    let mut collaborators =
        collaborators(Some(backend.clone()), Arc::new(FixedLevelPolicy(Level::Metadata)));
    collaborators.authorizer = Some(Arc::new(AlwaysDenyAuthorizer));
    let app = build_handler_chain(pods_router(), &ServerConfig::default(), &collaborators).unwrap();

    let response = app
        .oneshot(request(Method::GET, PODS, Some("jane-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let status = status_body(response).await;
    assert_eq!(
        status.message,
        "pods is forbidden: User \"jane\" cannot list pods in the namespace \"default\".: \"Everything is forbidden.\""
    );
    assert_eq!(status.reason, "Forbidden");

    // audit sits outside authorization, so the denial is on record
    let events = backend.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].stage, Stage::ResponseComplete);
    assert_eq!(events[1].response_status.as_ref().map(|s| s.code), Some(403));
}

#[tokio::test]
async fn audit_delivers_request_and_response_stages() {
    let backend = InMemoryBackend::shared();
    let app = build_handler_chain(
        pods_router(),
        &ServerConfig::default(),
        &collaborators(Some(backend.clone()), Arc::new(FixedLevelPolicy(Level::RequestResponse))),
    )
    .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(PODS)
                .header(header::AUTHORIZATION, "Bearer jane-token")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"kind":"Pod","metadata":{"name":"web-0"}}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let audit_id = response.headers()["audit-id"].to_str().unwrap().to_string();
    let echoed: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(echoed["metadata"]["name"], "web-0");

    let events = backend.events_for(&audit_id);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].stage, Stage::RequestReceived);
    assert_eq!(events[0].verb, "create");
    assert_eq!(events[0].user.name, "jane");
    assert!(events[0].response_status.is_none());

    let complete = &events[1];
    assert_eq!(complete.stage, Stage::ResponseComplete);
    assert_eq!(complete.response_status.as_ref().map(|s| s.code), Some(201));
    assert_eq!(
        complete.request_object.as_ref().map(|o| o["kind"].clone()),
        Some(json!("Pod"))
    );
    assert!(complete.response_object.is_some());
    assert_eq!(
        complete.object_ref.as_ref().map(|r| r.resource.as_str()),
        Some("pods")
    );
}

#[tokio::test]
async fn level_none_skips_auditing() {
    let backend = InMemoryBackend::shared();
    let app = build_handler_chain(
        pods_router(),
        &ServerConfig::default(),
        &collaborators(Some(backend.clone()), Arc::new(FixedLevelPolicy(Level::None))),
    )
    .unwrap();

    let response = app
        .oneshot(request(Method::GET, PODS, Some("jane-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("audit-id"));
    assert!(backend.events().is_empty());
}

#[tokio::test]
async fn panic_becomes_generic_500_and_panic_audit() {
    let backend = InMemoryBackend::shared();
    let router = Router::new().route(
        PODS,
        get(|| async {
            if true {
                panic!("storage exploded");
            }
            "unreachable"
        }),
    );
    let app = build_handler_chain(
        router,
        &ServerConfig::default(),
        &collaborators(Some(backend.clone()), Arc::new(FixedLevelPolicy(Level::Metadata))),
    )
    .unwrap();

    let response = app
        .oneshot(request(Method::GET, PODS, Some("jane-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, format!("{}\n", PANIC_MESSAGE));

    let events = backend.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].stage, Stage::RequestReceived);
    assert_eq!(events[1].stage, Stage::Panic);
    let status = events[1].response_status.clone().unwrap();
    assert_eq!(status.code, 500);
    assert_eq!(status.message.as_deref(), Some("storage exploded"));
}

/// Router whose pod list blocks until released, next to a configmap list
/// that answers immediately
fn blocking_router(entered: mpsc::UnboundedSender<()>, release: Arc<Semaphore>) -> Router {
    Router::new()
        .route(
            PODS,
            get(move || {
                let entered = entered.clone();
                let release = Arc::clone(&release);
                async move {
                    let _ = entered.send(());
                    let _permit = release.acquire().await;
                    "released"
                }
            }),
        )
        .route("/api/v1/namespaces/default/configmaps", get(|| async { "configmaps" }))
        .route("/api/v1/watch/pods", get(|| async { "watching" }))
}

#[tokio::test]
async fn saturated_class_sheds_exactly_the_excess_request() {
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Semaphore::new(0));
    let mut config = ServerConfig::default();
    config.admission.max_requests_in_flight = 2;
    let app = build_handler_chain(
        blocking_router(entered_tx, Arc::clone(&release)),
        &config,
        &collaborators(None, Arc::new(FixedLevelPolicy(Level::None))),
    )
    .unwrap();

    let mut in_flight = Vec::new();
    for _ in 0..2 {
        let app = app.clone();
        in_flight.push(tokio::spawn(async move {
            app.oneshot(request(Method::GET, PODS, Some("jane-token")))
                .await
                .unwrap()
                .status()
        }));
    }
    entered_rx.recv().await.unwrap();
    entered_rx.recv().await.unwrap();

    let rejected = app
        .clone()
        .oneshot(request(
            Method::GET,
            "/api/v1/namespaces/default/configmaps",
            Some("jane-token"),
        ))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.headers()[header::RETRY_AFTER], "1");
    assert_eq!(body_text(rejected).await, format!("{}\n", TOO_MANY_REQUESTS_MESSAGE));

    let privileged = app
        .clone()
        .oneshot(request(
            Method::GET,
            "/api/v1/namespaces/default/configmaps",
            Some("admin-token"),
        ))
        .await
        .unwrap();
    assert_eq!(privileged.status(), StatusCode::OK);

    let watch = app
        .clone()
        .oneshot(request(Method::GET, "/api/v1/watch/pods", Some("jane-token")))
        .await
        .unwrap();
    assert_eq!(watch.status(), StatusCode::OK);

    // mutating requests draw on their own budget
    let mutating = app
        .clone()
        .oneshot(request(Method::DELETE, "/api/v1/namespaces/default/configmaps/a", Some("jane-token")))
        .await
        .unwrap();
    assert_ne!(mutating.status(), StatusCode::TOO_MANY_REQUESTS);

    release.add_permits(2);
    for handle in in_flight {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }

    // slots came back once the handlers returned
    let after = app
        .oneshot(request(
            Method::GET,
            "/api/v1/namespaces/default/configmaps",
            Some("jane-token"),
        ))
        .await
        .unwrap();
    assert_eq!(after.status(), StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn slow_request_times_out() {
    let router = Router::new().route(
        PODS,
        get(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "late"
        }),
    );
    let mut config = ServerConfig::default();
    config.serving.request_timeout = Duration::from_secs(1);
    let app = build_handler_chain(
        router,
        &config,
        &collaborators(None, Arc::new(FixedLevelPolicy(Level::None))),
    )
    .unwrap();

    let response = app
        .oneshot(request(Method::GET, PODS, Some("jane-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let status = status_body(response).await;
    assert_eq!(status.reason, "Timeout");
}

#[tokio::test]
async fn cors_preflight_for_allowed_origin_only() {
    let mut config = ServerConfig::default();
    config.serving.cors_allowed_origins = vec![r"^https://dash\.example\.com$".to_string()];
    let app = build_handler_chain(
        pods_router(),
        &config,
        &collaborators(None, Arc::new(FixedLevelPolicy(Level::None))),
    )
    .unwrap();

    let preflight = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri(PODS)
                .header(header::ORIGIN, "https://dash.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(preflight.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        preflight.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://dash.example.com"
    );

    let mut foreign = request(Method::GET, PODS, Some("jane-token"));
    foreign
        .headers_mut()
        .insert(header::ORIGIN, "https://evil.example.org".parse().unwrap());
    let response = app.oneshot(foreign).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test(start_paused = true)]
async fn timed_out_request_is_audited_as_504() {
    let backend = InMemoryBackend::shared();
    let router = Router::new().route(
        PODS,
        get(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "late"
        }),
    );
    let mut config = ServerConfig::default();
    config.serving.request_timeout = Duration::from_secs(1);
    let app = build_handler_chain(
        router,
        &config,
        &collaborators(Some(backend.clone()), Arc::new(FixedLevelPolicy(Level::Metadata))),
    )
    .unwrap();

    let response = app
        .oneshot(request(Method::GET, PODS, Some("jane-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    let events = backend.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].stage, Stage::RequestReceived);
    assert_eq!(events[1].stage, Stage::ResponseComplete);
    let status = events[1].response_status.clone().unwrap();
    assert_eq!(status.code, 504);
    assert_eq!(status.message.as_deref(), Some(TIMEOUT_MESSAGE));
}

#[tokio::test]
async fn oversized_bodies_pass_through_unaudited() {
    let backend = InMemoryBackend::shared();
    let large = format!("{{\"items\":\"{}\"}}", "x".repeat(MAX_AUDITED_BODY_BYTES + 1024));
    let served = large.clone();
    let router = Router::new().route(
        PODS,
        get(move || {
            let served = served.clone();
            async move { ([(header::CONTENT_TYPE, "application/json")], served) }
        })
        .post(|body: Body| async move {
            let received = axum::body::to_bytes(body, usize::MAX).await.unwrap().len();
            (StatusCode::CREATED, Json(json!({ "received": received })))
        }),
    );
    let app = build_handler_chain(
        router,
        &ServerConfig::default(),
        &collaborators(Some(backend.clone()), Arc::new(FixedLevelPolicy(Level::RequestResponse))),
    )
    .unwrap();

    // a large response keeps its status and body
    let response = app
        .clone()
        .oneshot(request(Method::GET, PODS, Some("jane-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let audit_id = response.headers()["audit-id"].to_str().unwrap().to_string();
    assert_eq!(body_text(response).await.len(), large.len());

    let events = backend.events_for(&audit_id);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].stage, Stage::ResponseComplete);
    assert_eq!(events[1].response_status.as_ref().map(|s| s.code), Some(200));
    assert!(events[1].response_object.is_none());

    // a large request reaches the handler in full
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(PODS)
                .header(header::AUTHORIZATION, "Bearer jane-token")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(large.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let audit_id = response.headers()["audit-id"].to_str().unwrap().to_string();
    let echoed: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(echoed["received"], json!(large.len()));

    let events = backend.events_for(&audit_id);
    assert_eq!(events.len(), 2);
    assert!(events[1].request_object.is_none());
    assert_eq!(events[1].response_status.as_ref().map(|s| s.code), Some(201));
    assert!(events[1].response_object.is_some());
}

#[tokio::test]
async fn denied_impersonation_is_forbidden() {
    let backend = InMemoryBackend::shared();
    let mut collaborators =
        collaborators(Some(backend.clone()), Arc::new(FixedLevelPolicy(Level::Metadata)));
    collaborators.authorizer = Some(Arc::new(ImpersonationPolicy {
        denied: vec!["groups"],
    }));
    let app = build_handler_chain(pods_router(), &ServerConfig::default(), &collaborators).unwrap();

    let response = app
        .oneshot(with_headers(
            request(Method::GET, PODS, Some("jane-token")),
            &[("Impersonate-User", "bob"), ("Impersonate-Group", "devs")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let status = status_body(response).await;
    assert_eq!(
        status.message,
        "groups \"devs\" is forbidden: User \"jane\" cannot impersonate groups at the cluster scope.: \"impersonation not allowed\""
    );

    let events = backend.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].response_status.as_ref().map(|s| s.code), Some(403));
}

#[tokio::test]
async fn impersonating_groups_without_a_user_is_an_internal_error() {
    let app = build_handler_chain(
        pods_router(),
        &ServerConfig::default(),
        &collaborators(None, Arc::new(FixedLevelPolicy(Level::None))),
    )
    .unwrap();

    let response = app
        .oneshot(with_headers(
            request(Method::GET, PODS, Some("jane-token")),
            &[("Impersonate-Group", "devs"), ("Impersonate-Extra-Scopes", "view")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_text(response)
        .await
        .contains("requested impersonation of groups or extra fields without a user"));
}

#[tokio::test]
async fn impersonated_identity_reaches_the_handler_without_headers() {
    let backend = InMemoryBackend::shared();
    let router = Router::new().route(
        PODS,
        get(|request: ExtractedRequest| async move {
            let user = RequestContext::from_request(&request)
                .and_then(|ctx| ctx.user().map(|u| u.name.clone()))
                .unwrap_or_default();
            let leftover = request
                .headers()
                .keys()
                .filter(|name| name.as_str().starts_with("impersonate-"))
                .count();
            Json(json!({ "user": user, "impersonation_headers": leftover }))
        }),
    );
    let app = build_handler_chain(
        router,
        &ServerConfig::default(),
        &collaborators(Some(backend.clone()), Arc::new(FixedLevelPolicy(Level::Metadata))),
    )
    .unwrap();

    let response = app
        .oneshot(with_headers(
            request(Method::GET, PODS, Some("jane-token")),
            &[
                ("Impersonate-User", "bob"),
                ("Impersonate-Group", "devs"),
                ("Impersonate-Extra-Scopes", "view"),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let seen: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(seen["user"], "bob");
    assert_eq!(seen["impersonation_headers"], 0);

    // the audit record keeps who actually authenticated
    let events = backend.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].user.name, "jane");
    assert_eq!(
        events[0].impersonated_user.as_ref().map(|u| u.name.as_str()),
        Some("bob")
    );
}

#[tokio::test]
async fn limiter_judges_the_impersonated_identity() {
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Semaphore::new(0));
    let mut config = ServerConfig::default();
    config.admission.max_requests_in_flight = 1;
    let app = build_handler_chain(
        blocking_router(entered_tx, Arc::clone(&release)),
        &config,
        &collaborators(None, Arc::new(FixedLevelPolicy(Level::None))),
    )
    .unwrap();

    let blocked = {
        let app = app.clone();
        tokio::spawn(async move {
            app.oneshot(request(Method::GET, PODS, Some("jane-token")))
                .await
                .unwrap()
                .status()
        })
    };
    entered_rx.recv().await.unwrap();

    let configmaps = "/api/v1/namespaces/default/configmaps";

    // an unprivileged caller acting as a privileged identity is admitted
    let response = app
        .clone()
        .oneshot(with_headers(
            request(Method::GET, configmaps, Some("jane-token")),
            &[("Impersonate-User", "root"), ("Impersonate-Group", SYSTEM_PRIVILEGED_GROUP)],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // a privileged caller acting as an ordinary user is shed
    let response = app
        .clone()
        .oneshot(with_headers(
            request(Method::GET, configmaps, Some("admin-token")),
            &[("Impersonate-User", "bob")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    release.add_permits(1);
    assert_eq!(blocked.await.unwrap(), StatusCode::OK);
}
