pub mod auth;
pub mod error;
pub mod frontend;
pub mod middleware;
pub mod proxy;
pub mod registry;
pub mod settings;
pub mod state;
pub mod tls;
pub mod token;

use anyhow::{anyhow, Context, Result};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use state::AppState;
use std::net::SocketAddr;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

/// How long open connections may take to finish after a shutdown signal (TLS listener)
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Run the proxy until a shutdown signal arrives or the upstream credentials can no
/// longer be kept valid
pub async fn run_server(settings: settings::Settings) -> Result<()> {
    let tls_config = match &settings.server.tls {
        Some(tls_settings) => Some(tls::load_rustls_config(tls_settings).await?),
        None => None,
    };

    let http_client = state::build_http_client(&settings.server)?;

    let token_endpoint =
        registry::discovery::discover_token_endpoint(&http_client, &settings.registry.host)
            .await
            .context("Failed to discover the registry token endpoint")?;
    info!("Discovered registry token endpoint: {}", token_endpoint);

    let auth::InitializedAuth {
        authenticator,
        refresh_task,
    } = auth::init_authenticator(&settings.auth, &http_client).await?;

    let registry_base = registry::rewrite::registry_base_url(&settings.registry.host)
        .with_context(|| format!("Invalid registry host '{}'", settings.registry.host))?;

    let state = AppState::new(
        settings.registry.clone(),
        registry_base,
        token_endpoint,
        authenticator,
        http_client,
    );
    let app = build_router(state, settings.server.browser_redirects);

    let addr = resolve_listen_addr(&settings.server.host, settings.server.port).await?;
    info!(
        "Proxying {}/{} (browser redirects {})",
        settings.registry.host,
        settings.registry.repo_prefix,
        if settings.server.browser_redirects {
            "enabled"
        } else {
            "disabled"
        }
    );

    let server = serve(app, addr, tls_config);

    match refresh_task {
        Some(mut refresh_task) => {
            tokio::select! {
                result = server => {
                    refresh_task.abort();
                    result
                }
                joined = &mut refresh_task => match joined {
                    Ok(Ok(())) => Err(anyhow!("Metadata token refresh task stopped unexpectedly")),
                    Ok(Err(e)) => Err(e).context("Upstream credentials expired, shutting down"),
                    Err(e) => Err(e).context("Metadata token refresh task failed"),
                },
            }
        }
        None => server.await,
    }
}

/// Build the proxy router.
///
/// `/_token` and `/v2/...` are proxied; everything else is redirected to the
/// registry's web UI, or answered with 404 when `browser_redirects` is off.
pub fn build_router(state: AppState, browser_redirects: bool) -> Router {
    let router = Router::new()
        .merge(token::routes::routes())
        .merge(registry::routes::routes());

    let router = if browser_redirects {
        router.fallback(frontend::routes::browser_redirect)
    } else {
        router.fallback(frontend::routes::not_found)
    };

    router.with_state(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(axum::middleware::from_fn(middleware::request_id_middleware))
            .layer(axum::middleware::from_fn(
                middleware::capture_host_middleware,
            )),
    )
}

async fn resolve_listen_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let addr = format!("{}:{}", host, port);
    let resolved = tokio::net::lookup_host(&addr)
        .await
        .with_context(|| format!("Failed to resolve listen address {}", addr))?
        .next();
    resolved.ok_or_else(|| anyhow!("Listen address {} did not resolve", addr))
}

async fn serve(app: Router, addr: SocketAddr, tls_config: Option<RustlsConfig>) -> Result<()> {
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    match tls_config {
        Some(tls_config) => {
            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown_handle.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
            });

            info!("HTTPS server listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(make_service)
                .await
                .context("HTTPS server failed")?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;

            info!("HTTP server listening on http://{}", addr);
            axum::serve(listener, make_service)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("HTTP server failed")?;
        }
    }

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::auth::{Authenticator, StaticHeaderAuthenticator};
    use crate::server::proxy::PROXY_USER_AGENT;
    use crate::server::registry::models::RegistryConfig;
    use std::sync::Arc;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use tower::ServiceExt; // for `oneshot`
    use url::Url;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_state(registry_base: &str, token_endpoint: &str) -> AppState {
        state_with_auth(registry_base, token_endpoint, None)
    }

    fn state_with_auth(
        registry_base: &str,
        token_endpoint: &str,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> AppState {
        AppState::new(
            RegistryConfig::new("gcr.io", "myorg"),
            Url::parse(registry_base).unwrap(),
            Url::parse(token_endpoint).unwrap(),
            authenticator,
            reqwest::Client::new(),
        )
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, "registry.example.org")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_token_route_rewrites_scope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("scope", "repository:myorg/app:pull"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let app = build_router(
            test_state("https://gcr.io", &format!("{}/token", server.uri())),
            true,
        );
        let response = app
            .oneshot(get("/_token?scope=repository%3Aapp%3Apull"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_token_route_without_scope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let app = build_router(
            test_state("https://gcr.io", &format!("{}/token", server.uri())),
            true,
        );
        let response = app
            .oneshot(get("/_token?service=gcr.io&account=me"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].url.query(), Some("service=gcr.io&account=me"));
    }

    #[tokio::test]
    async fn test_browser_redirect() {
        let app = build_router(test_state("https://gcr.io", "https://gcr.io/v2/token"), true);
        let response = app.oneshot(get("/my-image")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://gcr.io/myorg/my-image"
        );
    }

    #[tokio::test]
    async fn test_browser_redirects_disabled() {
        let app = build_router(test_state("https://gcr.io", "https://gcr.io/v2/token"), false);
        let response = app.oneshot(get("/my-image")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"error": "Not found"})
        );
    }

    #[tokio::test]
    async fn test_api_root_without_slash_redirects() {
        let app = build_router(test_state("https://gcr.io", "https://gcr.io/v2/token"), true);
        let response = app.oneshot(get("/v2")).await.unwrap();

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/v2/");
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_bad_gateway() {
        let app = build_router(
            test_state("https://127.0.0.1:1", "https://127.0.0.1:1/token"),
            true,
        );
        let response = app
            .oneshot(get("/v2/library/ubuntu/manifests/latest"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"error": "Upstream registry request failed"})
        );
    }

    #[tokio::test]
    async fn test_api_root_is_proxied_not_redirected() {
        let app = build_router(
            test_state("https://127.0.0.1:1", "https://127.0.0.1:1/token"),
            true,
        );
        let response = app.oneshot(get("/v2/")).await.unwrap();

        // Proxied (and failing upstream), never sent to the browser redirect
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_registry_request_forwarded_and_challenge_rewritten() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/myorg/library/ubuntu/manifests/latest"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header(
                        "www-authenticate",
                        r#"Bearer realm="https://gcr.io/v2/token",service="gcr.io""#,
                    )
                    .set_body_raw(r#"{"errors":[{"code":"UNAUTHORIZED"}]}"#, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let app = build_router(
            state_with_auth(
                &server.uri(),
                "https://gcr.io/v2/token",
                Some(Arc::new(StaticHeaderAuthenticator::new("Bearer upstream-token"))),
            ),
            true,
        );
        let request = Request::builder()
            .uri("/v2/library/ubuntu/manifests/latest")
            .header(header::HOST, "registry.example.org")
            .header(header::USER_AGENT, "docker/24.0.7")
            .header(header::ACCEPT, "application/vnd.oci.image.index.v1+json")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            r#"Bearer realm="https://registry.example.org/_token",service="gcr.io""#
        );
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"errors": [{"code": "UNAUTHORIZED"}]})
        );

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let upstream = &received[0].headers;
        assert_eq!(
            upstream.get("authorization").unwrap(),
            "Bearer upstream-token"
        );
        assert_eq!(upstream.get("accept").unwrap(), "*/*");
        assert_eq!(
            upstream.get("user-agent").unwrap().to_str().unwrap(),
            format!(
                "{} customDomain/registry.example.org docker/24.0.7",
                PROXY_USER_AGENT
            )
        );
    }

    #[tokio::test]
    async fn test_registry_upload_body_and_query_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/myorg/app/blobs/uploads/abc"))
            .and(query_param("digest", "sha256:0123"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("location", "/v2/myorg/app/blobs/sha256:0123"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let app = build_router(
            test_state(&server.uri(), "https://gcr.io/v2/token"),
            true,
        );
        let request = Request::builder()
            .method("PUT")
            .uri("/v2/app/blobs/uploads/abc?digest=sha256%3A0123")
            .header(header::HOST, "registry.example.org")
            .header(header::AUTHORIZATION, "Bearer client-token")
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from("layer-bytes"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/v2/myorg/app/blobs/sha256:0123"
        );

        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].body, b"layer-bytes".to_vec());
        assert_eq!(
            received[0].headers.get("authorization").unwrap(),
            "Bearer client-token"
        );
    }

    #[tokio::test]
    async fn test_resolve_listen_addr() {
        let addr = resolve_listen_addr("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
    }
}
