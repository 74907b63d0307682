//! HTTP surface of the preview service

use crate::{
    CacheKey, PreviewError, PreviewImage, PreviewPageConfig, PreviewService,
    RequestContext, IMAGES_ROUTE,
};
use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::future::Future;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{info, warn};
use url::Url;

const FORWARDED_PROTO: &str = "x-forwarded-proto";

#[derive(Clone)]
pub struct AppState {
    pub service: PreviewService,
    pub metrics_handle: Option<PrometheusHandle>,
    pub started_at: DateTime<Utc>,
}

/// Build the router (shared between `serve` and tests).
pub fn build_app(service: PreviewService, metrics_handle: Option<PrometheusHandle>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let images = ServeDir::new(service.store().base_dir());

    let mut router = Router::new()
        .route("/", get(index_handler))
        .route("/generate_og_image", get(generate_og_image_handler))
        .route("/preview/{date}", get(preview_page_handler))
        .route("/ice/delete-all", get(delete_all_handler))
        .route("/health", get(health_handler));

    if metrics_handle.is_some() {
        router = router.route("/metrics", get(prometheus_metrics_handler));
    }

    let state = AppState {
        service,
        metrics_handle,
        started_at: Utc::now(),
    };

    router
        .nest_service(&format!("/{IMAGES_ROUTE}"), images)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn serve<F>(
    service: PreviewService,
    metrics_handle: Option<PrometheusHandle>,
    shutdown: F,
) -> Result<(), PreviewError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!(
        "{}:{}",
        service.config().server.bind,
        service.config().server.port
    );

    service.ensure_ready().await?;
    let app = build_app(service, metrics_handle);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| PreviewError::ServerError(format!("cannot bind {addr}: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| PreviewError::ServerError(e.to_string()))?;
    info!("Server is running on {local}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| PreviewError::ServerError(e.to_string()))?;

    info!("Server stopped");
    Ok(())
}

impl IntoResponse for PreviewError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Scheme and host the client used to reach us.
///
/// `X-Forwarded-Proto` is only consulted when `trust_forwarded_proto` is set,
/// and only `http`/`https` are accepted from it.
pub fn request_context(headers: &HeaderMap, trust_forwarded_proto: bool) -> RequestContext {
    let forwarded = trust_forwarded_proto
        .then(|| headers.get(FORWARDED_PROTO))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| v == "http" || v == "https");

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("localhost");

    RequestContext::new(forwarded.unwrap_or_else(|| "http".to_string()), host)
}

#[derive(Template)]
#[template(path = "preview.html", escape = "html")]
struct PreviewPageTemplate<'a> {
    title: &'a str,
    description: &'a str,
    image_url: &'a str,
    page_url: &'a str,
    date: &'a str,
    /// JSON string literal of the redirect target, inserted unescaped.
    redirect_literal: Option<String>,
}

/// Render the open-graph page for `key`.
pub fn render_preview_page(
    page: &PreviewPageConfig,
    image_url: &str,
    page_url: &str,
    key: &CacheKey,
) -> Result<String, PreviewError> {
    let title = format!("{} {}", page.title_prefix, display_date(key));

    let redirect = page.site_url.as_deref().and_then(|site| {
        let mut url = Url::parse(site).ok()?;
        url.query_pairs_mut().clear().append_pair("date", key.as_str());
        Some(url.to_string())
    });

    // A JSON string is a valid JS string literal; `</` must not end the script.
    let redirect_literal = redirect
        .map(|target| serde_json::to_string(&target).map(|json| json.replace("</", "<\\/")))
        .transpose()
        .map_err(|e| PreviewError::ServerError(format!("cannot encode redirect target: {e}")))?;

    PreviewPageTemplate {
        title: &title,
        description: &page.description,
        image_url,
        page_url,
        date: key.as_str(),
        redirect_literal,
    }
    .render()
    .map_err(|e| PreviewError::ServerError(format!("failed to render preview page for {key}: {e}")))
}

/// `2024-05-01` reads as `Wed May 01 2024`; anything else is shown as is.
fn display_date(key: &CacheKey) -> String {
    NaiveDate::parse_from_str(key.as_str(), "%Y-%m-%d")
        .map(|date| date.format("%a %b %d %Y").to_string())
        .unwrap_or_else(|_| key.to_string())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn index_handler() -> &'static str {
    "Open-graph preview manager is running!"
}

async fn generate_og_image_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PreviewImage>, PreviewError> {
    let ctx = request_context(&headers, state.service.config().trust_forwarded_proto);
    let preview = state
        .service
        .generate_preview(&ctx, params.get("url").map(String::as_str))
        .await?;
    Ok(Json(preview))
}

async fn preview_page_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(date): Path<String>,
) -> Result<Html<String>, PreviewError> {
    let key = CacheKey::new(date)?;
    let ctx = request_context(&headers, state.service.config().trust_forwarded_proto);

    let image_url = state.service.store().resolve_url(&ctx, &key);
    let page_url = preview_page_url(&ctx, &key);

    Ok(Html(render_preview_page(
        &state.service.config().preview,
        &image_url,
        &page_url,
        &key,
    )?))
}

fn preview_page_url(ctx: &RequestContext, key: &CacheKey) -> String {
    match Url::parse(&format!("{}://{}/", ctx.scheme, ctx.host)) {
        Ok(mut url) => {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.clear().push("preview").push(key.as_str());
            }
            url.to_string()
        }
        Err(_) => format!("{}://{}/preview/{}", ctx.scheme, ctx.host, key),
    }
}

async fn delete_all_handler(State(state): State<AppState>) -> Result<impl IntoResponse, PreviewError> {
    let deleted = state.service.purge().await?;
    Ok(Json(serde_json::json!({
        "message": "All images deleted successfully",
        "deleted": deleted,
    })))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "in_flight": state.service.in_flight_count(),
        "started_at": state.started_at.to_rfc3339(),
    }))
}

async fn prometheus_metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics_handle.as_ref() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Metrics not enabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn key(value: &str) -> CacheKey {
        CacheKey::new(value).unwrap()
    }

    #[test]
    fn test_request_context_uses_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("preview.example.com"));
        headers.insert(FORWARDED_PROTO, HeaderValue::from_static("https"));

        let ctx = request_context(&headers, false);
        assert_eq!(ctx, RequestContext::new("http", "preview.example.com"));
    }

    #[test]
    fn test_request_context_trusts_forwarded_proto_when_enabled() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("preview.example.com"));
        headers.insert(FORWARDED_PROTO, HeaderValue::from_static("HTTPS, http"));
        assert_eq!(request_context(&headers, true).scheme, "https");

        headers.insert(FORWARDED_PROTO, HeaderValue::from_static("gopher"));
        assert_eq!(request_context(&headers, true).scheme, "http");
    }

    #[test]
    fn test_request_context_without_host() {
        let ctx = request_context(&HeaderMap::new(), true);
        assert_eq!(ctx, RequestContext::new("http", "localhost"));
    }

    #[test]
    fn test_preview_page_with_redirect() {
        let page = PreviewPageConfig {
            site_url: Some("https://timetable.example.com".to_string()),
            ..Default::default()
        };
        let html = render_preview_page(
            &page,
            "https://cdn.example.com/images/2024-05-01.png",
            "https://cdn.example.com/preview/2024-05-01",
            &key("2024-05-01"),
        )
        .unwrap();

        assert!(html.contains(
            r#"<meta property="og:title" content="Lecture Schedule for Wed May 01 2024" />"#
        ));
        assert!(html.contains(
            r#"<meta property="og:image" content="https://cdn.example.com/images/2024-05-01.png" />"#
        ));
        assert!(html.contains(r#"window.location.href = "https://timetable.example.com/?date=2024-05-01";"#));
        assert!(html.contains("<title>Timetable preview-2024-05-01</title>"));
    }

    #[test]
    fn test_preview_page_without_site_has_no_redirect() {
        let html = render_preview_page(
            &PreviewPageConfig::default(),
            "http://localhost/images/x.png",
            "http://localhost/preview/x",
            &key("x"),
        )
        .unwrap();
        assert!(!html.contains("<script>"));
        assert!(html.contains(r#"content="Lecture Schedule for x""#));
    }

    #[test]
    fn test_preview_page_escapes_key() {
        let page = PreviewPageConfig {
            site_url: Some("https://timetable.example.com/".to_string()),
            ..Default::default()
        };
        let html = render_preview_page(
            &page,
            "http://localhost/images/a.png",
            "http://localhost/preview/a",
            &key("<b>\"x\""),
        )
        .unwrap();

        assert!(!html.contains("<b>"));
        assert!(html.contains("<title>Timetable preview-&lt;b&gt;"));
        assert!(html.contains("?date=%3Cb%3E%22x%22"));
    }

    #[test]
    fn test_preview_page_redirect_is_a_script_string() {
        let page = PreviewPageConfig {
            site_url: Some("https://timetable.example.com/".to_string()),
            ..Default::default()
        };
        let html = render_preview_page(
            &page,
            "http://localhost/images/a.png",
            "http://localhost/preview/a",
            &key("\";alert(1);\""),
        )
        .unwrap();

        assert!(!html.contains("alert(1);\""));
        assert!(html.contains(r#"window.location.href = "https://timetable.example.com/?date=%22%3Balert%281%29%3B%22";"#));
        assert_eq!(html.matches("</script>").count(), 1);
    }

    #[test]
    fn test_preview_page_url_encodes_key() {
        let ctx = RequestContext::new("http", "localhost:3000");
        assert_eq!(
            preview_page_url(&ctx, &key("May 1")),
            "http://localhost:3000/preview/May%201"
        );
    }

    #[test]
    fn test_error_response_status() {
        let response = PreviewError::MissingParameter.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = PreviewError::ScreenshotCaptureFailed.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
