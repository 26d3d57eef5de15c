//! HTTP interface
//!
//! - `GET /api/server`: version, uptime, connection counters
//! - `GET /api/streams`: every stream in the registry
//! - `GET /api/streams/:app/:name`: one stream
//! - `GET /:app/:name.flv`: HTTP-FLV live playback

mod api;
mod flv;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::error::{Error, Result};
use crate::registry::StreamRegistry;
use crate::server::config::HttpConfig;
use crate::stats::ServerStats;

/// Shared state for every HTTP handler
#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<StreamRegistry>,
    pub stats: Arc<ServerStats>,
}

/// Build the router; `allow_origin` is `*` or one exact origin
pub fn router(state: HttpState, allow_origin: &str) -> Result<Router> {
    Ok(Router::new()
        .route("/api/server", get(api::server_info))
        .route("/api/streams", get(api::list_streams))
        .route("/api/streams/:app/:name", get(api::stream_info))
        .route("/:app/:file", get(flv::play))
        .layer(cors_layer(allow_origin)?)
        .with_state(state))
}

fn cors_layer(allow_origin: &str) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    if allow_origin == "*" {
        return Ok(layer.allow_origin(Any));
    }

    let origin = HeaderValue::from_str(allow_origin)
        .map_err(|_| Error::Config(format!("invalid allow_origin: {allow_origin}")))?;
    Ok(layer.allow_origin(AllowOrigin::exact(origin)))
}

/// HTTP server bound to its listening socket
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    pub async fn bind(
        config: &HttpConfig,
        registry: Arc<StreamRegistry>,
        stats: Arc<ServerStats>,
    ) -> Result<Self> {
        let router = router(HttpState { registry, stats }, &config.allow_origin)?;
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: config.bind_addr,
                source,
            })?;

        Ok(Self { listener, router })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(addr = %self.local_addr()?, "HTTP server listening");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use bytes::Bytes;
    use tower::ServiceExt;

    use crate::media::MediaFrame;
    use crate::registry::StreamKey;

    fn state() -> HttpState {
        HttpState {
            registry: Arc::new(StreamRegistry::new()),
            stats: Arc::new(ServerStats::new()),
        }
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::ORIGIN, "https://player.example.com")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_server_info() {
        let state = state();
        state.stats.connection_opened();
        let app = router(state, "*").unwrap();

        let response = app.oneshot(get_request("/api/server")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );

        let json = body_json(response).await;
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["connections"]["accepted"], 1);
        assert_eq!(json["connections"]["active"], 1);
        assert_eq!(json["streams"], 0);
    }

    #[tokio::test]
    async fn test_exact_origin() {
        let app = router(state(), "https://player.example.com").unwrap();

        let response = app.oneshot(get_request("/api/streams")).await.unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://player.example.com"
        );
    }

    #[test]
    fn test_invalid_origin_rejected() {
        assert!(matches!(
            router(state(), "bad\norigin"),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_list_and_get_stream() {
        let state = state();
        let key = StreamKey::new("live", "cam");
        let _handle = state.registry.register_publisher(&key, 7).await.unwrap();
        let app = router(state, "*").unwrap();

        let response = app
            .clone()
            .oneshot(get_request("/api/streams"))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["app"], "live");
        assert_eq!(json[0]["name"], "cam");
        assert_eq!(json[0]["publisher"], 7);

        let response = app
            .clone()
            .oneshot(get_request("/api/streams/live/cam"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["subscribers"], 0);

        let response = app
            .oneshot(get_request("/api/streams/live/missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_flv_requires_publisher() {
        let app = router(state(), "*").unwrap();

        let response = app
            .clone()
            .oneshot(get_request("/live/cam.flv"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(get_request("/live/cam.mp4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_flv_playback_until_end_of_stream() {
        let state = state();
        let registry = state.registry.clone();
        let key = StreamKey::new("live", "cam");
        let handle = registry.register_publisher(&key, 100).await.unwrap();

        let seq_header = MediaFrame::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 1]));
        let keyframe = MediaFrame::video(0, Bytes::from_static(&[0x17, 0x01, 0, 0, 0, 2, 3]));
        handle.publish(seq_header.clone()).await.unwrap();
        handle.publish(keyframe.clone()).await.unwrap();

        let app = router(state, "*").unwrap();
        let response = app.oneshot(get_request("/live/cam.flv")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/x-flv");

        let live = MediaFrame::video(40, Bytes::from_static(&[0x27, 0x01, 0, 0, 0, 4]));
        handle.publish(live.clone()).await.unwrap();
        registry.unregister_publisher(&key, 100).await;

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        // Only a video sequence header was published
        let mut expected = crate::media::flv::flv_header(false, true).to_vec();
        for frame in [&seq_header, &keyframe, &live] {
            expected.extend_from_slice(&crate::media::flv::flv_tag(frame));
        }
        assert_eq!(body.as_ref(), expected.as_slice());

        let stats = registry.stream_stats(&key).await;
        assert!(stats.is_none());
    }

    #[tokio::test]
    async fn test_flv_header_without_sequence_headers() {
        let state = state();
        let registry = state.registry.clone();
        let key = StreamKey::new("live", "cam");
        let handle = registry.register_publisher(&key, 100).await.unwrap();

        let app = router(state, "*").unwrap();
        let response = app.oneshot(get_request("/live/cam.flv")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let frame = MediaFrame::audio(0, Bytes::from_static(&[0xAF, 0x01, 0x21]));
        handle.publish(frame.clone()).await.unwrap();
        registry.unregister_publisher(&key, 100).await;

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut expected = crate::media::flv::flv_header(true, true).to_vec();
        expected.extend_from_slice(&crate::media::flv::flv_tag(&frame));
        assert_eq!(body.as_ref(), expected.as_slice());
    }
}
