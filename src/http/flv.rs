//! HTTP-FLV playback
//!
//! One registry subscriber per request. The body is the FLV file header,
//! then one tag per relayed frame (catch-up first), and ends when the
//! publisher leaves. The header advertises the tracks whose sequence
//! headers the stream has cached, or both when none has arrived yet.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::stream;

use super::HttpState;
use crate::media::flv::{flv_header, flv_tag};
use crate::registry::{RelayEvent, StreamKey, StreamRegistry, Subscription};

/// GET /:app/:name.flv
pub(super) async fn play(
    Path((app, file)): Path<(String, String)>,
    State(state): State<HttpState>,
) -> Result<Response, StatusCode> {
    let name = file.strip_suffix(".flv").ok_or(StatusCode::NOT_FOUND)?;
    let key = StreamKey::new(app, name);

    let stats = state
        .registry
        .stream_stats(&key)
        .await
        .filter(|stats| stats.publisher.is_some())
        .ok_or(StatusCode::NOT_FOUND)?;
    let header = match (stats.has_audio, stats.has_video) {
        (false, false) => flv_header(true, true),
        (has_audio, has_video) => flv_header(has_audio, has_video),
    };

    let session_id = state.registry.next_session_id();
    let subscription = state
        .registry
        .add_subscriber(&key, session_id)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;

    tracing::info!(session_id, stream = %key, "HTTP-FLV playing started");

    let playback = FlvPlayback {
        subscription,
        registry: Arc::clone(&state.registry),
        header: Some(header),
        finished: false,
    };
    let body = stream::unfold(playback, |mut playback| async move {
        let chunk = playback.next_chunk().await?;
        Some((Ok::<Bytes, Infallible>(chunk), playback))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/x-flv")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

struct FlvPlayback {
    subscription: Subscription,
    registry: Arc<StreamRegistry>,
    /// FLV file header, sent before the first tag
    header: Option<Bytes>,
    /// The stream task already detached this subscriber
    finished: bool,
}

impl FlvPlayback {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        if let Some(header) = self.header.take() {
            return Some(header);
        }

        match self.subscription.recv().await {
            Some(RelayEvent::Frame(frame)) => Some(flv_tag(&frame)),
            Some(RelayEvent::EndOfStream) => {
                self.finished = true;
                None
            }
            None => {
                tracing::warn!(
                    session_id = self.subscription.session_id(),
                    stream = %self.subscription.key(),
                    "HTTP-FLV subscriber fell behind and was dropped"
                );
                self.finished = true;
                None
            }
        }
    }
}

impl Drop for FlvPlayback {
    fn drop(&mut self) {
        let key = self.subscription.key().clone();
        let session_id = self.subscription.session_id();
        tracing::info!(session_id, stream = %key, "HTTP-FLV playing stopped");

        if self.finished {
            return;
        }

        // Client went away mid-stream
        let registry = Arc::clone(&self.registry);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                registry.remove_subscriber(&key, session_id).await;
            });
        }
    }
}
