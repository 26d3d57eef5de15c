//! Stream registry implementation
//!
//! Maps stream keys to their stream tasks. The map lock is held only while
//! an entry is looked up, created or removed, never across a round trip to
//! a stream task. Media never passes through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot, RwLock};

use super::config::RegistryConfig;
use super::error::RegistryError;
use super::frame::StreamKey;
use super::stream::{StreamCommand, StreamHandle, StreamStats, StreamTask, Subscription};

/// Central registry for all streams
///
/// Shared as `Arc<StreamRegistry>` between the RTMP and HTTP front ends.
pub struct StreamRegistry {
    streams: RwLock<HashMap<StreamKey, mpsc::Sender<StreamCommand>>>,
    config: RegistryConfig,
    next_session_id: AtomicU64,
}

/// Send a command to a stream task and wait for its reply
async fn request<T>(
    tx: &mpsc::Sender<StreamCommand>,
    key: &StreamKey,
    build: impl FnOnce(oneshot::Sender<T>) -> StreamCommand,
) -> Result<T, RegistryError> {
    let (reply, rx) = oneshot::channel();
    tx.send(build(reply))
        .await
        .map_err(|_| RegistryError::StreamClosed(key.clone()))?;
    rx.await
        .map_err(|_| RegistryError::StreamClosed(key.clone()))
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            config,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Allocate a process-unique session id
    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `session_id` as the publisher of `key`, creating the stream
    /// if needed. Fails without side effects when the key is taken.
    pub async fn register_publisher(
        &self,
        key: &StreamKey,
        session_id: u64,
    ) -> Result<StreamHandle, RegistryError> {
        let (tx, result) = self
            .request_live(key, |reply| StreamCommand::RegisterPublisher { session_id, reply })
            .await;
        result?;
        Ok(StreamHandle::new(key.clone(), session_id, tx))
    }

    /// Detach the publisher: subscribers get end-of-stream and are dropped,
    /// and the key becomes available again.
    pub async fn unregister_publisher(&self, key: &StreamKey, session_id: u64) {
        let Some(tx) = self.existing(key).await else {
            return;
        };

        let vacant = request(&tx, key, |reply| StreamCommand::UnregisterPublisher {
            session_id,
            reply,
        })
        .await
        .unwrap_or(true);

        if vacant {
            self.prune(key, &tx).await;
        }
    }

    /// Subscribe `session_id` to `key`. An unknown key gets a publisher-less
    /// stream that waits for a publisher.
    pub async fn add_subscriber(
        &self,
        key: &StreamKey,
        session_id: u64,
    ) -> Result<Subscription, RegistryError> {
        let (_, rx) = self
            .request_live(key, |reply| StreamCommand::AddSubscriber { session_id, reply })
            .await;
        Ok(Subscription::new(key.clone(), session_id, rx))
    }

    /// Unsubscribe; a stream left with no publisher and no subscribers is removed
    pub async fn remove_subscriber(&self, key: &StreamKey, session_id: u64) {
        let Some(tx) = self.existing(key).await else {
            return;
        };

        let vacant = request(&tx, key, |reply| StreamCommand::RemoveSubscriber {
            session_id,
            reply,
        })
        .await
        .unwrap_or(true);

        if vacant {
            self.prune(key, &tx).await;
        }
    }

    async fn existing(&self, key: &StreamKey) -> Option<mpsc::Sender<StreamCommand>> {
        self.streams.read().await.get(key).cloned()
    }

    /// Command sender of the running task for `key`, spawning one if needed
    async fn live_sender(&self, key: &StreamKey) -> mpsc::Sender<StreamCommand> {
        if let Some(tx) = self.existing(key).await {
            if !tx.is_closed() {
                return tx;
            }
        }

        let mut streams = self.streams.write().await;
        match streams.get(key) {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let tx = StreamTask::spawn(key.clone(), &self.config);
                streams.insert(key.clone(), tx.clone());
                tx
            }
        }
    }

    /// Round trip to the task for `key`. A task that retired before
    /// answering is replaced and the command sent again.
    async fn request_live<T>(
        &self,
        key: &StreamKey,
        build: impl Fn(oneshot::Sender<T>) -> StreamCommand,
    ) -> (mpsc::Sender<StreamCommand>, T) {
        loop {
            let tx = self.live_sender(key).await;
            match request(&tx, key, &build).await {
                Ok(value) => return (tx, value),
                Err(_) => self.prune(key, &tx).await,
            }
        }
    }

    /// Drop the entry for `key` if it still points at `tx`
    async fn prune(&self, key: &StreamKey, tx: &mpsc::Sender<StreamCommand>) {
        let mut streams = self.streams.write().await;
        if streams.get(key).is_some_and(|current| current.same_channel(tx)) {
            streams.remove(key);
            tracing::debug!(stream = %key, "Stream removed");
        }
    }

    pub async fn stream_stats(&self, key: &StreamKey) -> Option<StreamStats> {
        let tx = self.streams.read().await.get(key).cloned()?;
        request(&tx, key, |reply| StreamCommand::Stats { reply })
            .await
            .ok()
    }

    /// Stats for every stream, ordered by key
    pub async fn list_streams(&self) -> Vec<StreamStats> {
        let mut entries: Vec<(StreamKey, mpsc::Sender<StreamCommand>)> = self
            .streams
            .read()
            .await
            .iter()
            .map(|(key, tx)| (key.clone(), tx.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::with_capacity(entries.len());
        for (key, tx) in entries {
            if let Ok(stats) = request(&tx, &key, |reply| StreamCommand::Stats { reply }).await {
                out.push(stats);
            }
        }
        out
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::media::MediaFrame;
    use crate::registry::RelayEvent;

    fn keyframe(timestamp: u32) -> MediaFrame {
        MediaFrame::video(timestamp, Bytes::from_static(&[0x17, 0x01, 0x00]))
    }

    fn interframe(timestamp: u32) -> MediaFrame {
        MediaFrame::video(timestamp, Bytes::from_static(&[0x27, 0x01, 0x00]))
    }

    /// Drain everything currently queued, after the stream task caught up
    async fn drain(
        registry: &StreamRegistry,
        key: &StreamKey,
        sub: &mut Subscription,
    ) -> Vec<RelayEvent> {
        // A stats round trip orders us after every earlier command
        registry.stream_stats(key).await;
        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        events
    }

    fn timestamps(events: &[RelayEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Frame(f) => Some(f.timestamp),
                RelayEvent::EndOfStream => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_duplicate_publish_rejected() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "alpha");

        let first = registry.register_publisher(&key, 1).await.unwrap();
        let result = registry.register_publisher(&key, 2).await;
        assert_eq!(result.unwrap_err(), RegistryError::AlreadyPublishing(key.clone()));

        // The first publisher still relays
        let mut sub = registry.add_subscriber(&key, 3).await.unwrap();
        first.publish(keyframe(0)).await.unwrap();
        let events = drain(&registry, &key, &mut sub).await;
        assert_eq!(timestamps(&events), vec![0]);

        let stats = registry.stream_stats(&key).await.unwrap();
        assert_eq!(stats.publisher, Some(1));
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_publish() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "alpha");

        let old = registry.register_publisher(&key, 1).await.unwrap();
        registry.unregister_publisher(&key, 1).await;
        let _new = registry.register_publisher(&key, 2).await.unwrap();
        let mut sub = registry.add_subscriber(&key, 3).await.unwrap();

        // The old stream task retired with its publisher
        assert!(old.publish(keyframe(0)).await.is_err());
        assert!(drain(&registry, &key, &mut sub).await.is_empty());
    }

    #[tokio::test]
    async fn test_late_joiner_gets_snapshot_then_live() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "alpha");
        let publisher = registry.register_publisher(&key, 1).await.unwrap();

        publisher.publish(interframe(0)).await.unwrap();
        publisher.publish(keyframe(33)).await.unwrap();
        publisher.publish(interframe(66)).await.unwrap();

        let mut sub = registry.add_subscriber(&key, 2).await.unwrap();
        publisher.publish(interframe(100)).await.unwrap();
        publisher.publish(keyframe(133)).await.unwrap();

        let events = drain(&registry, &key, &mut sub).await;
        assert_eq!(timestamps(&events), vec![33, 66, 100, 133]);
    }

    #[tokio::test]
    async fn test_gop_cache_disabled_only_live_frames() {
        let registry = StreamRegistry::with_config(RegistryConfig::default().gop_cache(false));
        let key = StreamKey::new("live", "alpha");
        let publisher = registry.register_publisher(&key, 1).await.unwrap();

        let header = MediaFrame::video(0, Bytes::from_static(&[0x17, 0x00, 0x01]));
        publisher.publish(header.clone()).await.unwrap();
        publisher.publish(keyframe(0)).await.unwrap();
        publisher.publish(interframe(33)).await.unwrap();

        let mut sub = registry.add_subscriber(&key, 2).await.unwrap();
        publisher.publish(interframe(66)).await.unwrap();

        let events = drain(&registry, &key, &mut sub).await;
        assert_eq!(events[0], RelayEvent::Frame(header));
        assert_eq!(timestamps(&events[1..]), vec![66]);
    }

    #[tokio::test]
    async fn test_scenario_alpha() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "alpha");

        let publisher = registry.register_publisher(&key, 1).await.unwrap();
        let mut s1 = registry.add_subscriber(&key, 2).await.unwrap();

        publisher.publish(keyframe(0)).await.unwrap();
        publisher.publish(interframe(33)).await.unwrap();
        publisher.publish(interframe(66)).await.unwrap();

        let mut s2 = registry.add_subscriber(&key, 3).await.unwrap();
        publisher.publish(interframe(100)).await.unwrap();

        registry.unregister_publisher(&key, 1).await;

        let e1 = drain(&registry, &key, &mut s1).await;
        let e2 = drain(&registry, &key, &mut s2).await;
        assert_eq!(timestamps(&e1), vec![0, 33, 66, 100]);
        assert_eq!(timestamps(&e2), vec![0, 33, 66, 100]);
        assert_eq!(e1.last(), Some(&RelayEvent::EndOfStream));
        assert_eq!(e2.last(), Some(&RelayEvent::EndOfStream));

        // Detached: queues are closed once drained
        assert!(s1.recv().await.is_none());
        assert!(s2.recv().await.is_none());

        assert_eq!(registry.stream_count().await, 0);
        assert!(registry.stream_stats(&key).await.is_none());

        // Key is publishable again
        registry.register_publisher(&key, 4).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_before_publisher() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "alpha");

        let mut sub = registry.add_subscriber(&key, 1).await.unwrap();
        let stats = registry.stream_stats(&key).await.unwrap();
        assert_eq!(stats.publisher, None);
        assert_eq!(stats.subscribers, 1);

        let publisher = registry.register_publisher(&key, 2).await.unwrap();
        publisher.publish(keyframe(0)).await.unwrap();
        assert_eq!(timestamps(&drain(&registry, &key, &mut sub).await), vec![0]);
    }

    #[tokio::test]
    async fn test_last_subscriber_removes_waiting_stream() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "alpha");

        let _sub = registry.add_subscriber(&key, 1).await.unwrap();
        assert_eq!(registry.stream_count().await, 1);

        registry.remove_subscriber(&key, 1).await;
        assert_eq!(registry.stream_count().await, 0);

        // Unknown key is a no-op
        registry.remove_subscriber(&key, 1).await;
    }

    #[tokio::test]
    async fn test_remove_subscriber_keeps_published_stream() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "alpha");

        let _publisher = registry.register_publisher(&key, 1).await.unwrap();
        let _sub = registry.add_subscriber(&key, 2).await.unwrap();
        registry.remove_subscriber(&key, 2).await;

        let stats = registry.stream_stats(&key).await.unwrap();
        assert_eq!(stats.subscribers, 0);
        assert_eq!(stats.publisher, Some(1));
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped() {
        let registry =
            StreamRegistry::with_config(RegistryConfig::default().subscriber_queue(2).gop_cache(false));
        let key = StreamKey::new("live", "alpha");
        let publisher = registry.register_publisher(&key, 1).await.unwrap();

        let mut slow = registry.add_subscriber(&key, 2).await.unwrap();
        let mut fast = registry.add_subscriber(&key, 3).await.unwrap();

        for ts in 0..3u32 {
            publisher.publish(interframe(ts)).await.unwrap();
            // Keep the fast subscriber drained
            let _ = drain(&registry, &key, &mut fast).await;
        }

        let stats = registry.stream_stats(&key).await.unwrap();
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.subscribers_dropped, 1);

        // The slow one still gets what fit, then sees its queue close
        assert_eq!(timestamps(&drain(&registry, &key, &mut slow).await), vec![0, 1]);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_end_of_stream_reaches_full_queue() {
        let registry =
            StreamRegistry::with_config(RegistryConfig::default().subscriber_queue(2).gop_cache(false));
        let key = StreamKey::new("live", "alpha");
        let publisher = registry.register_publisher(&key, 1).await.unwrap();
        let mut sub = registry.add_subscriber(&key, 2).await.unwrap();

        publisher.publish(interframe(0)).await.unwrap();
        publisher.publish(interframe(33)).await.unwrap();

        let stats = registry.stream_stats(&key).await.unwrap();
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.subscribers_dropped, 0);

        registry.unregister_publisher(&key, 1).await;

        let events = drain(&registry, &key, &mut sub).await;
        assert_eq!(timestamps(&events), vec![0, 33]);
        assert_eq!(events.last(), Some(&RelayEvent::EndOfStream));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_end_of_stream_after_catchup_fills_queue() {
        let registry = StreamRegistry::with_config(RegistryConfig::default().subscriber_queue(1));
        let key = StreamKey::new("live", "alpha");
        let publisher = registry.register_publisher(&key, 1).await.unwrap();

        publisher.publish(keyframe(0)).await.unwrap();
        publisher.publish(interframe(33)).await.unwrap();

        let mut sub = registry.add_subscriber(&key, 2).await.unwrap();
        publisher.publish(interframe(66)).await.unwrap();
        registry.unregister_publisher(&key, 1).await;

        let mut events = Vec::new();
        while let Some(event) = sub.recv().await {
            events.push(event);
        }
        assert_eq!(timestamps(&events), vec![0, 33, 66]);
        assert_eq!(events.last(), Some(&RelayEvent::EndOfStream));
    }

    #[tokio::test]
    async fn test_stream_stats_report_sequence_headers() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "alpha");
        let publisher = registry.register_publisher(&key, 1).await.unwrap();

        publisher
            .publish(MediaFrame::video(0, Bytes::from_static(&[0x17, 0x00, 0x01])))
            .await
            .unwrap();

        let stats = registry.stream_stats(&key).await.unwrap();
        assert!(stats.has_video);
        assert!(!stats.has_audio);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_and_leave() {
        let registry = Arc::new(StreamRegistry::new());
        let key = StreamKey::new("live", "alpha");

        let mut tasks = Vec::new();
        for session_id in 1..=32u64 {
            let registry = Arc::clone(&registry);
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let _sub = registry.add_subscriber(&key, session_id).await.unwrap();
                    registry.remove_subscriber(&key, session_id).await;
                }
            }));
        }

        // Other keys stay usable while one stream churns
        let other = StreamKey::new("live", "beta");
        let _publisher = registry.register_publisher(&other, 100).await.unwrap();
        let stats = registry.stream_stats(&other).await.unwrap();
        assert_eq!(stats.publisher, Some(100));

        for task in tasks {
            task.await.unwrap();
        }

        assert!(registry.stream_stats(&key).await.is_none());
        assert_eq!(registry.stream_count().await, 1);

        let _sub = registry.add_subscriber(&key, 200).await.unwrap();
        assert_eq!(registry.stream_stats(&key).await.unwrap().subscribers, 1);
    }

    #[tokio::test]
    async fn test_list_streams_sorted() {
        let registry = StreamRegistry::new();
        let _b = registry.register_publisher(&StreamKey::new("live", "b"), 1).await.unwrap();
        let _a = registry.register_publisher(&StreamKey::new("live", "a"), 2).await.unwrap();

        let names: Vec<String> = registry
            .list_streams()
            .await
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_session_ids_unique() {
        let registry = StreamRegistry::new();
        let a = registry.next_session_id();
        let b = registry.next_session_id();
        assert_ne!(a, b);
    }
}
