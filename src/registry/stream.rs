//! Per-stream relay task
//!
//! Each stream key is owned by one task holding the publisher id, the
//! subscriber queues and the GOP cache. Sessions talk to it over a bounded
//! command channel, so fan-out never runs under a lock.
//!
//! ```text
//!   [Publisher] --Publish--> [StreamTask] --try_send--> [Subscriber queue] --> [Subscriber]
//!                                 |         --try_send--> [Subscriber queue] --> [Subscriber]
//!                              GopCache
//! ```

use std::collections::HashMap;
use std::ops::ControlFlow;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::config::RegistryConfig;
use super::error::RegistryError;
use super::frame::{RelayEvent, StreamKey};
use crate::media::{GopCache, MediaFrame};

/// Point-in-time view of one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub app: String,
    pub name: String,
    /// Session id of the publisher, if any
    pub publisher: Option<u64>,
    pub subscribers: usize,
    pub gop_frames: usize,
    pub gop_bytes: usize,
    pub frames_relayed: u64,
    /// Subscribers disconnected because their queue overflowed
    pub subscribers_dropped: u64,
    /// An audio sequence header has been seen
    pub has_audio: bool,
    /// A video sequence header has been seen
    pub has_video: bool,
}

pub(super) enum StreamCommand {
    RegisterPublisher {
        session_id: u64,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    /// Reply is true when the stream has neither publisher nor subscribers left
    UnregisterPublisher {
        session_id: u64,
        reply: oneshot::Sender<bool>,
    },
    AddSubscriber {
        session_id: u64,
        reply: oneshot::Sender<mpsc::Receiver<RelayEvent>>,
    },
    RemoveSubscriber {
        session_id: u64,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        session_id: u64,
        frame: MediaFrame,
    },
    Stats {
        reply: oneshot::Sender<StreamStats>,
    },
}

/// Publisher's handle to its stream
#[derive(Debug, Clone)]
pub struct StreamHandle {
    key: StreamKey,
    session_id: u64,
    tx: mpsc::Sender<StreamCommand>,
}

impl StreamHandle {
    pub(super) fn new(key: StreamKey, session_id: u64, tx: mpsc::Sender<StreamCommand>) -> Self {
        Self {
            key,
            session_id,
            tx,
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Relay a frame to every subscriber of the stream
    pub async fn publish(&self, frame: MediaFrame) -> Result<(), RegistryError> {
        self.tx
            .send(StreamCommand::Publish {
                session_id: self.session_id,
                frame,
            })
            .await
            .map_err(|_| RegistryError::StreamClosed(self.key.clone()))
    }
}

/// Subscriber's end of a stream: catch-up data first, then live frames
#[derive(Debug)]
pub struct Subscription {
    key: StreamKey,
    session_id: u64,
    rx: mpsc::Receiver<RelayEvent>,
}

impl Subscription {
    pub(super) fn new(key: StreamKey, session_id: u64, rx: mpsc::Receiver<RelayEvent>) -> Self {
        Self {
            key,
            session_id,
            rx,
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Next event; `None` means the stream dropped this subscriber
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        self.rx.try_recv().ok()
    }
}

pub(super) struct StreamTask {
    key: StreamKey,
    publisher: Option<u64>,
    subscribers: HashMap<u64, mpsc::Sender<RelayEvent>>,
    gop: GopCache,
    subscriber_queue: usize,
    frames_relayed: u64,
    subscribers_dropped: u64,
}

impl StreamTask {
    /// Start the task for `key`. It runs until every command sender is
    /// dropped or the stream is left with no publisher and no subscribers.
    pub(super) fn spawn(key: StreamKey, config: &RegistryConfig) -> mpsc::Sender<StreamCommand> {
        let (tx, rx) = mpsc::channel(config.command_queue.max(1));
        let task = Self {
            key,
            publisher: None,
            subscribers: HashMap::new(),
            gop: GopCache::new(config.gop_cache)
                .with_max_bytes(config.gop_max_bytes)
                .with_max_frames(config.gop_max_frames),
            subscriber_queue: config.subscriber_queue.max(1),
            frames_relayed: 0,
            subscribers_dropped: 0,
        };
        tokio::spawn(task.run(rx));
        tx
    }

    async fn run(mut self, mut rx: mpsc::Receiver<StreamCommand>) {
        tracing::debug!(stream = %self.key, "Stream task started");

        while let Some(command) = rx.recv().await {
            if self.handle(command).is_break() {
                break;
            }
        }

        tracing::debug!(stream = %self.key, "Stream task stopped");
    }

    /// Breaks once the stream is vacant; queued commands then fail with
    /// `StreamClosed` and the registry moves on to a fresh task.
    fn handle(&mut self, command: StreamCommand) -> ControlFlow<()> {
        // A dropped reply receiver only means the caller went away
        match command {
            StreamCommand::RegisterPublisher { session_id, reply } => {
                let _ = reply.send(self.register_publisher(session_id));
            }
            StreamCommand::UnregisterPublisher { session_id, reply } => {
                self.unregister_publisher(session_id);
                let vacant = self.is_vacant();
                let _ = reply.send(vacant);
                if vacant {
                    return ControlFlow::Break(());
                }
            }
            StreamCommand::AddSubscriber { session_id, reply } => {
                let _ = reply.send(self.add_subscriber(session_id));
            }
            StreamCommand::RemoveSubscriber { session_id, reply } => {
                if self.subscribers.remove(&session_id).is_some() {
                    tracing::debug!(
                        stream = %self.key,
                        session_id,
                        subscribers = self.subscribers.len(),
                        "Subscriber removed"
                    );
                }
                let vacant = self.is_vacant();
                let _ = reply.send(vacant);
                if vacant {
                    return ControlFlow::Break(());
                }
            }
            StreamCommand::Publish { session_id, frame } => self.publish(session_id, frame),
            StreamCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
        ControlFlow::Continue(())
    }

    fn register_publisher(&mut self, session_id: u64) -> Result<(), RegistryError> {
        if let Some(existing) = self.publisher {
            tracing::warn!(
                stream = %self.key,
                session_id,
                existing,
                "Publish rejected, stream already has a publisher"
            );
            return Err(RegistryError::AlreadyPublishing(self.key.clone()));
        }

        self.publisher = Some(session_id);
        tracing::info!(
            stream = %self.key,
            session_id,
            subscribers = self.subscribers.len(),
            "Publisher registered"
        );
        Ok(())
    }

    fn unregister_publisher(&mut self, session_id: u64) {
        if self.publisher != Some(session_id) {
            tracing::warn!(
                stream = %self.key,
                expected = ?self.publisher,
                actual = session_id,
                "Publisher unregister mismatch"
            );
            return;
        }

        // Live fan-out never takes the last slot, so the marker always fits
        for tx in self.subscribers.values() {
            let _ = tx.try_send(RelayEvent::EndOfStream);
        }
        let detached = self.subscribers.len();
        self.subscribers.clear();
        self.gop.clear();
        self.publisher = None;

        tracing::info!(
            stream = %self.key,
            session_id,
            detached,
            "Publisher unregistered"
        );
    }

    fn add_subscriber(&mut self, session_id: u64) -> mpsc::Receiver<RelayEvent> {
        let catchup = self.gop.catchup();
        // Catch-up, then the live queue, then one slot for end-of-stream
        let (tx, rx) = mpsc::channel(self.subscriber_queue + catchup.len() + 1);

        let catchup_frames = catchup.len();
        for frame in catchup {
            let _ = tx.try_send(RelayEvent::Frame(frame));
        }
        self.subscribers.insert(session_id, tx);

        tracing::info!(
            stream = %self.key,
            session_id,
            subscribers = self.subscribers.len(),
            catchup_frames,
            "Subscriber added"
        );
        rx
    }

    fn publish(&mut self, session_id: u64, frame: MediaFrame) {
        if self.publisher != Some(session_id) {
            return;
        }

        self.gop.on_message(&frame);
        self.frames_relayed += 1;

        let key = &self.key;
        let mut dropped = 0u64;
        self.subscribers.retain(|&subscriber, tx| {
            if tx.is_closed() {
                return false;
            }
            if tx.capacity() <= 1 {
                tracing::warn!(
                    stream = %key,
                    session_id = subscriber,
                    "Subscriber queue full, disconnecting"
                );
                dropped += 1;
                return false;
            }
            tx.try_send(RelayEvent::Frame(frame.clone())).is_ok()
        });
        self.subscribers_dropped += dropped;
    }

    fn is_vacant(&self) -> bool {
        self.publisher.is_none() && self.subscribers.is_empty()
    }

    fn stats(&self) -> StreamStats {
        StreamStats {
            app: self.key.app.clone(),
            name: self.key.name.clone(),
            publisher: self.publisher,
            subscribers: self.subscribers.len(),
            gop_frames: self.gop.frame_count(),
            gop_bytes: self.gop.size(),
            frames_relayed: self.frames_relayed,
            subscribers_dropped: self.subscribers_dropped,
            has_audio: self.gop.has_audio_header(),
            has_video: self.gop.has_video_header(),
        }
    }
}
