//! Per-connection RTMP handler
//!
//! Drives a single session through its lifecycle:
//! 1. Handshake (bounded by the handshake timeout)
//! 2. `connect`, `createStream`
//! 3. `publish` (relay media into the registry) or `play` (relay out of it)
//! 4. Close, always deregistering from the registry first

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};

use crate::amf::AmfValue;
use crate::error::{Error, HandshakeError, ProtocolError, Result};
use crate::media::{FrameKind, MediaFrame};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
use crate::protocol::constants::*;
use crate::protocol::handshake::{Handshake, HandshakeRole};
use crate::protocol::message::{
    Command, ConnectParams, DataMessage, PlayParams, PublishParams, RtmpMessage, UserControlEvent,
};
use crate::registry::{RegistryError, RelayEvent, StreamHandle, StreamKey, StreamRegistry, Subscription};
use crate::server::config::ServerConfig;
use crate::session::{CloseReason, LivenessAction, LivenessMonitor, SessionEvent, SessionState};
use crate::stats::ServerStats;

/// Per-connection handler
pub struct Connection<S> {
    state: SessionState,

    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
    read_buf: BytesMut,
    write_buf: BytesMut,

    chunk_decoder: ChunkDecoder,
    chunk_encoder: ChunkEncoder,

    config: ServerConfig,
    registry: Arc<StreamRegistry>,
    stats: Arc<ServerStats>,
    liveness: LivenessMonitor,

    /// Set while publishing
    publisher: Option<StreamHandle>,
    /// Set while playing
    subscription: Option<Subscription>,
}

/// Wait for the next relay event, or forever when not subscribed
async fn next_relay_event(subscription: &mut Option<Subscription>) -> Option<RelayEvent> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        session_id: u64,
        socket: S,
        peer_addr: SocketAddr,
        config: ServerConfig,
        registry: Arc<StreamRegistry>,
        stats: Arc<ServerStats>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(socket);

        Self {
            state: SessionState::new(session_id, peer_addr),
            reader: BufReader::with_capacity(config.read_buffer_size, read_half),
            writer: BufWriter::new(write_half),
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            write_buf: BytesMut::new(),
            chunk_decoder: ChunkDecoder::with_max_message_size(config.max_message_size),
            chunk_encoder: ChunkEncoder::new(),
            liveness: LivenessMonitor::new(config.ping_interval, config.ping_timeout, Instant::now()),
            config,
            registry,
            stats,
            publisher: None,
            subscription: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Run the session to completion and deregister it
    pub async fn run(&mut self) -> Result<CloseReason> {
        let result = self.serve().await;

        let reason = match &result {
            Ok(()) => self.state.close_reason().unwrap_or(CloseReason::Disconnected),
            Err(e) => close_reason_for(e),
        };
        self.close(reason).await;

        if matches!(
            reason,
            CloseReason::ProtocolViolation | CloseReason::HandshakeFailed
        ) {
            self.stats.connection_rejected();
        }

        tracing::debug!(
            session_id = self.state.id,
            peer = %self.state.peer_addr,
            reason = ?reason,
            bytes_in = self.state.bytes_received,
            bytes_out = self.state.bytes_sent,
            "Session closed"
        );

        result.map(|()| reason)
    }

    async fn serve(&mut self) -> Result<()> {
        timeout(self.config.handshake_timeout, self.do_handshake())
            .await
            .map_err(|_| HandshakeError::Timeout)??;
        self.state.transition(SessionEvent::HandshakeComplete)?;

        // Announce our chunk size, then switch the encoder to it
        self.send_message(
            CSID_PROTOCOL_CONTROL,
            0,
            0,
            RtmpMessage::SetChunkSize(self.config.chunk_size),
        )
        .await?;
        self.chunk_encoder.set_chunk_size(self.config.chunk_size);
        self.flush().await?;

        self.liveness = LivenessMonitor::new(
            self.config.ping_interval,
            self.config.ping_timeout,
            Instant::now(),
        );

        loop {
            // Bytes that arrived with the handshake or in the last read
            while let Some(chunk) = self.chunk_decoder.decode(&mut self.read_buf)? {
                self.handle_chunk(chunk).await?;
                if self.state.is_closed() {
                    self.flush().await?;
                    return Ok(());
                }
            }
            self.flush().await?;

            let deadline = self.liveness.next_deadline();

            tokio::select! {
                read = self.reader.read_buf(&mut self.read_buf) => {
                    let n = read?;
                    if n == 0 {
                        self.state.transition(SessionEvent::Close(CloseReason::Disconnected))?;
                        return Ok(());
                    }
                    self.stats.add_bytes_received(n);
                    if let Some(sequence) = self.state.add_bytes_received(n, std::time::Instant::now()) {
                        self.send_message(
                            CSID_PROTOCOL_CONTROL,
                            0,
                            0,
                            RtmpMessage::Acknowledgement { sequence },
                        )
                        .await?;
                    }
                }

                event = next_relay_event(&mut self.subscription) => {
                    self.handle_relay_event(event).await?;
                    self.flush().await?;
                    if self.state.is_closed() {
                        return Ok(());
                    }
                }

                _ = sleep_until(deadline) => {
                    match self.liveness.poll(Instant::now()) {
                        LivenessAction::SendPing(nonce) => {
                            tracing::trace!(session_id = self.state.id, nonce, "Ping");
                            self.send_user_control(UserControlEvent::PingRequest(nonce)).await?;
                            self.flush().await?;
                        }
                        LivenessAction::Expired => {
                            tracing::warn!(
                                session_id = self.state.id,
                                peer = %self.state.peer_addr,
                                "Ping timed out"
                            );
                            return Err(Error::LivenessTimeout);
                        }
                        LivenessAction::Wait => {}
                    }
                }
            }
        }
    }

    /// Move to `Closed` and leave the registry before anything is dropped
    async fn close(&mut self, reason: CloseReason) {
        // Closing is valid from every phase
        let _ = self.state.transition(SessionEvent::Close(reason));

        if let Some(handle) = self.publisher.take() {
            self.registry
                .unregister_publisher(handle.key(), self.state.id)
                .await;
            tracing::info!(
                session_id = self.state.id,
                stream = %handle.key(),
                reason = ?reason,
                "Publishing stopped"
            );
        }

        if let Some(sub) = self.subscription.take() {
            self.registry
                .remove_subscriber(sub.key(), self.state.id)
                .await;
            tracing::info!(
                session_id = self.state.id,
                stream = %sub.key(),
                reason = ?reason,
                "Playing stopped"
            );
        }

        // A peer that stopped reading cannot hold the task here
        let _ = timeout(self.config.ping_timeout, self.writer.shutdown()).await;
    }

    async fn do_handshake(&mut self) -> Result<()> {
        let mut handshake = Handshake::new(HandshakeRole::Server);
        handshake.generate_initial();

        while !handshake.is_done() {
            while self.read_buf.len() < handshake.bytes_needed() {
                let n = self.reader.read_buf(&mut self.read_buf).await?;
                if n == 0 {
                    return Err(HandshakeError::UnexpectedEof.into());
                }
                self.stats.add_bytes_received(n);
                self.state.bytes_received += n as u64;
            }

            let mut buf = Bytes::copy_from_slice(&self.read_buf);
            let available = buf.len();
            let response = handshake.process(&mut buf)?;
            self.read_buf.advance(available - buf.len());

            if let Some(response) = response {
                self.writer.write_all(&response).await?;
                self.writer.flush().await?;
                self.stats.add_bytes_sent(response.len());
                self.state.add_bytes_sent(response.len());
            }
        }

        tracing::debug!(
            session_id = self.state.id,
            peer = %self.state.peer_addr,
            "Handshake complete"
        );
        Ok(())
    }

    async fn handle_chunk(&mut self, chunk: RtmpChunk) -> Result<()> {
        let message = RtmpMessage::from_chunk(&chunk)?;

        match message {
            RtmpMessage::SetChunkSize(size) => {
                tracing::debug!(session_id = self.state.id, size, "Peer set chunk size");
                self.chunk_decoder.set_chunk_size(size)?;
            }
            RtmpMessage::Abort { csid } => self.chunk_decoder.abort(csid),
            RtmpMessage::WindowAckSize(size) => self.state.window_ack_size = size,
            RtmpMessage::UserControl(event) => self.handle_user_control(event).await?,
            RtmpMessage::Command(cmd) => self.handle_command(cmd).await?,
            RtmpMessage::Data(data) => self.handle_data(data).await?,
            RtmpMessage::Audio { timestamp, data } => {
                self.relay(MediaFrame::audio(timestamp, data)).await?
            }
            RtmpMessage::Video { timestamp, data } => {
                self.relay(MediaFrame::video(timestamp, data)).await?
            }
            other => {
                tracing::trace!(session_id = self.state.id, message = ?other, "Unhandled message");
            }
        }

        Ok(())
    }

    async fn handle_user_control(&mut self, event: UserControlEvent) -> Result<()> {
        match event {
            UserControlEvent::PingRequest(value) => {
                self.send_user_control(UserControlEvent::PingResponse(value))
                    .await?;
            }
            UserControlEvent::PingResponse(value) => {
                if !self.liveness.on_pong(value) {
                    tracing::trace!(session_id = self.state.id, value, "Unexpected ping response");
                }
            }
            other => {
                tracing::trace!(session_id = self.state.id, event = ?other, "User control event");
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd.name.as_str() {
            CMD_CONNECT => self.handle_connect(cmd).await,
            CMD_CREATE_STREAM => self.handle_create_stream(cmd).await,
            CMD_RELEASE_STREAM => Ok(()),
            CMD_FC_PUBLISH => {
                let name = cmd.first_string_arg().unwrap_or_default().to_string();
                let notify = Command::notify(CMD_ON_FC_PUBLISH, NS_PUBLISH_START, &name);
                self.send_command(0, &notify).await
            }
            CMD_FC_UNPUBLISH => {
                let name = cmd.first_string_arg().unwrap_or_default().to_string();
                let notify = Command::notify(CMD_ON_FC_UNPUBLISH, NS_UNPUBLISH_SUCCESS, &name);
                self.send_command(0, &notify).await
            }
            CMD_PUBLISH => self.handle_publish(cmd).await,
            CMD_PLAY => self.handle_play(cmd).await,
            CMD_DELETE_STREAM | CMD_CLOSE_STREAM => self.handle_close_stream(cmd).await,
            other => {
                tracing::trace!(session_id = self.state.id, command = other, "Unknown command");
                Ok(())
            }
        }
    }

    async fn handle_connect(&mut self, cmd: Command) -> Result<()> {
        let params = ConnectParams::from_amf(&cmd.command_object);

        self.send_message(
            CSID_PROTOCOL_CONTROL,
            0,
            0,
            RtmpMessage::WindowAckSize(self.config.window_ack_size),
        )
        .await?;
        self.send_message(
            CSID_PROTOCOL_CONTROL,
            0,
            0,
            RtmpMessage::SetPeerBandwidth {
                size: self.config.peer_bandwidth,
                limit_type: BANDWIDTH_LIMIT_DYNAMIC,
            },
        )
        .await?;

        let properties = AmfValue::object([
            ("fmsVer", AmfValue::from("FMS/3,0,1,123")),
            ("capabilities", AmfValue::from(31.0)),
        ]);
        let info = AmfValue::object([
            ("level", AmfValue::from("status")),
            ("code", AmfValue::from(NC_CONNECT_SUCCESS)),
            ("description", AmfValue::from("Connection succeeded.")),
            ("objectEncoding", AmfValue::from(params.object_encoding)),
        ]);
        self.send_command(0, &Command::result(cmd.transaction_id, properties, info))
            .await?;

        tracing::debug!(
            session_id = self.state.id,
            app = %params.app,
            flash_ver = ?params.flash_ver,
            "Connected"
        );
        self.state.connect_params = Some(params);
        Ok(())
    }

    async fn handle_create_stream(&mut self, cmd: Command) -> Result<()> {
        let stream_id = self.state.allocate_stream_id();
        let result = Command::result(
            cmd.transaction_id,
            AmfValue::Null,
            AmfValue::from(stream_id),
        );
        self.send_command(0, &result).await
    }

    fn stream_key(&self, name: &str, command: &'static str) -> Result<StreamKey> {
        let app = self
            .state
            .app()
            .ok_or(ProtocolError::NotConnected(command))?;
        Ok(StreamKey::new(app, name))
    }

    async fn handle_publish(&mut self, cmd: Command) -> Result<()> {
        let params = PublishParams::from_command(&cmd);
        let key = self.stream_key(&params.stream_key, CMD_PUBLISH)?;
        // Reject out-of-order publish before touching the registry
        self.state.phase().apply(SessionEvent::Publish)?;

        if params.stream_key.is_empty() {
            return self
                .send_status(params.stream_id, "error", NS_PUBLISH_BAD_NAME, "Missing stream name")
                .await;
        }

        match self.registry.register_publisher(&key, self.state.id).await {
            Ok(handle) => {
                self.state.transition(SessionEvent::Publish)?;
                self.state.stream_key = Some(key.clone());
                self.state.media_stream_id = params.stream_id;
                self.publisher = Some(handle);

                self.send_user_control(UserControlEvent::StreamBegin(params.stream_id))
                    .await?;
                self.send_status(
                    params.stream_id,
                    "status",
                    NS_PUBLISH_START,
                    &format!("{key} is now published."),
                )
                .await?;

                tracing::info!(
                    session_id = self.state.id,
                    peer = %self.state.peer_addr,
                    stream = %key,
                    publish_type = %params.publish_type,
                    "Publishing started"
                );
                Ok(())
            }
            Err(RegistryError::AlreadyPublishing(_)) => {
                // The session stays connected and may try another name
                self.send_status(
                    params.stream_id,
                    "error",
                    NS_PUBLISH_BAD_NAME,
                    &format!("{key} is already being published."),
                )
                .await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn handle_play(&mut self, cmd: Command) -> Result<()> {
        let params = PlayParams::from_command(&cmd);
        let key = self.stream_key(&params.stream_name, CMD_PLAY)?;
        self.state.phase().apply(SessionEvent::Play)?;

        let subscription = self.registry.add_subscriber(&key, self.state.id).await?;
        self.state.transition(SessionEvent::Play)?;
        self.state.stream_key = Some(key.clone());
        self.state.media_stream_id = params.stream_id;
        self.subscription = Some(subscription);

        self.send_user_control(UserControlEvent::StreamBegin(params.stream_id))
            .await?;
        if params.reset {
            self.send_status(
                params.stream_id,
                "status",
                NS_PLAY_RESET,
                &format!("Playing and resetting {key}."),
            )
            .await?;
        }
        self.send_status(
            params.stream_id,
            "status",
            NS_PLAY_START,
            &format!("Started playing {key}."),
        )
        .await?;

        tracing::info!(
            session_id = self.state.id,
            peer = %self.state.peer_addr,
            stream = %key,
            "Playing started"
        );
        Ok(())
    }

    async fn handle_close_stream(&mut self, cmd: Command) -> Result<()> {
        if self.publisher.is_some() {
            let stream_id = self.state.media_stream_id;
            self.send_status(stream_id, "status", NS_UNPUBLISH_SUCCESS, "Stream unpublished.")
                .await?;
            self.state
                .transition(SessionEvent::Close(CloseReason::Unpublished))?;
        } else if self.subscription.is_some() {
            self.state
                .transition(SessionEvent::Close(CloseReason::Disconnected))?;
        } else {
            tracing::trace!(session_id = self.state.id, command = %cmd.name, "Nothing to close");
        }
        Ok(())
    }

    async fn handle_data(&mut self, data: DataMessage) -> Result<()> {
        match data.into_metadata() {
            Some(metadata) => self.relay(MediaFrame::metadata(metadata.encode())).await,
            None => Ok(()),
        }
    }

    /// Forward a publisher's frame into its stream
    async fn relay(&mut self, frame: MediaFrame) -> Result<()> {
        let Some(handle) = &self.publisher else {
            tracing::trace!(session_id = self.state.id, kind = ?frame.kind, "Media from non-publisher");
            return Ok(());
        };
        if frame.data.is_empty() {
            return Ok(());
        }
        handle.publish(frame).await?;
        Ok(())
    }

    async fn handle_relay_event(&mut self, event: Option<RelayEvent>) -> Result<()> {
        let stream_id = self.state.media_stream_id;

        match event {
            Some(RelayEvent::Frame(frame)) => self.send_frame(stream_id, frame).await,
            Some(RelayEvent::EndOfStream) => {
                self.send_user_control(UserControlEvent::StreamEof(stream_id))
                    .await?;
                self.send_status(
                    stream_id,
                    "status",
                    NS_PLAY_UNPUBLISH_NOTIFY,
                    "Stream was unpublished.",
                )
                .await?;
                // Already detached by the stream task
                self.subscription = None;
                self.state
                    .transition(SessionEvent::Close(CloseReason::EndOfStream))?;
                Ok(())
            }
            None => {
                self.subscription = None;
                tracing::warn!(
                    session_id = self.state.id,
                    peer = %self.state.peer_addr,
                    "Subscriber fell behind and was dropped"
                );
                Err(Error::ResourceLimit("subscriber queue overflow".into()))
            }
        }
    }

    async fn send_frame(&mut self, stream_id: u32, frame: MediaFrame) -> Result<()> {
        let (csid, message) = match frame.kind {
            FrameKind::Audio => (
                CSID_AUDIO,
                RtmpMessage::Audio {
                    timestamp: frame.timestamp,
                    data: frame.data,
                },
            ),
            FrameKind::Video => (
                CSID_VIDEO,
                RtmpMessage::Video {
                    timestamp: frame.timestamp,
                    data: frame.data,
                },
            ),
            FrameKind::Metadata => (
                CSID_DATA,
                RtmpMessage::Unknown {
                    message_type: MSG_DATA_AMF0,
                    payload: frame.data,
                },
            ),
        };
        self.send_message(csid, stream_id, frame.timestamp, message)
            .await
    }

    // === Message sending helpers ===

    /// Frame and buffer one message; callers flush.
    ///
    /// Writes are bounded by the liveness deadline, so a peer that stops
    /// draining its socket closes as `LivenessTimeout`.
    async fn send_message(
        &mut self,
        csid: u32,
        stream_id: u32,
        timestamp: u32,
        message: RtmpMessage,
    ) -> Result<()> {
        let (message_type, payload) = message.encode();
        let chunk = RtmpChunk {
            csid,
            timestamp,
            message_type,
            stream_id,
            payload,
        };

        self.write_buf.clear();
        self.chunk_encoder.encode(&chunk, &mut self.write_buf);
        let deadline = self.liveness.write_deadline(Instant::now());
        timeout_at(deadline, self.writer.write_all(&self.write_buf))
            .await
            .map_err(|_| Error::LivenessTimeout)??;

        self.stats.add_bytes_sent(self.write_buf.len());
        self.state.add_bytes_sent(self.write_buf.len());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let deadline = self.liveness.write_deadline(Instant::now());
        timeout_at(deadline, self.writer.flush())
            .await
            .map_err(|_| Error::LivenessTimeout)??;
        Ok(())
    }

    async fn send_command(&mut self, stream_id: u32, cmd: &Command) -> Result<()> {
        self.send_message(CSID_COMMAND, stream_id, 0, RtmpMessage::Command(cmd.clone()))
            .await
    }

    async fn send_status(
        &mut self,
        stream_id: u32,
        level: &str,
        code: &str,
        description: &str,
    ) -> Result<()> {
        let status = Command::on_status(stream_id, level, code, description);
        self.send_command(stream_id, &status).await
    }

    async fn send_user_control(&mut self, event: UserControlEvent) -> Result<()> {
        self.send_message(CSID_PROTOCOL_CONTROL, 0, 0, RtmpMessage::UserControl(event))
            .await
    }
}

/// Map the error that ended a session onto its close reason
fn close_reason_for(err: &Error) -> CloseReason {
    match err {
        Error::Handshake(_) => CloseReason::HandshakeFailed,
        Error::LivenessTimeout => CloseReason::LivenessTimeout,
        Error::ResourceLimit(_) => CloseReason::ResourceLimit,
        Error::Framing(_) | Error::Amf(_) | Error::Protocol(_) => CloseReason::ProtocolViolation,
        _ => CloseReason::Disconnected,
    }
}
