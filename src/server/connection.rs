//! Per-connection RTMP session driver
//!
//! Owns the lifecycle of a single accepted connection:
//! 1. Handshake (C0C1 -> S0S1S2 -> C2)
//! 2. Connect command
//! 3. Stream commands (publish/play)
//! 4. Media fan-in (publisher) or fan-out (subscriber)
//! 5. Teardown and registry detach
//!
//! The driver is generic over the transport, so any byte-oriented duplex
//! stream works; the listener hands it TCP sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::amf::{Amf0Encoder, AmfValue};
use crate::error::{Error, Result};
use crate::media::{MediaPacket, MediaType};
use crate::protocol::buffer::ByteBuffer;
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, MessagePayload};
use crate::protocol::constants::*;
use crate::protocol::handshake::Handshake;
use crate::protocol::message::{
    Command, ConnectParams, DataMessage, PlayParams, PublishParams, RtmpMessage, UserControlEvent,
};
use crate::registry::{ChannelWriter, PacketWriter, StreamKey, StreamRegistry};
use crate::server::config::ServerConfig;
use crate::server::handler::{AuthResult, RtmpHandler};
use crate::session::control::{self, ControlEffect};
use crate::session::state::{SessionPhase, SessionRole, SessionState};
use crate::session::SessionContext;

/// Per-connection session driver
pub struct Connection<S, H: RtmpHandler> {
    /// Session state
    state: SessionState,

    /// Context for handler callbacks
    context: SessionContext,

    /// Transport halves (buffered)
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: BufWriter<tokio::io::WriteHalf<S>>,

    /// Receive accumulator fed from the socket
    recv: ByteBuffer,

    /// Scratch for socket reads
    io_buf: BytesMut,

    /// Chunk codecs
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,

    /// Scratch for outgoing chunks
    write_buf: BytesMut,

    /// Server configuration
    config: ServerConfig,

    /// Application handler
    handler: Arc<H>,

    /// Shared stream registry
    registry: Arc<StreamRegistry>,

    /// Incoming packet queue when playing
    packet_rx: Option<mpsc::Receiver<MediaPacket>>,

    /// Our writer handle in the registry when playing
    writer_handle: Option<Arc<ChannelWriter>>,

    /// Message stream ID used for playback
    playback_stream_id: Option<u32>,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: RtmpHandler,
{
    /// Create a driver for an accepted connection
    pub fn new(
        session_id: u64,
        transport: S,
        peer_addr: SocketAddr,
        config: ServerConfig,
        handler: Arc<H>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);

        Self {
            state: SessionState::new(session_id, peer_addr),
            context: SessionContext::new(session_id, peer_addr),
            reader: BufReader::with_capacity(config.read_buffer_size, read_half),
            writer: BufWriter::with_capacity(config.write_buffer_size, write_half),
            recv: ByteBuffer::with_capacity(config.read_buffer_size),
            io_buf: BytesMut::with_capacity(config.read_buffer_size),
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            write_buf: BytesMut::with_capacity(config.write_buffer_size),
            config,
            handler,
            registry,
            packet_rx: None,
            writer_handle: None,
            playback_stream_id: None,
        }
    }

    /// Run the session to completion
    pub async fn run(&mut self) -> Result<()> {
        if !self.handler.on_connection(&self.context).await {
            return Err(Error::Rejected("Connection rejected by handler".into()));
        }

        self.do_handshake().await?;

        let idle_timeout = self.config.idle_timeout;
        let result = loop {
            // Take the receiver out so the select arms can borrow self.
            let mut packet_rx = self.packet_rx.take();

            let loop_result = if let Some(ref mut rx) = packet_rx {
                // Subscriber mode: registry packets and TCP input race.
                tokio::select! {
                    biased;

                    packet = rx.recv() => {
                        match packet {
                            Some(packet) => {
                                self.packet_rx = packet_rx;
                                self.deliver_packet(packet).await.map(|_| true)
                            }
                            None => {
                                // Our writer handle was dropped by the
                                // registry (slow-subscriber policy).
                                self.packet_rx = None;
                                self.writer_handle = None;
                                if let Err(e) = self.notify_stream_ended().await {
                                    tracing::debug!(error = %e, "Error notifying stream end");
                                }
                                Ok(false)
                            }
                        }
                    }

                    result = timeout(idle_timeout, self.read_and_process()) => {
                        self.packet_rx = packet_rx;
                        match result {
                            Ok(inner) => inner,
                            Err(_) => {
                                tracing::debug!(session_id = self.state.id, "Idle timeout");
                                Ok(false)
                            }
                        }
                    }
                }
            } else {
                self.packet_rx = packet_rx;
                match timeout(idle_timeout, self.read_and_process()).await {
                    Ok(inner) => inner,
                    Err(_) => {
                        tracing::debug!(session_id = self.state.id, "Idle timeout");
                        Ok(false)
                    }
                }
            };

            match loop_result {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.cleanup_on_disconnect().await;
        self.state.phase = SessionPhase::Closed;
        self.refresh_stats();
        self.handler.on_disconnect(&self.context).await;

        result
    }

    /// Perform the server side of the RTMP handshake
    async fn do_handshake(&mut self) -> Result<()> {
        let deadline = self.config.handshake_timeout;
        let mut handshake = Handshake::new();

        timeout(deadline, async {
            loop {
                if let Some(response) = handshake.handle_c0c1(&mut self.recv)? {
                    self.writer.write_all(&response).await?;
                    self.writer.flush().await?;
                    self.state.phase = SessionPhase::AwaitC2;
                    break;
                }
                if self.fill_recv().await? == 0 {
                    return Err(Error::ConnectionClosed);
                }
            }

            loop {
                if handshake.handle_c2(&mut self.recv)? {
                    self.state.phase = SessionPhase::Connected;
                    break;
                }
                if self.fill_recv().await? == 0 {
                    return Err(Error::ConnectionClosed);
                }
            }

            Ok(())
        })
        .await
        .map_err(|_| Error::Timeout)??;

        tracing::debug!(session_id = self.state.id, "Handshake complete");
        Ok(())
    }

    /// Read from the socket into the receive accumulator
    async fn fill_recv(&mut self) -> Result<usize> {
        self.io_buf.clear();
        let n = self.reader.read_buf(&mut self.io_buf).await?;
        self.recv.append(&self.io_buf);
        Ok(n)
    }

    /// Drain buffered messages, then read more data and drain again
    ///
    /// Returns `Ok(false)` when the peer closed the connection.
    async fn read_and_process(&mut self) -> Result<bool> {
        // Bytes may already be buffered (e.g. the connect command arriving
        // together with C2).
        let mut processed = false;
        while let Some(message) = self.decoder.decode(&mut self.recv)? {
            self.handle_message(message).await?;
            processed = true;
        }
        if processed {
            return Ok(true);
        }

        let n = self.fill_recv().await?;
        if n == 0 {
            return Ok(false);
        }
        self.state.add_bytes_received(n as u64);
        self.context.stats.bytes_received = self.state.bytes_received;

        while let Some(message) = self.decoder.decode(&mut self.recv)? {
            self.handle_message(message).await?;
        }

        Ok(true)
    }

    /// Dispatch one assembled message
    async fn handle_message(&mut self, message: MessagePayload) -> Result<()> {
        let message = RtmpMessage::from_payload(&message)?;

        // Acknowledgement discipline runs once per assembled message.
        if let Some(ack) = control::ack_if_due(&mut self.state) {
            self.send_message(CSID_PROTOCOL_CONTROL, 0, &ack).await?;
        }

        match message {
            RtmpMessage::SetChunkSize(_)
            | RtmpMessage::Abort { .. }
            | RtmpMessage::Acknowledgement { .. }
            | RtmpMessage::WindowAckSize(_)
            | RtmpMessage::SetPeerBandwidth { .. }
            | RtmpMessage::UserControl(_) => {
                let effects = control::handle_control_message(&mut self.state, &message)?;
                self.apply_control_effects(effects).await?;
            }

            RtmpMessage::Command(cmd) | RtmpMessage::CommandAmf3(cmd) => {
                self.handle_command(cmd).await?;
            }

            RtmpMessage::Data(data) | RtmpMessage::DataAmf3(data) => {
                self.handle_data(data).await?;
            }

            RtmpMessage::Audio { timestamp, data } => {
                self.handle_audio(timestamp, data).await?;
            }

            RtmpMessage::Video { timestamp, data } => {
                self.handle_video(timestamp, data).await?;
            }

            RtmpMessage::Unknown { type_id, .. } => {
                tracing::trace!(type_id = type_id, "Unhandled message type");
            }
        }

        Ok(())
    }

    /// Apply the effects produced by protocol-control handling
    async fn apply_control_effects(&mut self, effects: Vec<ControlEffect>) -> Result<()> {
        for effect in effects {
            match effect {
                ControlEffect::SetInboundChunkSize(size) => {
                    self.decoder.set_chunk_size(size);
                }
                ControlEffect::AbortChunkStream(csid) => {
                    self.decoder.abort(csid);
                }
                ControlEffect::Reply(message) => {
                    self.send_message(CSID_PROTOCOL_CONTROL, 0, &message).await?;
                }
            }
        }
        Ok(())
    }

    /// Dispatch a command message by name
    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd.name.as_str() {
            CMD_CONNECT => self.handle_connect(cmd).await?,
            CMD_CREATE_STREAM => self.handle_create_stream(cmd).await?,
            CMD_PUBLISH => self.handle_publish(cmd).await?,
            CMD_PLAY => self.handle_play(cmd).await?,
            CMD_DELETE_STREAM | CMD_CLOSE_STREAM => self.handle_close_stream(cmd).await?,
            CMD_FC_PUBLISH => self.handle_fc_publish(cmd).await?,
            CMD_FC_UNPUBLISH => self.handle_fc_unpublish(cmd).await?,
            CMD_RELEASE_STREAM | CMD_CLOSE => {
                // Cleanup notifications; no response expected.
            }
            _ => {
                tracing::trace!(command = cmd.name, "Unknown command");
                if cmd.transaction_id != 0.0 {
                    let mut info = HashMap::new();
                    info.insert("level".to_string(), AmfValue::String("error".into()));
                    info.insert("code".to_string(), AmfValue::String(NC_CALL_FAILED.into()));
                    info.insert(
                        "description".to_string(),
                        AmfValue::String(format!("Unknown command: {}", cmd.name)),
                    );
                    let error =
                        Command::error(cmd.transaction_id, AmfValue::Null, AmfValue::Object(info));
                    self.send_command(CSID_COMMAND, 0, &error).await?;
                }
            }
        }
        Ok(())
    }

    /// Handle the connect command
    async fn handle_connect(&mut self, cmd: Command) -> Result<()> {
        let params = ConnectParams::from_amf(&cmd.command_object);

        self.refresh_stats();
        match self.handler.on_connect(&self.context, &params).await {
            AuthResult::Accept => {
                self.state.app = params.app.clone();
                self.context.with_connect(params);

                self.send_message(
                    CSID_PROTOCOL_CONTROL,
                    0,
                    &RtmpMessage::WindowAckSize(self.config.window_ack_size),
                )
                .await?;

                self.send_message(
                    CSID_PROTOCOL_CONTROL,
                    0,
                    &RtmpMessage::SetPeerBandwidth {
                        size: self.config.peer_bandwidth,
                        limit_type: BANDWIDTH_LIMIT_DYNAMIC,
                    },
                )
                .await?;

                self.send_message(
                    CSID_PROTOCOL_CONTROL,
                    0,
                    &RtmpMessage::SetChunkSize(self.config.out_chunk_size),
                )
                .await?;
                self.encoder.set_chunk_size(self.config.out_chunk_size);
                self.state.out_chunk_size = self.config.out_chunk_size;

                self.send_connect_result(cmd.transaction_id).await?;

                self.send_message(
                    CSID_PROTOCOL_CONTROL,
                    0,
                    &RtmpMessage::UserControl(UserControlEvent::StreamBegin(0)),
                )
                .await?;

                tracing::info!(
                    session_id = self.state.id,
                    app = %self.state.app,
                    "Connected"
                );
            }
            AuthResult::Reject(reason) => {
                let mut info = HashMap::new();
                info.insert("level".to_string(), AmfValue::String("error".into()));
                info.insert(
                    "code".to_string(),
                    AmfValue::String(NC_CONNECT_REJECTED.into()),
                );
                info.insert("description".to_string(), AmfValue::String(reason.clone()));
                let error =
                    Command::error(cmd.transaction_id, AmfValue::Null, AmfValue::Object(info));
                self.send_command(CSID_COMMAND, 0, &error).await?;
                return Err(Error::Rejected(reason));
            }
        }

        Ok(())
    }

    /// Build and send the connect _result
    async fn send_connect_result(&mut self, transaction_id: f64) -> Result<()> {
        let mut props = HashMap::new();
        props.insert(
            "fmsVer".to_string(),
            AmfValue::String("FMS/3,5,7,7009".into()),
        );
        props.insert("capabilities".to_string(), AmfValue::Number(31.0));
        props.insert("mode".to_string(), AmfValue::Number(1.0));

        let mut info = HashMap::new();
        info.insert("level".to_string(), AmfValue::String("status".into()));
        info.insert(
            "code".to_string(),
            AmfValue::String(NC_CONNECT_SUCCESS.into()),
        );
        info.insert(
            "description".to_string(),
            AmfValue::String("Connection succeeded".into()),
        );
        info.insert("objectEncoding".to_string(), AmfValue::Number(0.0));

        let result = Command::result(
            transaction_id,
            AmfValue::Object(props),
            AmfValue::Object(info),
        );

        self.send_command(CSID_COMMAND, 0, &result).await
    }

    /// Handle the createStream command
    async fn handle_create_stream(&mut self, cmd: Command) -> Result<()> {
        let stream_id = self.state.allocate_stream_id();

        let result = Command::result(
            cmd.transaction_id,
            AmfValue::Null,
            AmfValue::Number(stream_id as f64),
        );
        self.send_command(CSID_COMMAND, 0, &result).await?;

        tracing::debug!(session_id = self.state.id, stream_id = stream_id, "Stream created");
        Ok(())
    }

    /// Handle the publish command
    async fn handle_publish(&mut self, cmd: Command) -> Result<()> {
        let stream_name = cmd
            .arguments
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let publish_type = cmd
            .arguments
            .get(1)
            .and_then(|v| v.as_str())
            .unwrap_or("live")
            .to_string();

        let params = PublishParams {
            stream_key: stream_name.clone(),
            publish_type,
            stream_id: cmd.stream_id,
        };

        self.refresh_stats();
        match self.handler.on_publish(&self.context, &params).await {
            AuthResult::Accept => {
                let key = StreamKey::new(&self.state.app, &stream_name).to_string();

                if let Err(e) = self.registry.register_publisher(&key).await {
                    // Semantically rejected; the connection survives.
                    tracing::warn!(
                        session_id = self.state.id,
                        stream = %key,
                        error = %e,
                        "Publish refused"
                    );
                    let status = Command::on_status(
                        cmd.stream_id,
                        "error",
                        NS_PUBLISH_BAD_NAME,
                        &format!("Stream already publishing: {}", stream_name),
                    );
                    self.send_command(CSID_COMMAND, cmd.stream_id, &status).await?;
                    return Ok(());
                }

                self.state.start_publishing(key.clone());

                self.send_message(
                    CSID_PROTOCOL_CONTROL,
                    0,
                    &RtmpMessage::UserControl(UserControlEvent::StreamBegin(cmd.stream_id)),
                )
                .await?;

                let status = Command::on_status(
                    cmd.stream_id,
                    "status",
                    NS_PUBLISH_START,
                    &format!("{} is now published", stream_name),
                );
                self.send_command(CSID_COMMAND, cmd.stream_id, &status).await?;

                tracing::info!(
                    session_id = self.state.id,
                    stream = %key,
                    "Publishing started"
                );
            }
            AuthResult::Reject(reason) => {
                let status =
                    Command::on_status(cmd.stream_id, "error", NS_PUBLISH_BAD_NAME, &reason);
                self.send_command(CSID_COMMAND, cmd.stream_id, &status).await?;
                return Err(Error::Rejected(reason));
            }
        }

        Ok(())
    }

    /// Handle the play command
    async fn handle_play(&mut self, cmd: Command) -> Result<()> {
        let stream_name = cmd
            .arguments
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let start = cmd
            .arguments
            .get(1)
            .and_then(|v| v.as_number())
            .unwrap_or(-2.0);
        let duration = cmd
            .arguments
            .get(2)
            .and_then(|v| v.as_number())
            .unwrap_or(-1.0);
        let reset = cmd
            .arguments
            .get(3)
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let params = PlayParams {
            stream_name: stream_name.clone(),
            start,
            duration,
            reset,
            stream_id: cmd.stream_id,
        };

        self.refresh_stats();
        match self.handler.on_play(&self.context, &params).await {
            AuthResult::Accept => {
                let key = StreamKey::new(&self.state.app, &stream_name).to_string();
                let writer_id = format!("session-{}", self.state.id);

                let capacity = self.registry.config().subscriber_queue_capacity;
                let (writer, rx) = ChannelWriter::channel(key.clone(), writer_id, capacity);

                // The registry replays the GOP cache into our queue before
                // returning, so replayed packets precede any live packet.
                self.registry.add_player(writer.clone()).await;

                self.state.start_playing(key.clone());
                self.writer_handle = Some(writer);
                self.packet_rx = Some(rx);
                self.playback_stream_id = Some(cmd.stream_id);

                self.send_message(
                    CSID_PROTOCOL_CONTROL,
                    0,
                    &RtmpMessage::UserControl(UserControlEvent::StreamBegin(cmd.stream_id)),
                )
                .await?;

                let status = Command::on_status(
                    cmd.stream_id,
                    "status",
                    NS_PLAY_RESET,
                    "Playing and resetting",
                );
                self.send_command(CSID_COMMAND, cmd.stream_id, &status).await?;

                let status = Command::on_status(
                    cmd.stream_id,
                    "status",
                    NS_PLAY_START,
                    &format!("Started playing {}", stream_name),
                );
                self.send_command(CSID_COMMAND, cmd.stream_id, &status).await?;

                tracing::info!(
                    session_id = self.state.id,
                    stream = %key,
                    "Playing started"
                );
            }
            AuthResult::Reject(reason) => {
                let status =
                    Command::on_status(cmd.stream_id, "error", NS_PLAY_STREAM_NOT_FOUND, &reason);
                self.send_command(CSID_COMMAND, cmd.stream_id, &status).await?;
            }
        }

        Ok(())
    }

    /// Handle deleteStream / closeStream
    async fn handle_close_stream(&mut self, cmd: Command) -> Result<()> {
        self.detach_from_registry().await;

        if cmd.name == CMD_DELETE_STREAM {
            let status = Command::on_status(
                cmd.stream_id,
                "status",
                NS_UNPUBLISH_SUCCESS,
                "Stream deleted",
            );
            self.send_command(CSID_COMMAND, cmd.stream_id, &status).await?;
        }

        Ok(())
    }

    /// Handle FCPublish (OBS/Twitch compatibility)
    async fn handle_fc_publish(&mut self, _cmd: Command) -> Result<()> {
        let response = Command {
            name: CMD_ON_FC_PUBLISH.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![],
            stream_id: 0,
        };
        self.send_command(CSID_COMMAND, 0, &response).await
    }

    /// Handle FCUnpublish
    async fn handle_fc_unpublish(&mut self, _cmd: Command) -> Result<()> {
        self.detach_from_registry().await;

        let response = Command {
            name: CMD_ON_FC_UNPUBLISH.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![],
            stream_id: 0,
        };
        self.send_command(CSID_COMMAND, 0, &response).await
    }

    /// Handle data messages (@setDataFrame / onMetaData)
    async fn handle_data(&mut self, data: DataMessage) -> Result<()> {
        let values: &[AmfValue] = match data.name.as_str() {
            CMD_SET_DATA_FRAME => {
                // "@setDataFrame" wraps "onMetaData" + the metadata object.
                match data.values.first() {
                    Some(AmfValue::String(inner)) if inner == CMD_ON_METADATA => &data.values[1..],
                    _ => return Ok(()),
                }
            }
            CMD_ON_METADATA => &data.values[..],
            _ => {
                tracing::trace!(name = data.name, "Unknown data message");
                return Ok(());
            }
        };

        if self.state.role != SessionRole::Publisher {
            return Ok(());
        }
        let Some(key) = self.state.stream_key.clone() else {
            return Ok(());
        };

        let metadata: HashMap<String, AmfValue> = values
            .first()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        self.refresh_stats();
        self.handler.on_metadata(&self.context, &metadata).await;

        // Re-encode as a plain onMetaData body for subscribers.
        let mut encoder = Amf0Encoder::new();
        encoder.encode(&AmfValue::String(CMD_ON_METADATA.into()));
        for value in values {
            encoder.encode(value);
        }

        self.registry
            .write_packet(MediaPacket::metadata(key, encoder.finish()))
            .await;

        Ok(())
    }

    /// Handle an audio message from a publisher
    async fn handle_audio(&mut self, timestamp: u32, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.state.role != SessionRole::Publisher {
            tracing::debug!(session_id = self.state.id, "Audio from non-publisher ignored");
            return Ok(());
        }
        let Some(key) = self.state.stream_key.clone() else {
            return Ok(());
        };

        self.context.stats.audio_packets += 1;

        let packet = MediaPacket::audio(key, timestamp, data);
        self.registry.write_packet(packet).await;
        Ok(())
    }

    /// Handle a video message from a publisher
    async fn handle_video(&mut self, timestamp: u32, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.state.role != SessionRole::Publisher {
            tracing::debug!(session_id = self.state.id, "Video from non-publisher ignored");
            return Ok(());
        }
        let Some(key) = self.state.stream_key.clone() else {
            return Ok(());
        };

        let packet = MediaPacket::video(key, timestamp, data);
        self.context.stats.video_packets += 1;
        if packet.is_key_frame {
            self.context.stats.keyframes += 1;
        }

        self.registry.write_packet(packet).await;
        Ok(())
    }

    /// Send one registry packet to the playing client
    async fn deliver_packet(&mut self, packet: MediaPacket) -> Result<()> {
        let stream_id = self.playback_stream_id.unwrap_or(1);

        let (type_id, csid) = match packet.media_type {
            MediaType::Audio => (MSG_AUDIO, CSID_AUDIO),
            MediaType::Video => (MSG_VIDEO, CSID_VIDEO),
            MediaType::Metadata => (MSG_DATA_AMF0, CSID_COMMAND),
        };

        match packet.media_type {
            MediaType::Audio => self.context.stats.audio_packets += 1,
            MediaType::Video => self.context.stats.video_packets += 1,
            MediaType::Metadata => {}
        }

        let message = MessagePayload {
            csid,
            timestamp: packet.dts,
            type_id,
            message_stream_id: stream_id,
            payload: packet.payload,
        };

        self.write_buf.clear();
        self.encoder.encode(&message, &mut self.write_buf);
        self.context.stats.bytes_sent += self.write_buf.len() as u64;
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// Tell a playing client its stream is gone
    async fn notify_stream_ended(&mut self) -> Result<()> {
        if let Some(stream_id) = self.playback_stream_id {
            self.send_message(
                CSID_PROTOCOL_CONTROL,
                0,
                &RtmpMessage::UserControl(UserControlEvent::StreamEof(stream_id)),
            )
            .await?;

            let status = Command::on_status(stream_id, "status", NS_PLAY_STOP, "Stream ended");
            self.send_command(CSID_COMMAND, stream_id, &status).await?;

            tracing::info!(
                session_id = self.state.id,
                stream_id = stream_id,
                "Stream ended, notified subscriber"
            );
        }
        Ok(())
    }

    /// Detach from the registry according to the session role
    async fn detach_from_registry(&mut self) {
        match self.state.role {
            SessionRole::Publisher => {
                if let Some(key) = self.state.stream_key.clone() {
                    self.registry.remove_publisher(&key).await;
                    self.refresh_stats();
                    self.handler.on_publish_stop(&self.context, &key).await;
                    tracing::debug!(
                        session_id = self.state.id,
                        stream = %key,
                        "Publisher detached"
                    );
                }
            }
            SessionRole::Subscriber => {
                if let Some(key) = self.state.stream_key.clone() {
                    if let Some(writer) = self.writer_handle.take() {
                        self.registry.remove_player(&key, writer.id()).await;
                    }
                    self.packet_rx = None;
                    tracing::debug!(
                        session_id = self.state.id,
                        stream = %key,
                        "Subscriber detached"
                    );
                }
            }
            SessionRole::None => {}
        }
        self.state.detach();
    }

    /// Registry cleanup when the connection goes away
    async fn cleanup_on_disconnect(&mut self) {
        self.detach_from_registry().await;
    }

    /// Sync the derived stat fields before handing the context to a callback
    fn refresh_stats(&mut self) {
        self.context.stats.duration = self.state.connected_at.elapsed();
        self.context.stats.calculate_bitrate();
    }

    // === Message sending helpers ===

    async fn send_message(
        &mut self,
        csid: u32,
        stream_id: u32,
        message: &RtmpMessage,
    ) -> Result<()> {
        let (type_id, payload) = message.encode();

        let chunk_message = MessagePayload {
            csid,
            timestamp: 0,
            type_id,
            message_stream_id: stream_id,
            payload,
        };

        self.write_buf.clear();
        self.encoder.encode(&chunk_message, &mut self.write_buf);
        self.context.stats.bytes_sent += self.write_buf.len() as u64;
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;

        Ok(())
    }

    async fn send_command(&mut self, csid: u32, stream_id: u32, cmd: &Command) -> Result<()> {
        let mut cmd = cmd.clone();
        cmd.stream_id = stream_id;
        self.send_message(csid, stream_id, &RtmpMessage::Command(cmd)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::buffer::ByteBuffer;
    use crate::server::handler::LoggingHandler;
    use tokio::io::{duplex, DuplexStream};

    struct TestClient {
        reader: tokio::io::ReadHalf<DuplexStream>,
        writer: tokio::io::WriteHalf<DuplexStream>,
        decoder: ChunkDecoder,
        encoder: ChunkEncoder,
        recv: ByteBuffer,
    }

    impl TestClient {
        fn new(stream: DuplexStream) -> Self {
            let (reader, writer) = tokio::io::split(stream);
            Self {
                reader,
                writer,
                decoder: ChunkDecoder::new(),
                encoder: ChunkEncoder::new(),
                recv: ByteBuffer::new(),
            }
        }

        async fn handshake(&mut self) {
            // C0 + C1
            let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
            c0c1[0] = RTMP_VERSION;
            self.writer.write_all(&c0c1).await.unwrap();

            // S0 + S1 + S2
            let mut response = vec![0u8; 1 + HANDSHAKE_SIZE * 2];
            self.reader.read_exact(&mut response).await.unwrap();
            assert_eq!(response[0], RTMP_VERSION);
            // S2 echoes C1 verbatim
            assert_eq!(&response[1 + HANDSHAKE_SIZE..], &c0c1[1..]);

            // C2
            self.writer.write_all(&[0u8; HANDSHAKE_SIZE]).await.unwrap();
        }

        async fn send_command(&mut self, cmd: Command) {
            let (type_id, payload) = RtmpMessage::Command(cmd).encode();
            let message = MessagePayload {
                csid: CSID_COMMAND,
                timestamp: 0,
                type_id,
                message_stream_id: 0,
                payload,
            };
            let mut buf = BytesMut::new();
            self.encoder.encode(&message, &mut buf);
            self.writer.write_all(&buf).await.unwrap();
        }

        async fn recv_message(&mut self) -> RtmpMessage {
            loop {
                if let Some(payload) = self.decoder.decode(&mut self.recv).unwrap() {
                    let message = RtmpMessage::from_payload(&payload).unwrap();
                    // Track the server's outbound chunk size like a real client.
                    if let RtmpMessage::SetChunkSize(size) = &message {
                        self.decoder.set_chunk_size(*size);
                    }
                    return message;
                }
                let mut buf = [0u8; 4096];
                let n = self.reader.read(&mut buf).await.unwrap();
                assert!(n > 0, "server closed unexpectedly");
                self.recv.append(&buf[..n]);
            }
        }
    }

    fn spawn_connection(
        transport: DuplexStream,
        registry: Arc<StreamRegistry>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut connection = Connection::new(
                1,
                transport,
                "127.0.0.1:55555".parse().unwrap(),
                ServerConfig::default(),
                Arc::new(LoggingHandler),
                registry,
            );
            let _ = connection.run().await;
        })
    }

    fn connect_command() -> Command {
        let mut obj = HashMap::new();
        obj.insert("app".to_string(), AmfValue::String("live".into()));
        obj.insert(
            "tcUrl".to_string(),
            AmfValue::String("rtmp://host/live".into()),
        );
        Command {
            name: CMD_CONNECT.to_string(),
            transaction_id: 1.0,
            command_object: AmfValue::Object(obj),
            arguments: vec![],
            stream_id: 0,
        }
    }

    #[tokio::test]
    async fn test_handshake_then_connect_response_sequence() {
        let (client_end, server_end) = duplex(256 * 1024);
        let registry = Arc::new(StreamRegistry::new());
        let _server = spawn_connection(server_end, registry);

        let mut client = TestClient::new(client_end);
        client.handshake().await;
        client.send_command(connect_command()).await;

        // The connect response sequence, in order.
        let msg = client.recv_message().await;
        assert!(matches!(msg, RtmpMessage::WindowAckSize(DEFAULT_WINDOW_ACK_SIZE)));

        let msg = client.recv_message().await;
        assert!(matches!(
            msg,
            RtmpMessage::SetPeerBandwidth {
                size: DEFAULT_PEER_BANDWIDTH,
                ..
            }
        ));

        let msg = client.recv_message().await;
        assert!(matches!(msg, RtmpMessage::SetChunkSize(RECOMMENDED_CHUNK_SIZE)));

        let msg = client.recv_message().await;
        match msg {
            RtmpMessage::Command(cmd) => {
                assert_eq!(cmd.name, CMD_RESULT);
                assert_eq!(cmd.transaction_id, 1.0);
                let info = &cmd.arguments[0];
                assert_eq!(info.get_string("code"), Some(NC_CONNECT_SUCCESS));
            }
            other => panic!("expected _result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_registers_and_relays_into_registry() {
        let (client_end, server_end) = duplex(256 * 1024);
        let registry = Arc::new(StreamRegistry::new());
        let _server = spawn_connection(server_end, registry.clone());

        let mut client = TestClient::new(client_end);
        client.handshake().await;
        client.send_command(connect_command()).await;

        // Drain the connect response burst: control messages, _result,
        // Stream Begin.
        for _ in 0..5 {
            client.recv_message().await;
        }

        client
            .send_command(Command {
                name: CMD_CREATE_STREAM.to_string(),
                transaction_id: 2.0,
                command_object: AmfValue::Null,
                arguments: vec![],
                stream_id: 0,
            })
            .await;
        let msg = client.recv_message().await;
        let stream_id = match msg {
            RtmpMessage::Command(cmd) => {
                assert_eq!(cmd.name, CMD_RESULT);
                cmd.arguments[0].as_number().unwrap() as u32
            }
            other => panic!("expected _result, got {:?}", other),
        };
        assert_eq!(stream_id, 1);

        client
            .send_command(Command {
                name: CMD_PUBLISH.to_string(),
                transaction_id: 3.0,
                command_object: AmfValue::Null,
                arguments: vec![
                    AmfValue::String("cam1".into()),
                    AmfValue::String("live".into()),
                ],
                stream_id,
            })
            .await;

        // Stream Begin, then onStatus publish start.
        let msg = client.recv_message().await;
        assert!(matches!(
            msg,
            RtmpMessage::UserControl(UserControlEvent::StreamBegin(_))
        ));
        let msg = client.recv_message().await;
        match msg {
            RtmpMessage::Command(cmd) => {
                assert_eq!(cmd.name, CMD_ON_STATUS);
                assert_eq!(
                    cmd.arguments[0].get_string("code"),
                    Some(NS_PUBLISH_START)
                );
            }
            other => panic!("expected onStatus, got {:?}", other),
        }

        assert!(registry.has_publisher("live/cam1").await);

        // A keyframe reaches the registry's GOP cache.
        let (type_id, _) = RtmpMessage::Video {
            timestamp: 0,
            data: Bytes::new(),
        }
        .encode();
        let message = MessagePayload {
            csid: CSID_VIDEO,
            timestamp: 0,
            type_id,
            message_stream_id: stream_id,
            payload: Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x00, 0xAA]),
        };
        let mut buf = BytesMut::new();
        client.encoder.encode(&message, &mut buf);
        client.writer.write_all(&buf).await.unwrap();

        // Give the server a moment to process.
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if let Some(stats) = registry.stream_stats("live/cam1").await {
                if stats.gop_packets > 0 {
                    return;
                }
            }
        }
        panic!("keyframe never reached the registry");
    }
}
