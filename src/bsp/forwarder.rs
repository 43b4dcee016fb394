//! Duplex forwarder
//!
//! Bridges the client channel and the server channel. Each direction gets
//! its own [`Framer`] and runs as its own task, so a blocked read on one
//! side never holds up the other. The first direction to finish ends the
//! session: the other pump is aborted and both channels are closed before
//! [`DuplexForwarder::run`] returns.

use std::fmt;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bsp::framing::{
    DEFAULT_READ_CHUNK_SIZE, DiagnosticSink, Framer, FramingError, MAX_MESSAGE_SIZE, StreamStats,
    TracingSink,
};
use crate::io::channel::{Channel, ChannelReader, ChannelWriter};

/// Direction of a forwarding pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// Error types for a relay session
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Transport failure on {direction}: {source}")]
    Transport {
        direction: Direction,
        #[source]
        source: FramingError,
    },

    #[error("Forwarding task for {direction} failed: {source}")]
    Task {
        direction: Direction,
        #[source]
        source: JoinError,
    },
}

/// Outcome of a session that ended by end-of-stream
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: Uuid,

    /// Direction whose source reached end-of-stream first
    pub closed_first: Direction,

    /// Stats for bytes read from the client
    pub client_to_server: StreamStats,

    /// Stats for bytes read from the server
    pub server_to_client: StreamStats,
}

/// Bidirectional, frame-preserving relay between two channels
pub struct DuplexForwarder {
    session_id: Uuid,
    client: Channel,
    server: Channel,
    sink: Arc<dyn DiagnosticSink>,
    chunk_size: usize,
    max_message_size: usize,
}

impl DuplexForwarder {
    pub fn new(client: Channel, server: Channel) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            client,
            server,
            sink: Arc::new(TracingSink),
            chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Report framing diagnostics to `sink` instead of the log
    #[cfg(test)]
    pub fn with_diagnostic_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Set the read size used by both pumps
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the largest payload either direction accepts
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn framer(&self, direction: Direction) -> Framer {
        Framer::new(direction.to_string(), Arc::clone(&self.sink))
            .with_chunk_size(self.chunk_size)
            .with_max_message_size(self.max_message_size)
    }

    /// Relay until either side closes or fails
    pub async fn run(self) -> Result<SessionSummary, ForwardError> {
        let session_id = self.session_id;
        info!(
            %session_id,
            client = self.client.name(),
            server = self.server.name(),
            "Starting BSP relay"
        );

        let upstream = self.framer(Direction::ClientToServer);
        let downstream = self.framer(Direction::ServerToClient);
        let upstream_counters = upstream.counters();
        let downstream_counters = downstream.counters();
        let (client_reader, client_writer) = self.client.into_split();
        let (server_reader, server_writer) = self.server.into_split();

        let mut to_server = tokio::spawn(pump(
            Direction::ClientToServer,
            upstream,
            client_reader,
            server_writer,
        ));
        let mut to_client = tokio::spawn(pump(
            Direction::ServerToClient,
            downstream,
            server_reader,
            client_writer,
        ));

        let (direction, result) = tokio::select! {
            result = &mut to_server => (Direction::ClientToServer, result),
            result = &mut to_client => (Direction::ServerToClient, result),
        };
        let remaining = match direction {
            Direction::ClientToServer => to_client,
            Direction::ServerToClient => to_server,
        };

        close(remaining).await;

        match result {
            Ok(Ok(_)) => {
                let summary = SessionSummary {
                    session_id,
                    closed_first: direction,
                    client_to_server: upstream_counters.snapshot(),
                    server_to_client: downstream_counters.snapshot(),
                };
                info!(
                    %session_id,
                    closed_first = %direction,
                    upstream_messages = summary.client_to_server.messages,
                    downstream_messages = summary.server_to_client.messages,
                    dropped_frames = summary.client_to_server.dropped_frames
                        + summary.server_to_client.dropped_frames,
                    "BSP relay finished"
                );
                Ok(summary)
            }
            Ok(Err(source)) => {
                error!(%session_id, %direction, "BSP relay failed: {}", source);
                Err(ForwardError::Transport { direction, source })
            }
            Err(source) => {
                error!(%session_id, %direction, "BSP relay task failed: {}", source);
                Err(ForwardError::Task { direction, source })
            }
        }
    }
}

/// Forward one direction, then close the destination's write side
async fn pump(
    direction: Direction,
    mut framer: Framer,
    mut reader: ChannelReader,
    mut writer: ChannelWriter,
) -> Result<StreamStats, FramingError> {
    debug!(%direction, "Pump started");

    let stats = framer.forward_stream(&mut reader, &mut writer).await?;
    writer.shutdown().await?;

    debug!(
        %direction,
        messages = stats.messages,
        bytes = stats.bytes_read,
        "Pump reached end of stream"
    );
    Ok(stats)
}

/// Abort the surviving pump and wait until its channel halves are dropped
async fn close(handle: JoinHandle<Result<StreamStats, FramingError>>) {
    handle.abort();
    match handle.await {
        Err(e) if e.is_cancelled() => debug!("Remaining pump cancelled"),
        Err(e) => error!("Remaining pump panicked: {}", e),
        Ok(Ok(stats)) => debug!(messages = stats.messages, "Remaining pump already finished"),
        Ok(Err(e)) => debug!("Remaining pump failed during teardown: {}", e),
    }
}
