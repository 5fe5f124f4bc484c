//! Listener side connection acceptor

use fe2o3_amqp_types::{
    definitions::{Fields, Milliseconds},
    performatives::{Begin, ChannelMax, MaxFrameSize, Open},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

use crate::{
    connection::{
        engine::ConnectionEngine, Connection, ConnectionHandle, ConnectionState, OpenError,
        DEFAULT_CHANNEL_MAX, DEFAULT_CONTROL_CHAN_BUF, DEFAULT_MAX_FRAME_SIZE,
        DEFAULT_OUTGOING_BUFFER_SIZE,
    },
    control::ConnectionControl,
    transport::{protocol_header::ProtocolHeader, Transport},
};

pub(crate) const DEFAULT_SESSION_LISTENER_BUFFER_SIZE: usize = 128;

/// A handle to a connection that was accepted on the listener side; offers
/// the remotely initiated sessions in addition to the plain connection
/// handle operations
pub type ListenerConnectionHandle = ConnectionHandle<mpsc::Receiver<IncomingSession>>;

impl ListenerConnectionHandle {
    /// Waits for the next remotely initiated session.
    ///
    /// Returns `None` once the connection event loop has stopped.
    pub async fn next_incoming_session(&mut self) -> Option<IncomingSession> {
        self.session_listener.recv().await
    }
}

/// A remotely initiated session offered to the listener.
///
/// The peer's Begin must be answered promptly: pass the incoming session to
/// a [`SessionAcceptor`](super::SessionAcceptor), which sends the answering
/// Begin before it returns. Dropping the incoming session instead rejects
/// the endpoint, which surfaces as a connection level error on the peer.
#[derive(Debug)]
pub struct IncomingSession {
    pub(crate) channel: u16,
    pub(crate) begin: Begin,
    pub(crate) control: mpsc::Sender<ConnectionControl>,
    pub(crate) accepted: bool,
}

impl IncomingSession {
    pub(crate) fn new(channel: u16, begin: Begin, control: mpsc::Sender<ConnectionControl>) -> Self {
        Self {
            channel,
            begin,
            control,
            accepted: false,
        }
    }

    /// The channel the peer sent its Begin on
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// The Begin performative the peer sent
    pub fn begin(&self) -> &Begin {
        &self.begin
    }
}

impl Drop for IncomingSession {
    fn drop(&mut self) {
        if !self.accepted {
            let _ = self
                .control
                .try_send(ConnectionControl::RejectIncomingSession(self.channel));
        }
    }
}

/// Accepts incoming byte streams as AMQP connections.
///
/// The acceptor answers the client's protocol header, waits for its Open,
/// and replies with the local Open built from this configuration.
#[derive(Debug, Clone)]
pub struct ConnectionAcceptor {
    /// The id of the local container
    pub container_id: String,

    /// Proposed maximum frame size
    pub max_frame_size: MaxFrameSize,

    /// The maximum channel number for the connection
    pub channel_max: ChannelMax,

    /// Idle time-out in milliseconds
    pub idle_time_out: Option<Milliseconds>,

    /// Connection properties
    pub properties: Option<Fields>,

    /// Buffer size of the channels used by the connection
    pub buffer_size: usize,
}

impl ConnectionAcceptor {
    /// Creates a connection acceptor with the default configuration
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            max_frame_size: MaxFrameSize(DEFAULT_MAX_FRAME_SIZE),
            channel_max: ChannelMax(DEFAULT_CHANNEL_MAX),
            idle_time_out: None,
            properties: None,
            buffer_size: DEFAULT_OUTGOING_BUFFER_SIZE,
        }
    }

    /// Accepts a byte stream as the listener side of a connection
    pub async fn accept<Io>(&self, mut stream: Io) -> Result<ListenerConnectionHandle, OpenError>
    where
        Io: AsyncRead + AsyncWrite + std::fmt::Debug + Send + Unpin + 'static,
    {
        let mut local_state = ConnectionState::Start;
        let _incoming_header =
            Transport::negotiate_incoming(&mut stream, &mut local_state, ProtocolHeader::amqp())
                .await?;

        let idle_timeout = self
            .idle_time_out
            .map(|millis| std::time::Duration::from_millis(millis as u64));
        let transport = Transport::bind(stream, self.max_frame_size.0 as usize, idle_timeout);

        let local_open = Open {
            container_id: self.container_id.clone(),
            hostname: None,
            max_frame_size: self.max_frame_size.clone(),
            channel_max: self.channel_max.clone(),
            idle_time_out: self.idle_time_out.map(|v| v / 2),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: self.properties.clone(),
        };

        let (control_tx, control_rx) = mpsc::channel(DEFAULT_CONTROL_CHAN_BUF);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.buffer_size);
        let (session_listener_tx, session_listener_rx) =
            mpsc::channel(DEFAULT_SESSION_LISTENER_BUFFER_SIZE);

        let connection = Connection::new(local_state, local_open);
        let engine = ConnectionEngine::open_listener(
            transport,
            connection,
            control_rx,
            control_tx.clone(),
            outgoing_rx,
            session_listener_tx,
        )
        .await?;
        let engine_handle = engine.spawn();

        Ok(ConnectionHandle {
            control: control_tx,
            engine_handle: Some(engine_handle),
            outgoing: outgoing_tx,
            session_listener: session_listener_rx,
        })
    }
}
