//! Listener side session acceptor

use fe2o3_amqp_types::{definitions::Handle, primitives::Uint as UInt};
use tokio::sync::mpsc;

use crate::{
    control::ConnectionControl,
    session::{
        builder::{
            Builder as SessionBuilder, DEFAULT_SESSION_CONTROL_BUFFER_SIZE,
            DEFAULT_SESSION_MUX_BUFFER_SIZE,
        },
        engine::SessionEngine,
        BeginError, Session, SessionHandle, DEFAULT_WINDOW,
    },
};

use super::{connection::ListenerConnectionHandle, link::LinkEndpoint, IncomingSession};

pub(crate) const DEFAULT_LINK_LISTENER_BUFFER_SIZE: usize = 128;

/// A handle to a session that was accepted on the listener side; offers the
/// remotely initiated links in addition to the plain session handle
/// operations
pub type ListenerSessionHandle = SessionHandle<mpsc::Receiver<LinkEndpoint>>;

impl ListenerSessionHandle {
    /// Waits for the next remotely initiated link.
    ///
    /// Returns `None` once the session event loop has stopped.
    pub async fn next_incoming_link(&mut self) -> Option<LinkEndpoint> {
        self.link_listener.recv().await
    }
}

/// Accepts remotely initiated sessions.
///
/// The answering Begin is sent before [`SessionAcceptor::accept`] returns,
/// so accepting inside the loop that polls
/// [`next_incoming_session`](ListenerConnectionHandle::next_incoming_session)
/// answers the peer's endpoint promptly.
#[derive(Debug, Clone)]
pub struct SessionAcceptor {
    /// The initial incoming-window of the session
    pub incoming_window: UInt,

    /// The initial outgoing-window of the session
    pub outgoing_window: UInt,

    /// The maximum handle value for links on the session
    pub handle_max: Handle,

    /// Buffer size of the channels used by the session
    pub buffer_size: usize,
}

impl Default for SessionAcceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionAcceptor {
    /// Creates a session acceptor with the default configuration
    pub fn new() -> Self {
        Self {
            incoming_window: DEFAULT_WINDOW,
            outgoing_window: DEFAULT_WINDOW,
            handle_max: Default::default(),
            buffer_size: DEFAULT_SESSION_MUX_BUFFER_SIZE,
        }
    }

    /// Sets the incoming window
    pub fn incoming_window(mut self, incoming_window: UInt) -> Self {
        self.incoming_window = incoming_window;
        self
    }

    /// Sets the outgoing window
    pub fn outgoing_window(mut self, outgoing_window: UInt) -> Self {
        self.outgoing_window = outgoing_window;
        self
    }

    /// Accepts a remotely initiated session.
    ///
    /// Registers the session on the connection, processes the peer's Begin
    /// and sends the answering Begin before spawning the session event
    /// loop.
    pub async fn accept(
        &self,
        mut incoming: IncomingSession,
        connection: &mut ListenerConnectionHandle,
    ) -> Result<ListenerSessionHandle, BeginError> {
        let (incoming_tx, incoming_rx) = mpsc::channel(self.buffer_size);
        let (control_tx, control_rx) = mpsc::channel(DEFAULT_SESSION_CONTROL_BUFFER_SIZE);
        let (outgoing_link_tx, outgoing_link_rx) = mpsc::channel(self.buffer_size);
        let (link_listener_tx, link_listener_rx) =
            mpsc::channel(DEFAULT_LINK_LISTENER_BUFFER_SIZE);

        let (outgoing_channel, session_id) = connection
            .allocate_incoming_session(incoming_tx, incoming.channel)
            .await?;

        let session_builder = SessionBuilder {
            next_outgoing_id: 0,
            incoming_window: self.incoming_window,
            outgoing_window: self.outgoing_window,
            handle_max: self.handle_max.clone(),
            buffer_size: self.buffer_size,
        };
        let mut session = Session::new(outgoing_channel, &session_builder);

        let begin = incoming.begin.clone();
        let result = async {
            session
                .on_incoming_begin(incoming.channel, begin)
                .map_err(|_| BeginError::IllegalState)?;
            // The answering Begin goes out before accept() returns;
            // deferring it would leave the peer's endpoint unanswered
            session.send_begin(&connection.outgoing).await
        }
        .await;

        if let Err(err) = result {
            let _ = connection
                .control
                .send(ConnectionControl::DeallocateSession(session_id))
                .await;
            return Err(err);
        }

        incoming.accepted = true;

        let engine = SessionEngine::new_mapped(
            connection.control.clone(),
            session,
            session_id,
            control_rx,
            incoming_rx,
            connection.outgoing.clone(),
            outgoing_link_rx,
            Some(link_listener_tx),
        );
        let engine_handle = engine.spawn();

        Ok(SessionHandle {
            control: control_tx,
            engine_handle: Some(engine_handle),
            outgoing: outgoing_link_tx,
            link_listener: link_listener_rx,
        })
    }
}
