//! Builder for [`crate::session::Session`]

use fe2o3_amqp_types::{definitions::Handle, primitives::Uint as UInt};
use tokio::sync::mpsc;

use crate::{connection::ConnectionHandle, control::ConnectionControl};

use super::{
    engine::SessionEngine, error::BeginError, Session, SessionHandle, DEFAULT_WINDOW,
};

pub(crate) const DEFAULT_SESSION_CONTROL_BUFFER_SIZE: usize = 128;
pub(crate) const DEFAULT_SESSION_MUX_BUFFER_SIZE: usize = u16::MAX as usize;

/// Builder for a [`Session`]
#[derive(Debug, Clone)]
pub struct Builder {
    /// The transfer-id of the first transfer id the sender will send
    pub next_outgoing_id: UInt,

    /// The initial incoming-window of the sender
    pub incoming_window: UInt,

    /// The initial outgoing-window of the sender
    pub outgoing_window: UInt,

    /// The maximum handle value that can be used on the session
    pub handle_max: Handle,

    /// Buffer size of the channels used by the session
    pub buffer_size: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a new builder with the default configuration
    pub fn new() -> Self {
        Self {
            next_outgoing_id: 0,
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

    /// Sets the handle max
    pub fn handle_max(mut self, handle_max: impl Into<Handle>) -> Self {
        self.handle_max = handle_max.into();
        self
    }

    /// Sets the buffer size of the session channels
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Begins a session on the connection.
    ///
    /// Sends a Begin and waits for the answering Begin from the peer.
    pub async fn begin(
        self,
        connection: &mut ConnectionHandle<()>,
    ) -> Result<SessionHandle<()>, BeginError> {
        let (incoming_tx, incoming_rx) = mpsc::channel(self.buffer_size);
        let (control_tx, control_rx) = mpsc::channel(DEFAULT_SESSION_CONTROL_BUFFER_SIZE);
        let (outgoing_link_tx, outgoing_link_rx) = mpsc::channel(self.buffer_size);

        let (outgoing_channel, session_id) = connection.allocate_session(incoming_tx).await?;
        let session = Session::new(outgoing_channel, &self);

        let engine = SessionEngine::begin_client_session(
            connection.control.clone(),
            session,
            session_id,
            control_rx,
            incoming_rx,
            connection.outgoing.clone(),
            outgoing_link_rx,
            None,
        )
        .await;

        let engine = match engine {
            Ok(engine) => engine,
            Err(err) => {
                // The allocated channel must not leak when the begin
                // handshake fails
                let _ = connection
                    .control
                    .send(ConnectionControl::DeallocateSession(session_id))
                    .await;
                return Err(err);
            }
        };

        let engine_handle = engine.spawn();

        Ok(SessionHandle {
            control: control_tx,
            engine_handle: Some(engine_handle),
            outgoing: outgoing_link_tx,
            link_listener: (),
        })
    }
}
