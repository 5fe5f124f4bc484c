//! The connection event loop.
//!
//! One call to [`ConnectionEngine::poll_once`] handles exactly one unit of
//! work: an incoming frame, a control message, an outgoing session frame, or
//! a heartbeat tick. [`ConnectionEngine::spawn`] wraps the loop in a
//! background task, which is how the builder wires connections by default.

use fe2o3_amqp_types::definitions::{self, AmqpError};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace};

use crate::acceptor::IncomingSession;
use crate::connection::{Connection, ConnectionState, IncomingBegin};
use crate::control::ConnectionControl;
use crate::frames::amqp::{split_transfer, Frame, FrameBody};
use crate::session::frame::{SessionFrame, SessionFrameBody};
use crate::transport::Transport;
use crate::util::Running;

use super::heartbeat::HeartBeat;
use super::{Error, OpenError};

pub(crate) struct ConnectionEngine<Io> {
    transport: Transport<Io>,
    connection: Connection,
    control: mpsc::Receiver<ConnectionControl>,
    outgoing_session_frames: mpsc::Receiver<SessionFrame>,
    heartbeat: HeartBeat,
    max_frame_size: usize,
    session_listener: Option<mpsc::Sender<IncomingSession>>,
    control_tx: mpsc::Sender<ConnectionControl>,
}

impl<Io> ConnectionEngine<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Client side open: send the local Open, wait for the remote Open
    pub(crate) async fn open(
        transport: Transport<Io>,
        connection: Connection,
        control: mpsc::Receiver<ConnectionControl>,
        control_tx: mpsc::Sender<ConnectionControl>,
        outgoing_session_frames: mpsc::Receiver<SessionFrame>,
    ) -> Result<Self, OpenError> {
        let mut engine = Self {
            transport,
            connection,
            control,
            outgoing_session_frames,
            heartbeat: HeartBeat::never(),
            max_frame_size: 512,
            session_listener: None,
            control_tx,
        };

        engine
            .connection
            .send_open(&mut engine.transport)
            .await
            .map_err(map_open_error)?;

        let frame = match engine.transport.next().await {
            Some(frame) => frame.map_err(Error::from).map_err(map_open_error)?,
            None => {
                return Err(OpenError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Stream closed before the remote Open",
                )))
            }
        };

        let Frame { channel, body } = frame;
        let remote_open = match body {
            FrameBody::Open(open) => open,
            FrameBody::Close(close) => return Err(OpenError::RemoteClosed(close.error)),
            _ => return Err(OpenError::IllegalState),
        };

        engine.negotiate_transport_settings(channel, remote_open)?;
        Ok(engine)
    }

    /// Listener side open: wait for the remote Open, then answer with the
    /// local Open
    pub(crate) async fn open_listener(
        transport: Transport<Io>,
        connection: Connection,
        control: mpsc::Receiver<ConnectionControl>,
        control_tx: mpsc::Sender<ConnectionControl>,
        outgoing_session_frames: mpsc::Receiver<SessionFrame>,
        session_listener: mpsc::Sender<IncomingSession>,
    ) -> Result<Self, OpenError> {
        let mut engine = Self {
            transport,
            connection,
            control,
            outgoing_session_frames,
            heartbeat: HeartBeat::never(),
            max_frame_size: 512,
            session_listener: Some(session_listener),
            control_tx,
        };

        let frame = match engine.transport.next().await {
            Some(frame) => frame.map_err(Error::from).map_err(map_open_error)?,
            None => {
                return Err(OpenError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Stream closed before the remote Open",
                )))
            }
        };

        let Frame { channel, body } = frame;
        let remote_open = match body {
            FrameBody::Open(open) => open,
            _ => return Err(OpenError::IllegalState),
        };

        engine.negotiate_transport_settings(channel, remote_open)?;
        engine
            .connection
            .send_open(&mut engine.transport)
            .await
            .map_err(map_open_error)?;
        Ok(engine)
    }

    fn negotiate_transport_settings(
        &mut self,
        channel: u16,
        remote_open: fe2o3_amqp_types::performatives::Open,
    ) -> Result<(), OpenError> {
        let remote_max_frame_size = remote_open.max_frame_size.0;
        let remote_idle_timeout = remote_open.idle_time_out;

        self.connection
            .on_incoming_open(channel, remote_open)
            .map_err(map_open_error)?;

        let max_frame_size = std::cmp::min(
            self.connection.local_open().max_frame_size.0,
            remote_max_frame_size,
        ) as usize;
        self.transport.set_max_frame_size(max_frame_size);
        self.max_frame_size = max_frame_size;

        // To avoid spurious timeouts, heartbeats are emitted at half the
        // period the peer announced
        match remote_idle_timeout {
            Some(millis) if millis > 0 => {
                let period = std::time::Duration::from_millis(millis as u64 / 2);
                self.heartbeat = HeartBeat::new(period);
            }
            _ => self.heartbeat = HeartBeat::never(),
        };

        Ok(())
    }

    pub(crate) fn spawn(self) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.event_loop())
    }
}

impl<Io> ConnectionEngine<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin,
{
    #[instrument(name = "RECV", skip_all)]
    async fn on_incoming(&mut self, incoming: Result<Frame, Error>) -> Result<Running, Error> {
        let Frame { channel, body } = incoming?;

        match body {
            FrameBody::Open(open) => {
                // A second Open is a protocol violation outside of the
                // pipelined-open paths, which the state machine rejects
                let remote_max_frame_size = open.max_frame_size.0;
                self.connection.on_incoming_open(channel, open)?;
                let max_frame_size = std::cmp::min(
                    self.connection.local_open().max_frame_size.0,
                    remote_max_frame_size,
                ) as usize;
                self.transport.set_max_frame_size(max_frame_size);
                self.max_frame_size = max_frame_size;
            }
            FrameBody::Begin(begin) => match self.connection.on_incoming_begin(channel, begin)? {
                IncomingBegin::RoutedToSession(session_id, begin) => {
                    let sframe = SessionFrame::new(channel, SessionFrameBody::Begin(begin));
                    self.connection.send_to_session(session_id, sframe).await?;
                }
                IncomingBegin::RemotelyInitiated(begin) => match &self.session_listener {
                    Some(listener) => {
                        let incoming = IncomingSession::new(
                            channel,
                            begin,
                            self.control_tx.clone(),
                        );
                        if listener.send(incoming).await.is_err() {
                            self.reject_incoming_session().await?;
                        }
                    }
                    None => {
                        return Err(Error::NotImplemented(Some(
                            "Remotely initiated sessions are not accepted by a client connection"
                                .to_string(),
                        )))
                    }
                },
            },
            FrameBody::Attach(attach) => {
                self.connection
                    .forward_to_session(channel, SessionFrameBody::Attach(attach))
                    .await?;
            }
            FrameBody::Flow(flow) => {
                self.connection
                    .forward_to_session(channel, SessionFrameBody::Flow(flow))
                    .await?;
            }
            FrameBody::Transfer {
                performative,
                payload,
            } => {
                self.connection
                    .forward_to_session(
                        channel,
                        SessionFrameBody::Transfer {
                            performative,
                            payload,
                        },
                    )
                    .await?;
            }
            FrameBody::Disposition(disposition) => {
                self.connection
                    .forward_to_session(channel, SessionFrameBody::Disposition(disposition))
                    .await?;
            }
            FrameBody::Detach(detach) => {
                self.connection
                    .forward_to_session(channel, SessionFrameBody::Detach(detach))
                    .await?;
            }
            FrameBody::End(end) => {
                let session_id = self.connection.on_incoming_end(channel, &end)?;
                let sframe = SessionFrame::new(channel, SessionFrameBody::End(end));
                self.connection.send_to_session(session_id, sframe).await?;
            }
            FrameBody::Close(close) => {
                let remote_error = self.connection.on_incoming_close(channel, close)?;
                if self.connection.local_state() == &ConnectionState::CloseReceived {
                    self.connection.send_close(&mut self.transport, None).await?;
                }
                if let Some(error) = remote_error {
                    return Err(Error::RemoteClosedWithError(error));
                }
            }
            FrameBody::Empty => {
                // The idle timeout is reset by the transport on any frame
            }
        }

        Ok(self.running_by_state())
    }

    #[instrument(name = "CTRL", skip_all)]
    async fn on_control(&mut self, control: ConnectionControl) -> Result<Running, Error> {
        trace!(control = %control);
        match control {
            ConnectionControl::Close(error) => {
                self.connection.send_close(&mut self.transport, error).await?;
            }
            ConnectionControl::GetRemoteMaxFrameSize(responder) => {
                let size = self.connection.remote_max_frame_size();
                let _ = responder.send(size);
            }
            ConnectionControl::AllocateSession { tx, responder } => {
                let result = self.connection.allocate_session(tx);
                responder.send(result).map_err(|_| Error::IllegalState)?;
            }
            ConnectionControl::AllocateIncomingSession {
                tx,
                incoming_channel,
                responder,
            } => {
                let result = self
                    .connection
                    .allocate_incoming_session(tx, incoming_channel);
                responder.send(result).map_err(|_| Error::IllegalState)?;
            }
            ConnectionControl::DeallocateSession(session_id) => {
                self.connection.deallocate_session(session_id)
            }
            ConnectionControl::RejectIncomingSession(_channel) => {
                self.reject_incoming_session().await?;
            }
        }

        Ok(self.running_by_state())
    }

    async fn reject_incoming_session(&mut self) -> Result<(), Error> {
        // A remotely initiated session endpoint that is not accepted right
        // away must be refused; the engine answers with a connection level
        // error so the peer's pending begin fails
        let error = definitions::Error::new(
            AmqpError::NotAllowed,
            Some("The incoming session endpoint was rejected".to_string()),
            None,
        );
        self.connection
            .send_close(&mut self.transport, Some(error))
            .await
    }

    #[instrument(name = "SEND", skip_all)]
    async fn on_outgoing_session_frames(&mut self, frame: SessionFrame) -> Result<Running, Error> {
        match self.connection.local_state() {
            ConnectionState::Opened => {}
            _ => return Err(Error::IllegalState),
        }

        let SessionFrame { channel, body } = frame;

        match body {
            SessionFrameBody::Begin(begin) => {
                self.transport
                    .send(Frame::new(channel, FrameBody::Begin(begin)))
                    .await?;
            }
            SessionFrameBody::Attach(attach) => {
                self.transport
                    .send(Frame::new(channel, FrameBody::Attach(attach)))
                    .await?;
            }
            SessionFrameBody::Flow(flow) => {
                self.transport
                    .send(Frame::new(channel, FrameBody::Flow(flow)))
                    .await?;
            }
            SessionFrameBody::Transfer {
                performative,
                payload,
            } => {
                // Transfers that exceed the negotiated max frame size are
                // split here where the agreed size is known
                let frames = split_transfer(performative, payload, self.max_frame_size)
                    .map_err(Error::FramingError)?;
                for mut split in frames {
                    split.channel = channel;
                    self.transport.send(split).await?;
                }
            }
            SessionFrameBody::Disposition(disposition) => {
                self.transport
                    .send(Frame::new(channel, FrameBody::Disposition(disposition)))
                    .await?;
            }
            SessionFrameBody::Detach(detach) => {
                self.transport
                    .send(Frame::new(channel, FrameBody::Detach(detach)))
                    .await?;
            }
            SessionFrameBody::End(end) => {
                let frame = self.connection.on_outgoing_end(channel, end)?;
                self.transport.send(frame).await?;
            }
        }

        Ok(Running::Continue)
    }

    async fn on_heartbeat(&mut self) -> Result<Running, Error> {
        match self.connection.local_state() {
            ConnectionState::Start | ConnectionState::HeaderSent | ConnectionState::CloseSent => {
                return Ok(Running::Continue)
            }
            ConnectionState::End => return Ok(Running::Stop),
            _ => {}
        }

        self.transport.send(Frame::empty()).await?;
        Ok(Running::Continue)
    }

    fn running_by_state(&self) -> Running {
        match self.connection.local_state() {
            ConnectionState::End => Running::Stop,
            _ => Running::Continue,
        }
    }

    /// Handles exactly one unit of work of the connection.
    ///
    /// This is the cooperative step the event loop is built from; the
    /// spawned task simply calls it in a loop until it reports
    /// [`Running::Stop`].
    pub(crate) async fn poll_once(&mut self) -> Result<Running, Error> {
        tokio::select! {
            _ = self.heartbeat.next() => self.on_heartbeat().await,
            incoming = self.transport.next() => {
                match incoming {
                    Some(incoming) => self.on_incoming(incoming.map_err(Into::into)).await,
                    // The incoming stream was closed by the peer
                    None => Ok(Running::Stop),
                }
            },
            control = self.control.recv() => {
                match control {
                    Some(control) => self.on_control(control).await,
                    // All handles were dropped
                    None => Ok(Running::Stop),
                }
            },
            frame = self.outgoing_session_frames.recv() => {
                match frame {
                    Some(frame) => self.on_outgoing_session_frames(frame).await,
                    // All sessions were dropped; the connection handle
                    // still holds a sender so this only happens on teardown
                    None => Ok(Running::Stop),
                }
            }
        }
    }

    #[instrument(name = "Connection::event_loop", skip_all)]
    async fn event_loop(mut self) -> Result<(), Error> {
        let mut outcome = Ok(());
        loop {
            match self.poll_once().await {
                Ok(Running::Continue) => {}
                Ok(Running::Stop) => break,
                Err(err) => {
                    error!("{:?}", err);
                    // A connection level error is terminal; notify the peer
                    // when the state machine still permits a Close
                    if matches!(self.connection.local_state(), ConnectionState::Opened) {
                        let close_error = definitions::Error::new(
                            AmqpError::InternalError,
                            Some(err.to_string()),
                            None,
                        );
                        let _ = self
                            .connection
                            .send_close(&mut self.transport, Some(close_error))
                            .await;
                    }
                    outcome = Err(err);
                    break;
                }
            }
        }

        debug!("Connection event loop stopped");
        outcome
    }
}

fn map_open_error(error: Error) -> OpenError {
    match error {
        Error::Io(err) => OpenError::Io(err),
        Error::IdleTimeoutElapsed => {
            OpenError::TransportError(crate::transport::Error::IdleTimeoutElapsed)
        }
        Error::FramingError(err) => {
            OpenError::TransportError(crate::transport::Error::FramingError(err))
        }
        Error::RemoteClosedWithError(err) => OpenError::RemoteClosed(Some(err)),
        _ => OpenError::IllegalState,
    }
}
