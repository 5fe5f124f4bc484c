//! The session event loop.
//!
//! Like the connection engine, one call to
//! [`SessionEngine::poll_once`] handles exactly one unit of work; the
//! spawned task loops it until the session unmaps.

use fe2o3_amqp_types::definitions::{self, AmqpError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace};

use crate::acceptor::LinkEndpoint;
use crate::connection::SessionId;
use crate::control::{ConnectionControl, SessionControl};
use crate::link::LinkFrame;
use crate::session::frame::{SessionFrame, SessionFrameBody};
use crate::util::Running;

use super::{error::BeginError, Error, Session, SessionState};

pub(crate) struct SessionEngine {
    conn_control: mpsc::Sender<ConnectionControl>,
    session: Session,
    session_id: SessionId,
    control: mpsc::Receiver<SessionControl>,
    incoming: mpsc::Receiver<SessionFrame>,
    outgoing: mpsc::Sender<SessionFrame>,
    outgoing_link_frames: mpsc::Receiver<LinkFrame>,
    link_listener: Option<mpsc::Sender<LinkEndpoint>>,
}

impl SessionEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn begin_client_session(
        conn_control: mpsc::Sender<ConnectionControl>,
        session: Session,
        session_id: SessionId,
        control: mpsc::Receiver<SessionControl>,
        incoming: mpsc::Receiver<SessionFrame>,
        outgoing: mpsc::Sender<SessionFrame>,
        outgoing_link_frames: mpsc::Receiver<LinkFrame>,
        link_listener: Option<mpsc::Sender<LinkEndpoint>>,
    ) -> Result<Self, BeginError> {
        let mut engine = Self {
            conn_control,
            session,
            session_id,
            control,
            incoming,
            outgoing,
            outgoing_link_frames,
            link_listener,
        };

        // send a Begin
        engine.session.send_begin(&engine.outgoing).await?;

        // wait for the answering Begin
        let frame = match engine.incoming.recv().await {
            Some(frame) => frame,
            // the connection event loop must have stopped
            None => return Err(BeginError::IllegalConnectionState),
        };
        let SessionFrame { channel, body } = frame;
        match body {
            SessionFrameBody::Begin(begin) => {
                engine
                    .session
                    .on_incoming_begin(channel, begin)
                    .map_err(|_| BeginError::IllegalState)?;
            }
            SessionFrameBody::End(end) => {
                return Err(match end.error {
                    Some(error) => BeginError::RemoteEndedWithError(error),
                    None => BeginError::RemoteEnded,
                })
            }
            _ => return Err(BeginError::IllegalState),
        }
        Ok(engine)
    }

    /// Listener side: the remote Begin was already handled by the acceptor,
    /// and the answering Begin was already sent. The engine starts mapped.
    pub(crate) fn new_mapped(
        conn_control: mpsc::Sender<ConnectionControl>,
        session: Session,
        session_id: SessionId,
        control: mpsc::Receiver<SessionControl>,
        incoming: mpsc::Receiver<SessionFrame>,
        outgoing: mpsc::Sender<SessionFrame>,
        outgoing_link_frames: mpsc::Receiver<LinkFrame>,
        link_listener: Option<mpsc::Sender<LinkEndpoint>>,
    ) -> Self {
        Self {
            conn_control,
            session,
            session_id,
            control,
            incoming,
            outgoing,
            outgoing_link_frames,
            link_listener,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.event_loop())
    }

    #[instrument(name = "RECV", skip_all)]
    async fn on_incoming(&mut self, incoming: SessionFrame) -> Result<Running, Error> {
        let SessionFrame { channel, body } = incoming;

        match body {
            SessionFrameBody::Begin(begin) => {
                self.session.on_incoming_begin(channel, begin)?;
            }
            SessionFrameBody::Attach(attach) => {
                if let Some(attach) = self.session.on_incoming_attach(attach).await? {
                    match &self.link_listener {
                        Some(listener) => {
                            let endpoint = LinkEndpoint::new(attach);
                            if listener.send(endpoint).await.is_err() {
                                return Err(Error::RemoteAttachingLinkNotFound(
                                    "Link listener has been dropped".to_string(),
                                ));
                            }
                        }
                        None => {
                            return Err(Error::RemoteAttachingLinkNotFound(attach.name));
                        }
                    }
                }
            }
            SessionFrameBody::Flow(flow) => {
                if let Some(echo) = self.session.on_incoming_flow(flow)? {
                    self.outgoing
                        .send(echo)
                        .await
                        .map_err(|_| Error::IllegalConnectionState)?;
                }
            }
            SessionFrameBody::Transfer {
                performative,
                payload,
            } => {
                self.session
                    .on_incoming_transfer(performative, payload)
                    .await?;
            }
            SessionFrameBody::Disposition(disposition) => {
                self.session.on_incoming_disposition(disposition)?;
            }
            SessionFrameBody::Detach(detach) => {
                self.session.on_incoming_detach(detach).await?;
            }
            SessionFrameBody::End(end) => {
                let remote_error = self.session.on_incoming_end(channel, end)?;
                if self.session.local_state() == &SessionState::EndReceived {
                    self.session.send_end(&self.outgoing, None).await?;
                }
                if let Some(error) = remote_error {
                    return Err(Error::RemoteEndedWithError(error));
                }
            }
        }

        Ok(self.running_by_state())
    }

    #[instrument(name = "CTRL", skip_all)]
    async fn on_control(&mut self, control: SessionControl) -> Result<Running, Error> {
        trace!(control = %control);
        match control {
            SessionControl::End(error) => {
                self.session.send_end(&self.outgoing, error).await?;
            }
            SessionControl::AllocateLink {
                link_name,
                link_relay,
                responder,
            } => {
                let result = self.session.allocate_link(link_name, link_relay);
                responder.send(result).map_err(|_| Error::IllegalState)?;
            }
            SessionControl::AllocateIncomingLink {
                link_name,
                link_relay,
                input_handle,
                responder,
            } => {
                let result = self
                    .session
                    .allocate_incoming_link(link_name, link_relay, input_handle);
                responder.send(result).map_err(|_| Error::IllegalState)?;
            }
            SessionControl::DeallocateLink(link_name) => {
                self.session.deallocate_link(&link_name);
            }
            SessionControl::Disposition(disposition) => {
                let frame = self.session.on_outgoing_disposition(disposition);
                self.outgoing
                    .send(frame)
                    .await
                    .map_err(|_| Error::IllegalConnectionState)?;
            }
        }

        Ok(self.running_by_state())
    }

    #[instrument(name = "SEND", skip_all)]
    async fn on_outgoing_link_frames(&mut self, frame: LinkFrame) -> Result<Running, Error> {
        match self.session.local_state() {
            SessionState::Mapped => {}
            // A link frame that raced the session end is dropped; the
            // frames of the end handshake itself do not come this way
            _ => return Ok(self.running_by_state()),
        }

        let session_frame = match frame {
            LinkFrame::Attach(attach) => self.session.on_outgoing_attach(attach),
            LinkFrame::Flow(flow) => self.session.on_outgoing_flow(flow),
            LinkFrame::Transfer {
                performative,
                payload,
                completion,
            } => self
                .session
                .on_outgoing_transfer(performative, payload, completion),
            LinkFrame::Disposition(disposition) => {
                self.session.on_outgoing_disposition(disposition)
            }
            LinkFrame::Detach(detach) => self.session.on_outgoing_detach(detach),
        };

        self.outgoing
            .send(session_frame)
            .await
            .map_err(|_| Error::IllegalConnectionState)?;

        Ok(self.running_by_state())
    }

    fn running_by_state(&self) -> Running {
        match self.session.local_state() {
            SessionState::Unmapped => Running::Stop,
            _ => Running::Continue,
        }
    }

    /// Handles exactly one unit of work of the session
    pub(crate) async fn poll_once(&mut self) -> Result<Running, Error> {
        tokio::select! {
            incoming = self.incoming.recv() => {
                match incoming {
                    Some(incoming) => self.on_incoming(incoming).await,
                    None => {
                        // The connection event loop stopped before the
                        // session negotiated its end
                        match self.session.local_state() {
                            SessionState::Unmapped | SessionState::Discarding => Ok(Running::Stop),
                            _ => Err(Error::IllegalConnectionState),
                        }
                    }
                }
            },
            control = self.control.recv() => {
                match control {
                    Some(control) => self.on_control(control).await,
                    // All links and the session handle were dropped
                    None => Ok(Running::Stop),
                }
            },
            frame = self.outgoing_link_frames.recv() => {
                match frame {
                    Some(frame) => self.on_outgoing_link_frames(frame).await,
                    // All links were dropped; the handle still holds a
                    // sender so this only happens on teardown
                    None => Ok(Running::Continue),
                }
            }
        }
    }

    #[instrument(name = "Session::event_loop", skip_all, fields(outgoing_channel = self.session.outgoing_channel()))]
    async fn event_loop(mut self) -> Result<(), Error> {
        let mut outcome = Ok(());
        loop {
            match self.poll_once().await {
                Ok(Running::Continue) => {}
                Ok(Running::Stop) => break,
                Err(err) => {
                    error!("{:?}", err);
                    // A session level error ends the session; the peer is
                    // told when the state machine still permits an End
                    if matches!(self.session.local_state(), SessionState::Mapped) {
                        let end_error = definitions::Error::new(
                            AmqpError::InternalError,
                            Some(err.to_string()),
                            None,
                        );
                        let _ = self.session.send_end(&self.outgoing, Some(end_error)).await;
                    }
                    outcome = Err(err);
                    break;
                }
            }
        }

        debug!("Session event loop stopped");
        let _ = self
            .conn_control
            .send(ConnectionControl::DeallocateSession(self.session_id))
            .await;
        outcome
    }
}
