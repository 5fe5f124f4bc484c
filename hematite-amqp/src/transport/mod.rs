//! Low level transport framing over any `AsyncRead + AsyncWrite` byte stream
//!
//! Two layer design: a [`LengthDelimitedCodec`] handles the four byte size
//! prefix, while [`FrameCodec`] encodes and decodes the frame header and the
//! performative body. The protocol header and SASL exchanges run on the raw
//! stream before the framed transport is bound.

use std::{convert::TryFrom, task::Poll, time::Duration};

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use crate::{
    connection::ConnectionState,
    frames::{
        amqp::{Frame, FrameCodec},
        sasl,
    },
    sasl_profile::{Negotiation, SaslProfile},
    util::IdleTimeout,
};

mod error;
pub mod protocol_header;

pub use error::{Error, NegotiationError};
pub use protocol_header::{ProtocolHeader, ProtocolId};

pin_project! {
    /// Framed transport over a byte stream.
    ///
    /// Yields and accepts AMQP frames once the protocol header negotiation
    /// has completed. Tracks the remote-imposed idle timeout, resetting it on
    /// every inbound frame.
    #[derive(Debug)]
    pub struct Transport<Io> {
        #[pin]
        framed: Framed<Io, LengthDelimitedCodec>,
        #[pin]
        idle_timeout: Option<IdleTimeout>,
    }
}

impl<Io> Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Binds the framed transport to the stream.
    ///
    /// Prior to any explicit negotiation the maximum frame size is 512
    /// (MIN-MAX-FRAME-SIZE); renegotiate with
    /// [`set_max_frame_size`](Transport::set_max_frame_size) after the Open
    /// frames are exchanged.
    pub fn bind(io: Io, max_frame_size: usize, idle_timeout: Option<Duration>) -> Self {
        let framed = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(max_frame_size)
            .length_adjustment(-4)
            .new_framed(io);
        let idle_timeout = match idle_timeout {
            Some(duration) if !duration.is_zero() => Some(IdleTimeout::new(duration)),
            _ => None,
        };

        Self {
            framed,
            idle_timeout,
        }
    }

    /// Sets the max frame size of the transport
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) -> &mut Self {
        self.framed.codec_mut().set_max_frame_length(max_frame_size);
        self
    }

    /// Sets the idle timeout of the transport
    pub fn set_idle_timeout(&mut self, duration: Duration) -> &mut Self {
        self.idle_timeout = match duration.is_zero() {
            true => None,
            false => Some(IdleTimeout::new(duration)),
        };
        self
    }

    /// Sends the local protocol header
    pub async fn send_proto_header(
        io: &mut Io,
        local_state: &mut ConnectionState,
        proto_header: ProtocolHeader,
    ) -> Result<(), NegotiationError> {
        let buf: [u8; 8] = proto_header.into();
        match local_state {
            ConnectionState::Start => {
                io.write_all(&buf).await?;
                *local_state = ConnectionState::HeaderSent;
            }
            ConnectionState::HeaderReceived => {
                io.write_all(&buf).await?;
                *local_state = ConnectionState::HeaderExchange;
            }
            _ => return Err(illegal_state_io_error()),
        }
        Ok(())
    }

    /// Receives the peer's protocol header and compares it against the
    /// locally proposed one
    pub async fn recv_proto_header(
        io: &mut Io,
        local_state: &mut ConnectionState,
        proto_header: ProtocolHeader,
    ) -> Result<ProtocolHeader, NegotiationError> {
        match local_state {
            ConnectionState::Start => {
                let incoming = read_and_compare_proto_header(io, local_state, &proto_header).await?;
                *local_state = ConnectionState::HeaderReceived;
                Ok(incoming)
            }
            ConnectionState::HeaderSent => {
                let incoming = read_and_compare_proto_header(io, local_state, &proto_header).await?;
                *local_state = ConnectionState::HeaderExchange;
                Ok(incoming)
            }
            _ => Err(illegal_state_io_error()),
        }
    }

    /// Client side protocol header negotiation: send then receive
    pub async fn negotiate(
        io: &mut Io,
        local_state: &mut ConnectionState,
        proto_header: ProtocolHeader,
    ) -> Result<ProtocolHeader, NegotiationError> {
        Self::send_proto_header(io, local_state, proto_header.clone()).await?;
        Self::recv_proto_header(io, local_state, proto_header).await
    }

    /// Listener side protocol header negotiation: receive, then answer with
    /// the local header.
    ///
    /// The incoming header is inspected before replying, which lets a
    /// listener distinguish plain AMQP clients from SASL or TLS requests on
    /// the same port. A header that does not match the proposed one is
    /// answered with the local header before failing, as required by the
    /// specification.
    pub async fn negotiate_incoming(
        io: &mut Io,
        local_state: &mut ConnectionState,
        proto_header: ProtocolHeader,
    ) -> Result<ProtocolHeader, NegotiationError> {
        let mut buf = [0u8; 8];
        io.read_exact(&mut buf).await?;
        let incoming = match ProtocolHeader::try_from(buf) {
            Ok(header) if header == proto_header => header,
            _ => {
                let local: [u8; 8] = proto_header.into();
                io.write_all(&local).await?;
                *local_state = ConnectionState::End;
                return Err(NegotiationError::ProtocolHeaderMismatch(buf));
            }
        };
        *local_state = ConnectionState::HeaderReceived;
        Self::send_proto_header(io, local_state, proto_header).await?;
        Ok(incoming)
    }

    /// Performs the SASL security layer negotiation ahead of the AMQP
    /// protocol header exchange, returning the stream for AMQP use.
    pub async fn connect_sasl(
        mut io: Io,
        hostname: Option<&str>,
        mut profile: SaslProfile,
    ) -> Result<Io, NegotiationError> {
        use fe2o3_amqp_types::sasl::SaslCode;

        // SASL header exchange
        let proto_header = ProtocolHeader::sasl();
        let buf: [u8; 8] = proto_header.clone().into();
        io.write_all(&buf).await?;

        let mut inbound = [0u8; 8];
        io.read_exact(&mut inbound).await?;
        if ProtocolHeader::try_from(inbound).map_err(NegotiationError::ProtocolHeaderMismatch)?
            != proto_header
        {
            return Err(NegotiationError::ProtocolHeaderMismatch(inbound));
        }

        loop {
            let frame = read_sasl_frame(&mut io).await?;
            match profile.on_frame(frame, hostname)? {
                Negotiation::Init(init) => {
                    write_sasl_frame(&mut io, sasl::Frame::Init(init)).await?
                }
                Negotiation::Outcome(outcome) => match outcome.code {
                    SaslCode::Ok => return Ok(io),
                    code => {
                        return Err(NegotiationError::SaslError(
                            crate::sasl_profile::Error::NotOk {
                                code,
                                additional_data: outcome.additional_data.map(|b| b.into_vec()),
                            },
                        ))
                    }
                },
            }
        }
    }
}

fn illegal_state_io_error() -> NegotiationError {
    NegotiationError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "Protocol header exchanged in an unexpected connection state",
    ))
}

async fn read_and_compare_proto_header<Io>(
    io: &mut Io,
    local_state: &mut ConnectionState,
    proto_header: &ProtocolHeader,
) -> Result<ProtocolHeader, NegotiationError>
where
    Io: AsyncRead + Unpin,
{
    let mut inbound_buf = [0u8; 8];
    io.read_exact(&mut inbound_buf).await?;
    let incoming_header =
        ProtocolHeader::try_from(inbound_buf).map_err(NegotiationError::ProtocolHeaderMismatch)?;
    if incoming_header != *proto_header {
        *local_state = ConnectionState::End;
        return Err(NegotiationError::ProtocolHeaderMismatch(inbound_buf));
    }
    Ok(incoming_header)
}

async fn read_sasl_frame<Io>(io: &mut Io) -> Result<sasl::Frame, NegotiationError>
where
    Io: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 8 {
        return Err(NegotiationError::StreamClosed);
    }

    let mut body = BytesMut::zeroed(len - 4);
    io.read_exact(&mut body).await?;

    let mut codec = sasl::FrameCodec {};
    codec.decode(&mut body)?.ok_or(NegotiationError::StreamClosed)
}

async fn write_sasl_frame<Io>(io: &mut Io, frame: sasl::Frame) -> Result<(), NegotiationError>
where
    Io: AsyncWrite + Unpin,
{
    let mut body = BytesMut::new();
    let mut codec = sasl::FrameCodec {};
    codec.encode(frame, &mut body)?;

    let len = (body.len() + 4) as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&body).await?;
    io.flush().await?;
    Ok(())
}

impl<Io> Sink<Frame> for Transport<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        let mut bytesmut = BytesMut::new();
        let mut encoder = FrameCodec {};
        encoder.encode(item, &mut bytesmut)?;

        let this = self.project();
        this.framed
            .start_send(Bytes::from(bytesmut))
            .map_err(Into::into)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_close(cx).map_err(Into::into)
    }
}

impl<Io> Stream for Transport<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Frame, Error>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed.poll_next(cx) {
            Poll::Ready(next) => {
                if let Some(mut delay) = this.idle_timeout.as_pin_mut() {
                    delay.reset();
                }

                match next {
                    Some(item) => {
                        let mut src = match item {
                            Ok(b) => b,
                            // The only error reported by the length delimited
                            // codec other than io is exceeding the max frame
                            // length
                            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                                return Poll::Ready(Some(Err(Error::MaxFrameSizeExceeded)))
                            }
                            Err(err) => return Poll::Ready(Some(Err(err.into()))),
                        };
                        let mut decoder = FrameCodec {};
                        Poll::Ready(decoder.decode(&mut src).map_err(Into::into).transpose())
                    }
                    None => Poll::Ready(None),
                }
            }
            Poll::Pending => {
                // check whether the idle timeout has elapsed
                if let Some(delay) = this.idle_timeout.as_pin_mut() {
                    use futures_util::Future;
                    if let Poll::Ready(()) = delay.poll(cx) {
                        return Poll::Ready(Some(Err(Error::IdleTimeoutElapsed)));
                    }
                }

                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::performatives::Open;
    use futures_util::SinkExt;
    use tokio_test::io::Builder;

    use crate::connection::ConnectionState;
    use crate::frames::amqp::FrameBody;

    use super::{Frame, ProtocolHeader, Transport};

    #[tokio::test]
    async fn header_exchange_drives_state_to_header_exchange() {
        let mut mock = Builder::new()
            .write(b"AMQP")
            .write(&[0, 1, 0, 0])
            .read(b"AMQP")
            .read(&[0, 1, 0, 0])
            .build();

        let mut local_state = ConnectionState::Start;
        Transport::negotiate(&mut mock, &mut local_state, ProtocolHeader::amqp())
            .await
            .unwrap();
        assert!(matches!(local_state, ConnectionState::HeaderExchange));
    }

    #[tokio::test]
    async fn mismatched_header_ends_the_connection() {
        let mut mock = Builder::new()
            .write(b"AMQP")
            .write(&[0, 1, 0, 0])
            .read(b"AMQP")
            .read(&[3, 1, 0, 0]) // SASL header instead of AMQP
            .build();

        let mut local_state = ConnectionState::Start;
        let result = Transport::negotiate(&mut mock, &mut local_state, ProtocolHeader::amqp()).await;
        assert!(result.is_err());
        assert!(matches!(local_state, ConnectionState::End));
    }

    #[tokio::test]
    async fn empty_frame_is_length_prefixed() {
        let mock = Builder::new()
            .write(&[0x00, 0x00, 0x00, 0x08]) // size of the frame
            .write(&[0x02, 0x00, 0x00, 0x00])
            .build();
        let mut transport = Transport::bind(mock, 512, None);
        transport.send(Frame::empty()).await.unwrap();
    }

    #[tokio::test]
    async fn open_frame_encodes_through_the_transport() {
        let mock = Builder::new()
            .write(&[0x0, 0x0, 0x0, 0x29])
            .write(&[0x02, 0x0, 0x0, 0x0])
            .write(&[
                0x00, 0x53, 0x10, 0xC0, 0x1c, 0x05, 0xA1, 0x04, 0x31, 0x32, 0x33, 0x34, 0xA1, 0x09,
                0x31, 0x32, 0x37, 0x2E, 0x30, 0x2E, 0x30, 0x2E, 0x31, 0x70, 0x00, 0x00, 0x03, 0xe8,
                0x60, 0x00, 0x09, 0x52, 0x05,
            ])
            .build();
        let mut transport = Transport::bind(mock, 1000, None);

        let open = Open {
            container_id: "1234".into(),
            hostname: Some("127.0.0.1".into()),
            max_frame_size: 1000.into(),
            channel_max: 9.into(),
            idle_time_out: Some(5),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };

        let frame = Frame::new(0u16, FrameBody::Open(open));
        transport.send(frame).await.unwrap();
    }

    #[tokio::test]
    async fn sasl_plain_negotiation_succeeds() {
        use crate::sasl_profile::SaslProfile;

        // mechanisms frame: descriptor 0x40, list with one PLAIN symbol
        let mechanisms = serde_amqp::to_vec(&fe2o3_amqp_types::sasl::SaslMechanisms {
            sasl_server_mechanisms: vec!["PLAIN".into()].into(),
        })
        .unwrap();
        let mut mechanisms_frame = vec![];
        mechanisms_frame.extend_from_slice(&((mechanisms.len() + 8) as u32).to_be_bytes());
        mechanisms_frame.extend_from_slice(&[0x02, 0x01, 0x00, 0x00]);
        mechanisms_frame.extend_from_slice(&mechanisms);

        let init = serde_amqp::to_vec(&fe2o3_amqp_types::sasl::SaslInit {
            mechanism: "PLAIN".into(),
            initial_response: Some(serde_bytes::ByteBuf::from(b"\0guest\0guest".to_vec())),
            hostname: None,
        })
        .unwrap();
        let mut init_frame = vec![];
        init_frame.extend_from_slice(&((init.len() + 8) as u32).to_be_bytes());
        init_frame.extend_from_slice(&[0x02, 0x01, 0x00, 0x00]);
        init_frame.extend_from_slice(&init);

        let outcome = serde_amqp::to_vec(&fe2o3_amqp_types::sasl::SaslOutcome {
            code: fe2o3_amqp_types::sasl::SaslCode::Ok,
            additional_data: None,
        })
        .unwrap();
        let mut outcome_frame = vec![];
        outcome_frame.extend_from_slice(&((outcome.len() + 8) as u32).to_be_bytes());
        outcome_frame.extend_from_slice(&[0x02, 0x01, 0x00, 0x00]);
        outcome_frame.extend_from_slice(&outcome);

        let mock = Builder::new()
            .write(b"AMQP")
            .write(&[3, 1, 0, 0])
            .read(b"AMQP")
            .read(&[3, 1, 0, 0])
            .read(&mechanisms_frame)
            .write(&init_frame)
            .read(&outcome_frame)
            .build();

        let profile = SaslProfile::Plain {
            username: "guest".to_string(),
            password: "guest".to_string(),
        };
        Transport::connect_sasl(mock, None, profile).await.unwrap();
    }
}
