//! AMQP frame type and the corresponding encoder and decoder

use bytes::{Buf, BufMut, BytesMut};
use fe2o3_amqp_types::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
};
use serde::{ser::Serialize, Deserialize};
use serde_amqp::{de::Deserializer, read::IoReader};
use tokio_util::codec::{Decoder, Encoder};

use crate::Payload;

use super::{Error, FRAME_TYPE_AMQP};

/// AMQP frame
#[derive(Debug)]
pub struct Frame {
    /// AMQP frame channel
    pub channel: u16,

    /// AMQP frame body
    pub body: FrameBody,
}

impl Frame {
    /// Creates a new AMQP frame
    pub fn new(channel: impl Into<u16>, body: FrameBody) -> Self {
        Self {
            channel: channel.into(),
            body,
        }
    }

    /// Creates an empty frame. An empty frame only resets the peer's idle
    /// timeout.
    pub fn empty() -> Self {
        Self {
            channel: 0,
            body: FrameBody::Empty,
        }
    }
}

/// AMQP frame body
#[derive(Debug)]
pub enum FrameBody {
    /// Open performative
    Open(Open),

    /// Begin performative
    Begin(Begin),

    /// Attach performative
    Attach(Attach),

    /// Flow performative
    Flow(Flow),

    /// Transfer performative and payload
    Transfer {
        /// Transfer performative
        performative: Transfer,

        /// Binary payload
        payload: Payload,
    },

    /// Disposition performative
    Disposition(Disposition),

    /// Detach performative
    Detach(Detach),

    /// End performative
    End(End),

    /// Close performative
    Close(Close),

    /// An empty frame used only for resetting idle timeout
    Empty,
}

/// Encoder and decoder of AMQP frames.
///
/// The four byte size prefix is handled by the length delimited codec in the
/// transport; this codec covers the remaining four header bytes (doff, type,
/// channel) and the performative body.
#[derive(Debug)]
pub struct FrameCodec {}

fn write_header(dst: &mut BytesMut, channel: u16) {
    // The extended header is ignored, thus doff is always 2
    dst.put_u8(2);
    dst.put_u8(FRAME_TYPE_AMQP);
    dst.put_u16(channel);
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        use serde_amqp::ser::Serializer;

        write_header(dst, item.channel);

        match item.body {
            FrameBody::Open(performative) => {
                let mut serializer = Serializer::from(dst.writer());
                performative.serialize(&mut serializer)?;
            }
            FrameBody::Begin(performative) => {
                let mut serializer = Serializer::from(dst.writer());
                performative.serialize(&mut serializer)?;
            }
            FrameBody::Attach(performative) => {
                let mut serializer = Serializer::from(dst.writer());
                performative.serialize(&mut serializer)?;
            }
            FrameBody::Flow(performative) => {
                let mut serializer = Serializer::from(dst.writer());
                performative.serialize(&mut serializer)?;
            }
            FrameBody::Transfer {
                performative,
                payload,
            } => {
                let mut serializer = Serializer::from(dst.writer());
                performative.serialize(&mut serializer)?;
                dst.put(payload);
            }
            FrameBody::Disposition(performative) => {
                let mut serializer = Serializer::from(dst.writer());
                performative.serialize(&mut serializer)?;
            }
            FrameBody::Detach(performative) => {
                let mut serializer = Serializer::from(dst.writer());
                performative.serialize(&mut serializer)?;
            }
            FrameBody::End(performative) => {
                let mut serializer = Serializer::from(dst.writer());
                performative.serialize(&mut serializer)?;
            }
            FrameBody::Close(performative) => {
                let mut serializer = Serializer::from(dst.writer());
                performative.serialize(&mut serializer)?;
            }
            FrameBody::Empty => {}
        }

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.remaining() < 4 {
            return Err(Error::NotImplemented);
        }

        let doff = src.get_u8();
        let ftype = src.get_u8();
        let channel = src.get_u16();

        if ftype != FRAME_TYPE_AMQP {
            return Err(Error::NotImplemented);
        }

        if doff != 2 {
            return Err(Error::NotImplemented);
        }

        let body = if src.is_empty() {
            FrameBody::Empty
        } else {
            let reader = IoReader::new(src.reader());
            let mut deserializer = Deserializer::new(reader);
            let performative: Performative = Deserialize::deserialize(&mut deserializer)?;

            match performative {
                Performative::Open(performative) => FrameBody::Open(performative),
                Performative::Begin(performative) => FrameBody::Begin(performative),
                Performative::Attach(performative) => FrameBody::Attach(performative),
                Performative::Flow(performative) => FrameBody::Flow(performative),
                Performative::Transfer(performative) => {
                    let payload = src.split().freeze();
                    FrameBody::Transfer {
                        performative,
                        payload,
                    }
                }
                Performative::Disposition(performative) => FrameBody::Disposition(performative),
                Performative::Detach(performative) => FrameBody::Detach(performative),
                Performative::End(performative) => FrameBody::End(performative),
                Performative::Close(performative) => FrameBody::Close(performative),
            }
        };

        Ok(Some(Frame { channel, body }))
    }
}

/// Splits an outgoing transfer into as many frames as the negotiated max
/// frame size requires.
///
/// The first frame carries the full transfer performative; the continuation
/// frames only repeat the handle and the `more` flag as permitted by the
/// specification. The last frame restores the original `more` value so that
/// link-level pre-splitting is preserved.
pub(crate) fn split_transfer(
    mut performative: Transfer,
    mut payload: Payload,
    max_frame_size: usize,
) -> Result<Vec<Frame>, serde_amqp::Error> {
    // 8 bytes of frame header (4 size prefix + doff + type + channel)
    let max_body_size = max_frame_size.saturating_sub(8);

    let serialized = serde_amqp::to_vec(&performative)?;
    if serialized.len() + payload.len() <= max_body_size {
        let frame = Frame::new(
            0u16,
            FrameBody::Transfer {
                performative,
                payload,
            },
        );
        return Ok(vec![frame]);
    }

    let orig_more = performative.more;
    let mut frames = Vec::new();

    // First frame keeps delivery-id, delivery-tag and message-format
    performative.more = true;
    let serialized = serde_amqp::to_vec(&performative)?;
    let split_index = max_body_size.saturating_sub(serialized.len());
    let partial = payload.split_to(split_index.min(payload.len()));
    frames.push(Frame::new(
        0u16,
        FrameBody::Transfer {
            performative: performative.clone(),
            payload: partial,
        },
    ));

    // Continuation frames may omit the per-delivery fields
    performative.delivery_id = None;
    performative.delivery_tag = None;
    performative.message_format = None;
    performative.settled = None;
    performative.rcv_settle_mode = None;
    let serialized = serde_amqp::to_vec(&performative)?;
    let split_index = max_body_size.saturating_sub(serialized.len()).max(1);

    while payload.len() > split_index {
        let partial = payload.split_to(split_index);
        frames.push(Frame::new(
            0u16,
            FrameBody::Transfer {
                performative: performative.clone(),
                payload: partial,
            },
        ));
    }

    performative.more = orig_more;
    frames.push(Frame::new(
        0u16,
        FrameBody::Transfer {
            performative,
            payload,
        },
    ));

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use fe2o3_amqp_types::performatives::Transfer;
    use tokio_util::codec::{Decoder, Encoder};

    use super::{split_transfer, Frame, FrameBody, FrameCodec};

    #[test]
    fn empty_frame_encodes_to_header_only() {
        let empty = Frame::empty();
        let mut encoder = FrameCodec {};
        let mut dst = BytesMut::new();
        encoder.encode(empty, &mut dst).unwrap();
        assert_eq!(&dst[..], &[0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn empty_frame_decodes_to_empty_body() {
        let mut decoder = FrameCodec {};
        let mut src = BytesMut::from(&[0x02, 0x00, 0x00, 0x00][..]);
        let frame = decoder.decode(&mut src).unwrap().unwrap();
        assert!(matches!(frame.body, FrameBody::Empty));
    }

    fn test_transfer() -> Transfer {
        Transfer {
            handle: 0.into(),
            delivery_id: Some(0),
            delivery_tag: Some(vec![0, 0, 0, 0].into()),
            message_format: Some(0),
            settled: Some(false),
            more: false,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        }
    }

    #[test]
    fn small_transfer_is_not_split() {
        let payload = Bytes::from_static(b"hello");
        let frames = split_transfer(test_transfer(), payload, 512).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn oversized_transfer_is_split_and_payload_preserved() {
        let payload = Bytes::from(vec![0xABu8; 2000]);
        let frames = split_transfer(test_transfer(), payload, 512).unwrap();
        assert!(frames.len() > 1);

        let mut total = 0;
        for (i, frame) in frames.iter().enumerate() {
            match &frame.body {
                FrameBody::Transfer {
                    performative,
                    payload,
                } => {
                    total += payload.len();
                    if i + 1 < frames.len() {
                        assert!(performative.more);
                    } else {
                        assert!(!performative.more);
                    }
                }
                _ => panic!("expected transfer frame"),
            }
        }
        assert_eq!(total, 2000);
    }
}
