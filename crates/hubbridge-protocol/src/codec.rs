//! Length-prefixed MessagePack framing for the host channel.
//!
//! Each frame on the wire is a 4-byte big-endian length followed by the
//! MessagePack encoding of a [`Frame`] with named fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors raised while framing or parsing host frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Read the length prefix, if present, and check it against the limit.
fn body_len(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(Some(len))
}

fn to_body(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let body = rmp_serde::to_vec_named(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    Ok(body)
}

/// Encode a frame to a standalone buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Append an encoded frame to an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = to_body(frame)?;
    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(())
}

/// Decode exactly one frame from the start of `data`.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let len = body_len(data)?
        .ok_or_else(|| ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()))?;

    let total = LENGTH_PREFIX_SIZE + len;
    if data.len() < total {
        return Err(ProtocolError::Incomplete(total - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total])?)
}

/// Try to take one frame off the front of a read buffer.
///
/// Returns `Ok(None)` while the buffer holds only part of a frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid. An invalid body is
/// consumed so that the stream can continue with the next frame.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(len) = body_len(buf)? else {
        return Ok(None);
    };
    if buf.len() < LENGTH_PREFIX_SIZE + len {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(len);
    Ok(Some(rmp_serde::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::frames::{ErrorCode, Outcome};
    use crate::value::Value;

    #[test]
    fn test_reply_survives_framing() {
        let frame = Frame::error(9, ErrorCode::NotFound, "No connection with id c9");
        let decoded = decode(&encode(&frame).unwrap()).unwrap();

        match decoded {
            Frame::Reply {
                seq,
                outcome: Outcome::Error { code, message },
            } => {
                assert_eq!(seq, 9);
                assert_eq!(code, ErrorCode::NotFound);
                assert!(message.contains("c9"));
            }
            other => panic!("Expected error reply, got {:?}", other),
        }
    }

    #[test]
    fn test_request_without_arguments_defaults_to_null() {
        #[derive(serde::Serialize)]
        struct BareRequest<'a> {
            #[serde(rename = "type")]
            kind: &'a str,
            seq: u64,
            method: &'a str,
        }

        let body = rmp_serde::to_vec_named(&BareRequest {
            kind: "request",
            seq: 3,
            method: "stop",
        })
        .unwrap();
        let mut data = (body.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(&body);

        match decode(&data).unwrap() {
            Frame::Request { arguments, .. } => assert!(arguments.is_null()),
            other => panic!("Expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_lying_array_header_is_skipped() {
        #[derive(serde::Serialize)]
        struct BareRequest<'a> {
            #[serde(rename = "type")]
            kind: &'a str,
            seq: u64,
            method: &'a str,
        }

        let mut body = rmp_serde::to_vec_named(&BareRequest {
            kind: "request",
            seq: 4,
            method: "invokeServerMethod",
        })
        .unwrap();
        // Grow the fixmap by one entry: "arguments" => array32 of u32::MAX items.
        assert_eq!(body[0], 0x83);
        body[0] = 0x84;
        body.push(0xa0 | 9);
        body.extend_from_slice(b"arguments");
        body.extend_from_slice(&[0xdd, 0xff, 0xff, 0xff, 0xff]);

        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);
        encode_into(&Frame::ok(5, true), &mut buf).unwrap();

        assert!(matches!(decode_from(&mut buf), Err(ProtocolError::Decode(_))));
        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::ok(5, true)));
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&Frame::status("c1", "Connected")).unwrap();

        match decode(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
        match decode(&encoded[..2]) {
            Err(ProtocolError::Incomplete(2)) => {}
            other => panic!("Expected Incomplete(2), got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_streaming_decode_across_partial_reads() {
        let first = Frame::request(1, &Command::IsConnected { id: "a".into() });
        let second = Frame::new_message("a", "Tick", Value::Int(5));

        let mut wire = BytesMut::new();
        encode_into(&first, &mut wire).unwrap();
        encode_into(&second, &mut wire).unwrap();

        // Feed the stream in two uneven chunks.
        let mut buf = BytesMut::new();
        let split = wire.len() - 3;
        buf.extend_from_slice(&wire[..split]);

        assert_eq!(decode_from(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_from(&mut buf).unwrap(), None);

        buf.extend_from_slice(&wire[split..]);
        assert_eq!(decode_from(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }
}
