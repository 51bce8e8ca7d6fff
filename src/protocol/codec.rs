//! Stream encoder and decoder for single frames.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Payload, PayloadType, ProtocolSpec, HEADER_SIZE};
use crate::error::{Field, ProtocolError};

/// Serialize `payload` into a complete frame.
///
/// Bodies are expected to fit in a u32 length; anything larger than the
/// receiver's cap will be rejected on the other side anyway.
pub fn encode(spec: &ProtocolSpec, payload: &Payload) -> Bytes {
    let body_len = payload.body_len();
    debug_assert!(body_len <= u32::MAX as usize);

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
    buf.put_u8(spec.version);
    buf.put_u8(payload.payload_type().tag());
    buf.put_u32(body_len as u32);
    payload.write_body(&mut buf);
    buf.freeze()
}

/// Encode and write one frame. Write errors are returned unchanged.
pub async fn write_payload<W>(
    spec: &ProtocolSpec,
    writer: &mut W,
    payload: &Payload,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(spec, payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read exactly one frame from `reader`.
///
/// Fields are read one at a time so that a bad version byte is rejected
/// before anything else is consumed, and an oversized length is rejected
/// before the body buffer is allocated. A short body is an error; callers
/// never see a partially filled payload.
pub async fn decode<R>(spec: &ProtocolSpec, reader: &mut R) -> Result<Payload, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let version = reader
        .read_u8()
        .await
        .map_err(|e| ProtocolError::transport(Field::Version, e))?;
    spec.check_version(version)?;

    let tag = reader
        .read_u8()
        .await
        .map_err(|e| ProtocolError::transport(Field::Type, e))?;
    let kind = PayloadType::try_from(tag)?;

    let length = reader
        .read_u32()
        .await
        .map_err(|e| ProtocolError::transport(Field::Length, e))?;
    spec.check_length(kind, length)?;

    let mut body = BytesMut::zeroed(length as usize);
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ProtocolError::transport(Field::Body, e))?;

    Payload::from_body(kind, body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InitializationPacket, MAX_PAYLOAD_SIZE};
    use std::io::{self, Cursor};
    use tokio_test::io::Builder;

    async fn round_trip(payload: Payload) -> Payload {
        let frame = encode(&ProtocolSpec::V1, &payload);
        let mut reader = Cursor::new(frame.to_vec());
        decode(&ProtocolSpec::V1, &mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_string() {
        let msg = Payload::string("this is a test");
        assert_eq!(round_trip(msg.clone()).await, msg);
    }

    #[tokio::test]
    async fn test_round_trip_binary() {
        let msg = Payload::binary(vec![1u8, 2, 3, 4, 5]);
        assert_eq!(round_trip(msg.clone()).await, msg);
    }

    #[tokio::test]
    async fn test_round_trip_empty_and_init() {
        let empty = Payload::binary(Bytes::new());
        assert_eq!(round_trip(empty.clone()).await, empty);

        let init = Payload::init(300, 10);
        assert_eq!(round_trip(init.clone()).await, init);
    }

    #[test]
    fn test_encode_layout() {
        let frame = encode(&ProtocolSpec::V1, &Payload::string("hello"));
        assert_eq!(&frame[..], b"\x01\x02\x00\x00\x00\x05hello");

        let frame = encode(&ProtocolSpec::V1, &Payload::init(100, 3));
        assert_eq!(&frame[..], &[1, 3, 0, 0, 0, 4, 0, 100, 0, 3]);
    }

    #[test]
    fn test_encode_uses_spec_version() {
        let spec = ProtocolSpec::new(7, MAX_PAYLOAD_SIZE);
        let frame = encode(&spec, &Payload::binary(&b"x"[..]));
        assert_eq!(frame[0], 7);
    }

    #[tokio::test]
    async fn test_sequential_frames_on_one_stream() {
        let payloads = vec![
            Payload::binary(&b"Clear is better than clever"[..]),
            Payload::binary(&b"Don't panic"[..]),
            Payload::string("Errors are values."),
        ];

        let mut wire = Vec::new();
        for p in &payloads {
            wire.extend_from_slice(&encode(&ProtocolSpec::V1, p));
        }

        let mut reader = Cursor::new(wire);
        for expected in &payloads {
            let actual = decode(&ProtocolSpec::V1, &mut reader).await.unwrap();
            assert_eq!(&actual, expected);
        }
    }

    #[tokio::test]
    async fn test_version_mismatch_consumes_one_byte() {
        let mut reader = Cursor::new(vec![2u8, 2, 0, 0, 0, 1, b'x']);
        match decode(&ProtocolSpec::V1, &mut reader).await {
            Err(ProtocolError::VersionMismatch {
                expected: 1,
                found: 2,
            }) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(reader.position(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_type() {
        let mut reader = Cursor::new(vec![1u8, 9, 0, 0, 0, 0]);
        match decode(&ProtocolSpec::V1, &mut reader).await {
            Err(ProtocolError::UnexpectedType(9)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_payload_too_large_never_reads_body() {
        // The mock panics if the decoder asks for more than the header.
        let length = (MAX_PAYLOAD_SIZE + 1).to_be_bytes();
        let mut reader = Builder::new()
            .read(&[1, 1])
            .read(&length)
            .build();

        match decode(&ProtocolSpec::V1, &mut reader).await {
            Err(ProtocolError::PayloadTooLarge { length, max }) => {
                assert_eq!(length, MAX_PAYLOAD_SIZE + 1);
                assert_eq!(max, MAX_PAYLOAD_SIZE);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_length_at_cap_is_accepted() {
        let spec = ProtocolSpec::new(1, 8);
        let mut reader = Cursor::new(b"\x01\x01\x00\x00\x00\x0812345678".to_vec());
        let payload = decode(&spec, &mut reader).await.unwrap();
        assert_eq!(payload.as_bytes(), Some(&b"12345678"[..]));
    }

    #[tokio::test]
    async fn test_short_body_is_an_error() {
        let mut reader = Cursor::new(b"\x01\x02\x00\x00\x00\x0ahello".to_vec());
        match decode(&ProtocolSpec::V1, &mut reader).await {
            Err(ProtocolError::Transport {
                field: Field::Body,
                source,
            }) => assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_body_split_across_reads() {
        let mut reader = Builder::new()
            .read(&[1, 2, 0, 0])
            .read(&[0, 5, b'h', b'e'])
            .read(b"llo")
            .build();
        let payload = decode(&ProtocolSpec::V1, &mut reader).await.unwrap();
        assert_eq!(payload, Payload::string("hello"));
    }

    #[tokio::test]
    async fn test_read_error_names_field() {
        let mut reader = Builder::new()
            .read(&[1, 2])
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        match decode(&ProtocolSpec::V1, &mut reader).await {
            Err(ProtocolError::Transport {
                field: Field::Length,
                source,
            }) => assert_eq!(source.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_init_packet_with_wrong_length_rejected_before_body() {
        let mut reader = Builder::new().read(&[1, 3, 0, 0, 0, 16]).build();
        match decode(&ProtocolSpec::V1, &mut reader).await {
            Err(ProtocolError::MalformedBody { length: 16, .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(InitializationPacket::BODY_LEN, 4);
    }

    #[tokio::test]
    async fn test_empty_stream_is_disconnect() {
        let mut reader = Cursor::new(Vec::<u8>::new());
        let err = decode(&ProtocolSpec::V1, &mut reader).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_write_payload() {
        let mut writer = Builder::new().write(b"\x01\x01\x00\x00\x00\x02ok").build();
        write_payload(&ProtocolSpec::V1, &mut writer, &Payload::binary(&b"ok"[..]))
            .await
            .unwrap();
    }
}
