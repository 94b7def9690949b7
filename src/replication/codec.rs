//! Wire Codec
//!
//! Length-prefixed bincode framing for replica RPC.
//!
//! Uses Sans-IO pattern: message encoding/decoding is separated from I/O for testability.

use crate::replication::types::Message;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Framing and serialization failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ==================== Sans-IO Functions ====================

/// Encode a message for transport.
/// Returns length-prefixed binary data ready for sending.
pub fn encode_message(msg: &Message) -> Result<Bytes, CodecError> {
    let data = bincode::serialize(msg)?;
    let len = u32::try_from(data.len()).map_err(|_| CodecError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u32(len);
    buf.put_slice(&data);
    Ok(buf.freeze())
}

/// Decode a length from the first 4 bytes.
pub fn decode_length(buf: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*buf)
}

/// Decode a message body (without its length prefix).
pub fn decode_message(data: &[u8]) -> Result<Message, CodecError> {
    Ok(bincode::deserialize(data)?)
}

// ==================== Async I/O ====================

/// Read one frame. Returns None on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = decode_length(&len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    decode_message(&data).map(Some)
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_message(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{Mutation, RegionInfo, WalEdit};
    use crate::domain::value_objects::ReplicaId;
    use crate::replication::types::EditBatch;

    #[test]
    fn test_encode_prefixes_length() {
        let frame = encode_message(&Message::Ping).unwrap();
        let mut len = [0u8; 4];
        len.copy_from_slice(&frame[..4]);
        assert_eq!(decode_length(&len) as usize, frame.len() - 4);
    }

    #[test]
    fn test_decode_replicate_message() {
        let replica = RegionInfo::catalog().replica(ReplicaId(1));
        let batch = EditBatch::new(
            replica.region.encoded_name(),
            vec![WalEdit::new(1, vec![Mutation::put("k", "v")])],
        );
        let frame = encode_message(&Message::Replicate {
            replica: replica.clone(),
            batch: batch.clone(),
        })
        .unwrap();

        match decode_message(&frame[4..]).unwrap() {
            Message::Replicate { replica: r, batch: b } => {
                assert_eq!(r, replica);
                assert!(b.verify());
                assert_eq!(b, batch);
            }
            other => panic!("unexpected message {}", other.type_name()),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_message(&[0xff, 0xff, 0xff]).is_err());
    }

    #[tokio::test]
    async fn test_frame_io_roundtrip_and_eof() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &Message::Applied { last_applied: 9 })
            .await
            .unwrap();
        drop(client);

        match read_frame(&mut server).await.unwrap() {
            Some(Message::Applied { last_applied }) => assert_eq!(last_applied, 9),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_LEN + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(CodecError::FrameTooLarge(_))
        ));
    }
}
