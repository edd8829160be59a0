//! Length-prefixed framing of client packets on reliable streams
//!
//! Format: [4 bytes little-endian length][payload]

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::mixer::constants::net::{MAX_DATAGRAM_SIZE, MAX_MESSAGE_SIZE};

/// Errors that can occur during message framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn closed_on_eof(e: io::Error) -> FramingError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FramingError::ConnectionClosed
    } else {
        FramingError::Io(e)
    }
}

/// Read one framed packet from a stream
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(closed_on_eof)?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(closed_on_eof)?;
    Ok(buf)
}

/// Write one framed packet and flush it
pub async fn write_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), FramingError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }

    let len_bytes = (data.len() as u32).to_le_bytes();
    stream.write_all(&len_bytes).await?;
    stream.write_all(data).await?;
    stream.flush().await?;

    Ok(())
}

/// Validate datagram size (for unreliable packets)
pub fn validate_datagram_size(data: &[u8]) -> Result<(), FramingError> {
    if data.len() > MAX_DATAGRAM_SIZE {
        Err(FramingError::MessageTooLarge(data.len(), MAX_DATAGRAM_SIZE))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_write_message() {
        let data = b"avatar pose";
        let mut buffer = Vec::new();

        write_message(&mut buffer, data).await.unwrap();
        assert_eq!(&buffer[..4], &(data.len() as u32).to_le_bytes());

        let mut cursor = Cursor::new(buffer);
        let result = read_message(&mut cursor).await.unwrap();
        assert_eq!(result, data);
    }

    #[tokio::test]
    async fn test_empty_message() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, b"").await.unwrap();

        let mut cursor = Cursor::new(buffer);
        assert!(read_message(&mut cursor).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let large_data = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let mut buffer = Vec::new();

        let result = write_message(&mut buffer, &large_data).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(_, _))));

        let mut cursor = Cursor::new(((MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes().to_vec());
        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(_, _))));
    }

    #[tokio::test]
    async fn test_read_truncated() {
        let mut cursor = Cursor::new(vec![0u8; 2]);
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(FramingError::ConnectionClosed)
        ));

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&10u32.to_le_bytes());
        buffer.extend_from_slice(&[1, 2, 3]);
        let mut cursor = Cursor::new(buffer);
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(FramingError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let len = 5u32.to_le_bytes();
        let mut stream = tokio_test::io::Builder::new()
            .read(&len[..2])
            .read(&len[2..])
            .read(b"po")
            .read(b"se!")
            .build();

        assert_eq!(read_message(&mut stream).await.unwrap(), b"pose!");
    }

    #[tokio::test]
    async fn test_write_emits_prefix_then_payload() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&4u32.to_le_bytes())
            .write(b"kill")
            .build();

        write_message(&mut stream, b"kill").await.unwrap();
    }

    #[test]
    fn test_validate_datagram_size() {
        assert!(validate_datagram_size(&[0u8; 100]).is_ok());
        assert!(validate_datagram_size(&vec![0u8; MAX_DATAGRAM_SIZE + 1]).is_err());
    }

    #[tokio::test]
    async fn test_multiple_messages() {
        let messages = vec![vec![1u8; 13], vec![2u8; 6], vec![3u8; 300]];

        let mut buffer = Vec::new();
        for msg in &messages {
            write_message(&mut buffer, msg).await.unwrap();
        }

        let mut cursor = Cursor::new(buffer);
        for expected in &messages {
            assert_eq!(&read_message(&mut cursor).await.unwrap(), expected);
        }
    }
}
