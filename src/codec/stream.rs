//! Incremental MsgPack decoding from an async byte stream.

use std::io::{self, Cursor};

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, RpcError};

/// Initial capacity of the fill buffer. Agent frames are small; the
/// buffer grows on demand for large bodies (member lists, stats dumps).
const READ_BUF_CAPACITY: usize = 4096;

/// Decoder for a stream of self-delimited MsgPack values.
///
/// Owns the inbound half of the connection plus a fill buffer. Each call
/// to [`decode`](StreamDecoder::decode) consumes exactly one encoded
/// value, reading more bytes from the socket only when the buffered data
/// is an incomplete prefix.
///
/// Exactly one `StreamDecoder` exists per connection and the reader loop
/// owns it; handlers borrow it to consume a body before the loop resumes
/// decoding the next header.
pub struct StreamDecoder<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> StreamDecoder<R> {
    /// Wrap the read half of a connection.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
        }
    }

    /// Decode the next value from the stream.
    ///
    /// # Errors
    ///
    /// [`RpcError::ConnectionClosed`] if the peer closed the stream on a
    /// value boundary, [`RpcError::Io`] if it closed mid-value, or
    /// [`RpcError::Decode`] if the bytes are not valid MsgPack for `T`.
    pub async fn decode<T: DeserializeOwned>(&mut self) -> Result<T> {
        loop {
            if !self.buf.is_empty() {
                let mut cursor = Cursor::new(&self.buf[..]);
                let attempt = {
                    let mut de = rmp_serde::Deserializer::new(&mut cursor);
                    T::deserialize(&mut de)
                };
                match attempt {
                    Ok(value) => {
                        let consumed = cursor.position() as usize;
                        self.buf.advance(consumed);
                        return Ok(value);
                    }
                    Err(err) if is_incomplete(&err) => {}
                    Err(err) => return Err(RpcError::Decode(err)),
                }
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Err(RpcError::ConnectionClosed);
                }
                return Err(RpcError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-value",
                )));
            }
        }
    }
}

/// True when the decode failed only because the buffered bytes are a
/// prefix of a value, i.e. more input will fix it.
fn is_incomplete(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;

    match err {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => {
            io.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_named;
    use serde::{Deserialize, Serialize};
    use tokio::io::AsyncWriteExt;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Frame {
        seq: u64,
        text: String,
    }

    #[tokio::test]
    async fn test_decode_single_value() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut dec = StreamDecoder::new(rx);

        let frame = Frame {
            seq: 7,
            text: "hello".to_string(),
        };
        tx.write_all(&encode_named(&frame).unwrap()).await.unwrap();

        let decoded: Frame = dec.decode().await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_decode_back_to_back_values() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut dec = StreamDecoder::new(rx);

        let mut bytes = Vec::new();
        for seq in 1..=3u64 {
            bytes.extend(
                encode_named(&Frame {
                    seq,
                    text: format!("line-{seq}"),
                })
                .unwrap(),
            );
        }
        tx.write_all(&bytes).await.unwrap();

        for seq in 1..=3u64 {
            let decoded: Frame = dec.decode().await.unwrap();
            assert_eq!(decoded.seq, seq);
            assert_eq!(decoded.text, format!("line-{seq}"));
        }
    }

    #[tokio::test]
    async fn test_decode_value_split_across_writes() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut dec = StreamDecoder::new(rx);

        let bytes = encode_named(&Frame {
            seq: 42,
            text: "split across the wire".to_string(),
        })
        .unwrap();
        let mid = bytes.len() / 2;

        let writer = tokio::spawn(async move {
            tx.write_all(&bytes[..mid]).await.unwrap();
            tx.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tx.write_all(&bytes[mid..]).await.unwrap();
        });

        let decoded: Frame = dec.decode().await.unwrap();
        assert_eq!(decoded.seq, 42);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_on_value_boundary_is_connection_closed() {
        let (tx, rx) = tokio::io::duplex(256);
        let mut dec = StreamDecoder::new(rx);

        drop(tx);

        let result = dec.decode::<Frame>().await;
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_eof_mid_value_is_io_error() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut dec = StreamDecoder::new(rx);

        let bytes = encode_named(&Frame {
            seq: 1,
            text: "truncated".to_string(),
        })
        .unwrap();
        tx.write_all(&bytes[..bytes.len() - 3]).await.unwrap();
        drop(tx);

        let result = dec.decode::<Frame>().await;
        match result {
            Err(RpcError::Io(err)) => {
                assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof)
            }
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_fields_are_ignored() {
        // A value with extra keys still decodes into a smaller struct;
        // this is what keeps the stream aligned when a record body is
        // read as a header after its handler was deregistered.
        #[derive(Serialize)]
        struct Wide {
            seq: u64,
            text: String,
            extra: bool,
        }

        let (mut tx, rx) = tokio::io::duplex(256);
        let mut dec = StreamDecoder::new(rx);

        tx.write_all(
            &encode_named(&Wide {
                seq: 9,
                text: "x".to_string(),
                extra: true,
            })
            .unwrap(),
        )
        .await
        .unwrap();

        let decoded: Frame = dec.decode().await.unwrap();
        assert_eq!(decoded.seq, 9);
    }
}
