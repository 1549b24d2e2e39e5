//! Streaming packet codec
//!
//! [`Encoder`] and [`Decoder`] work on any tokio byte stream: the raw
//! `TcpStream` during the plaintext identity exchange and the TLS stream after
//! the upgrade. Each `encode` writes exactly one frame; each `decode` returns
//! exactly one packet or an error.

use super::{decode_frame, encode_frame, timestamp_id, IdGenerator, Packet};
use crate::{ProtocolError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Maximum size of a single frame (1MB)
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Writes newline-terminated packets to a stream
pub struct Encoder<W> {
    writer: W,
    next_id: IdGenerator,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    /// Create an encoder using microsecond timestamp ids
    pub fn new(writer: W) -> Self {
        Self::with_id_generator(writer, timestamp_id)
    }

    /// Create an encoder with a custom id source for packets without an id
    pub fn with_id_generator(writer: W, next_id: IdGenerator) -> Self {
        Self { writer, next_id }
    }

    /// Encode and flush one packet
    pub async fn encode(&mut self, packet: &Packet) -> Result<()> {
        let frame = encode_frame(packet, self.next_id)?;

        trace!(
            "Writing packet '{}' ({} bytes)",
            packet.packet_type,
            frame.len()
        );

        self.writer
            .write_all(&frame)
            .await
            .map_err(|e| ProtocolError::transport("failed to write packet", e))?;
        self.writer
            .flush()
            .await
            .map_err(|e| ProtocolError::transport("failed to flush packet", e))?;
        Ok(())
    }

    /// Access the underlying writer
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Unwrap the encoder
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Reads newline-terminated packets from a persistent stream
pub struct Decoder<R> {
    reader: R,
    buf: Vec<u8>,
    max_size: usize,
}

impl<R: AsyncBufRead + Unpin> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_size: MAX_PACKET_SIZE,
        }
    }

    /// Override the maximum frame size
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Decode the next packet
    ///
    /// Blank lines between frames are skipped. End of stream before the first
    /// byte of a frame is reported as [`ProtocolError::Closed`]; end of stream
    /// inside a frame surfaces as a decode error for that frame.
    pub async fn decode(&mut self) -> Result<Packet> {
        loop {
            self.buf.clear();
            let terminated = self.read_frame().await?;

            if self.buf.iter().all(u8::is_ascii_whitespace) {
                if terminated {
                    continue;
                }
                return Err(ProtocolError::Closed);
            }

            trace!("Read frame ({} bytes)", self.buf.len());
            return decode_frame(&self.buf);
        }
    }

    /// Read up to and including the next newline into `buf`
    ///
    /// Returns `false` when the stream ended before a newline was seen.
    async fn read_frame(&mut self) -> Result<bool> {
        loop {
            let available = self
                .reader
                .fill_buf()
                .await
                .map_err(|e| ProtocolError::transport("failed to read packet", e))?;

            if available.is_empty() {
                return Ok(false);
            }

            let (terminated, used) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (true, pos + 1),
                None => (false, available.len()),
            };

            let size = self.buf.len() + used;
            if size > self.max_size {
                self.buf.clear();
                self.reader.consume(used);
                if !terminated {
                    self.skip_line().await?;
                }
                return Err(ProtocolError::PacketSizeExceeded(size, self.max_size));
            }

            self.buf.extend_from_slice(&available[..used]);
            self.reader.consume(used);

            if terminated {
                return Ok(true);
            }
        }
    }

    /// Discard input up to and including the next newline
    async fn skip_line(&mut self) -> Result<()> {
        loop {
            let available = self
                .reader
                .fill_buf()
                .await
                .map_err(|e| ProtocolError::transport("failed to read packet", e))?;

            if available.is_empty() {
                return Ok(());
            }

            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.reader.consume(pos + 1);
                    return Ok(());
                }
                None => {
                    let len = available.len();
                    self.reader.consume(len);
                }
            }
        }
    }

    /// Access the underlying reader
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    fn fixed_id() -> u64 {
        889911
    }

    #[tokio::test]
    async fn test_decoder_sequence() {
        let input = "\n{\"id\": 123, \"type\": \"foo\",\"body\":{}}\n\
                     {\"id\": 456, \"type\": \"bar\",\"body\":{\"123\": 123}}\n\
                     {\"id\": 678, \"type\": \"baz\"\n";
        let mut decoder = Decoder::new(BufReader::new(input.as_bytes()));

        let first = decoder.decode().await.unwrap();
        assert_eq!(first, Packet::with_id(123, "foo", json!({})));

        let second = decoder.decode().await.unwrap();
        assert_eq!(second, Packet::with_id(456, "bar", json!({"123": 123})));

        let third = decoder.decode().await;
        assert!(matches!(third, Err(ProtocolError::Decode(_))));
    }

    #[tokio::test]
    async fn test_decoder_incomplete_envelope() {
        let input = "{\"id\": 1, \"type\": \"foo\",\"body\":{}}\n{}\n";
        let mut decoder = Decoder::new(BufReader::new(input.as_bytes()));

        assert!(decoder.decode().await.is_ok());
        assert!(matches!(
            decoder.decode().await,
            Err(ProtocolError::IncompletePacket)
        ));
    }

    #[tokio::test]
    async fn test_decoder_eof_is_closed() {
        let mut decoder = Decoder::new(BufReader::new(&b""[..]));
        assert!(matches!(decoder.decode().await, Err(ProtocolError::Closed)));

        let input = "{\"id\": 1, \"type\": \"foo\",\"body\":{}}\n\n";
        let mut decoder = Decoder::new(BufReader::new(input.as_bytes()));
        assert!(decoder.decode().await.is_ok());
        assert!(matches!(decoder.decode().await, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_decoder_split_reads() {
        // Frame arrives in pieces, second frame in the same chunk as the tail
        let stream = tokio_test::io::Builder::new()
            .read(b"{\"id\":1,\"ty")
            .read(b"pe\":\"foo\",\"body\":{}}\n{\"id\":2,")
            .read(b"\"type\":\"bar\",\"body\":[]}\n")
            .build();
        let mut decoder = Decoder::new(BufReader::new(stream));

        assert_eq!(decoder.decode().await.unwrap().id, 1);
        let second = decoder.decode().await.unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.body, json!([]));
    }

    #[tokio::test]
    async fn test_decoder_size_limit() {
        let input = format!(
            "{{\"id\":1,\"type\":\"foo\",\"body\":\"{}\"}}\n",
            "x".repeat(128)
        );
        let mut decoder = Decoder::new(BufReader::new(input.as_bytes())).with_max_size(64);
        assert!(matches!(
            decoder.decode().await,
            Err(ProtocolError::PacketSizeExceeded(_, 64))
        ));
    }

    #[tokio::test]
    async fn test_decoder_resyncs_after_oversized_frame() {
        // Oversized line delivered in pieces, followed by a valid frame
        let stream = tokio_test::io::Builder::new()
            .read(b"{\"id\":1,\"type\":\"foo\",\"body\":\"")
            .read("x".repeat(100).as_bytes())
            .read(b"\"}\n{\"id\":2,\"type\":\"bar\",\"body\":{}}\n")
            .build();
        let mut decoder = Decoder::new(BufReader::new(stream)).with_max_size(64);

        assert!(matches!(
            decoder.decode().await,
            Err(ProtocolError::PacketSizeExceeded(_, 64))
        ));
        let next = decoder.decode().await.unwrap();
        assert_eq!(next.id, 2);
        assert!(next.is_type("bar"));
        assert!(matches!(decoder.decode().await, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_decoder_transport_error() {
        let stream = tokio_test::io::Builder::new()
            .read_error(std::io::Error::other("link down"))
            .build();
        let mut decoder = Decoder::new(BufReader::new(stream));
        let err = decoder.decode().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Transport { .. }));
        assert!(err.to_string().starts_with("failed to read packet"));
    }

    #[tokio::test]
    async fn test_encoder_writes_frames() {
        let mut out = Vec::new();
        {
            let mut encoder = Encoder::with_id_generator(&mut out, fixed_id);
            encoder
                .encode(&Packet::new("foo", json!({})))
                .await
                .unwrap();
            encoder
                .encode(&Packet::with_id(7, "bar", json!({"pair": true})))
                .await
                .unwrap();
        }
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"id\":889911,\"type\":\"foo\",\"body\":{}}\n\
             {\"id\":7,\"type\":\"bar\",\"body\":{\"pair\":true}}\n"
        );
    }

    #[tokio::test]
    async fn test_encoder_rejects_empty_type() {
        let mut out = Vec::new();
        let mut encoder = Encoder::new(&mut out);
        let result = encoder.encode(&Packet::new("", json!({}))).await;
        assert!(result.is_err());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_encode_decode_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let mut encoder = Encoder::new(client);
        let mut decoder = Decoder::new(BufReader::new(server));

        let packet = Packet::new("kdeconnect.ping", json!({"message": "hello"}));
        encoder.encode(&packet).await.unwrap();

        let received = decoder.decode().await.unwrap();
        assert_eq!(received.packet_type, "kdeconnect.ping");
        assert_eq!(received.body, json!({"message": "hello"}));
        assert_ne!(received.id, 0);
    }
}
