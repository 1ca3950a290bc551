//! The transfer wire protocol: one payload per stream, framed as
//! `uvarint(len) || len bytes`. The writer half-closes after the payload and
//! the reader closes on EOF. A zero or oversized length claim is a protocol
//! violation answered with a stream reset.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::prelude::*;
use libp2p::core::upgrade::{InboundUpgrade, OutboundUpgrade, UpgradeInfo};
use libp2p::StreamProtocol;

/// Default negotiated protocol name.
pub const DEFAULT_PROTOCOL: &str = "/stowage/xfer/1.0.0";
/// Default upper bound on a single payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
/// Default per-stream read/write deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct TransferProtocol {
    pub protocol: StreamProtocol,
    pub max_payload: usize,
    pub timeout: Duration,
}

impl Default for TransferProtocol {
    fn default() -> Self {
        TransferProtocol {
            protocol: StreamProtocol::new(DEFAULT_PROTOCOL),
            max_payload: DEFAULT_MAX_PAYLOAD,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl UpgradeInfo for TransferProtocol {
    type Info = StreamProtocol;
    type InfoIter = std::iter::Once<Self::Info>;

    fn protocol_info(&self) -> Self::InfoIter {
        std::iter::once(self.protocol.clone())
    }
}

/// A payload read off an inbound stream, fingerprinting still pending.
#[derive(Debug)]
pub struct InboundPayload {
    pub payload: Bytes,
}

async fn read_frame<T>(io: &mut T, max_payload: usize) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin,
{
    let len = unsigned_varint::aio::read_usize(&mut *io)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "zero-length payload",
        ));
    }
    if len > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("claimed payload of {len} bytes exceeds limit of {max_payload}"),
        ));
    }

    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn write_frame<T>(io: &mut T, payload: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    let mut buf = unsigned_varint::encode::usize_buffer();
    io.write_all(unsigned_varint::encode::usize(payload.len(), &mut buf))
        .await?;
    io.write_all(payload).await?;
    io.flush().await
}

impl<TSocket> InboundUpgrade<TSocket> for TransferProtocol
where
    TSocket: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Output = InboundPayload;
    type Error = io::Error;
    type Future = BoxFuture<'static, Result<Self::Output, Self::Error>>;

    fn upgrade_inbound(self, mut socket: TSocket, _: Self::Info) -> Self::Future {
        async move {
            let read = read_frame(&mut socket, self.max_payload);
            let payload = tokio::time::timeout(self.timeout, read)
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "read deadline expired")
                })??;
            socket.close().await?;
            Ok(InboundPayload {
                payload: payload.into(),
            })
        }
        .boxed()
    }
}

/// One queued outbound payload; writing it is the whole life of the stream.
#[derive(Clone, Debug)]
pub struct OutboundPayload {
    pub protocol: StreamProtocol,
    pub payload: Bytes,
    pub timeout: Duration,
}

impl UpgradeInfo for OutboundPayload {
    type Info = StreamProtocol;
    type InfoIter = std::iter::Once<Self::Info>;

    fn protocol_info(&self) -> Self::InfoIter {
        std::iter::once(self.protocol.clone())
    }
}

impl<TSocket> OutboundUpgrade<TSocket> for OutboundPayload
where
    TSocket: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Output = ();
    type Error = io::Error;
    type Future = BoxFuture<'static, Result<Self::Output, Self::Error>>;

    fn upgrade_outbound(self, mut socket: TSocket, _: Self::Info) -> Self::Future {
        async move {
            let write = async {
                write_frame(&mut socket, &self.payload).await?;
                // half-close; the remote reads until EOF
                socket.close().await
            };
            tokio::time::timeout(self.timeout, write)
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "write deadline expired")
                })?
        }
        .boxed()
    }
}

/// Event surfaced by the one-shot stream handler.
#[derive(Debug)]
pub enum HandlerEvent {
    Received(InboundPayload),
    Sent,
}

impl From<InboundPayload> for HandlerEvent {
    fn from(payload: InboundPayload) -> Self {
        HandlerEvent::Received(payload)
    }
}

impl From<()> for HandlerEvent {
    fn from(_: ()) -> Self {
        HandlerEvent::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut futures::io::Cursor::new(&mut buf), b"hi data")
            .await
            .unwrap();
        assert_eq!(buf[0], 7);

        let mut cursor = futures::io::Cursor::new(buf);
        let payload = read_frame(&mut cursor, DEFAULT_MAX_PAYLOAD).await.unwrap();
        assert_eq!(payload, b"hi data");
    }

    #[tokio::test]
    async fn zero_length_claim_is_rejected() {
        let mut cursor = futures::io::Cursor::new(vec![0u8]);
        let err = read_frame(&mut cursor, DEFAULT_MAX_PAYLOAD)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn oversized_claim_is_rejected_before_reading() {
        let mut frame = Vec::new();
        write_frame(&mut futures::io::Cursor::new(&mut frame), &[0u8; 32])
            .await
            .unwrap();
        let mut cursor = futures::io::Cursor::new(frame);
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn short_read_is_an_error() {
        // claims eight bytes, carries three
        let mut cursor = futures::io::Cursor::new(vec![8u8, b'a', b'b', b'c']);
        let err = read_frame(&mut cursor, DEFAULT_MAX_PAYLOAD)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
