//! Stdin-to-device framing loop used by the `frame-sink` binary

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;
use tokio_util::io::ReaderStream;

use crate::protocol::FrameEncoder;

/// Counters reported when the input ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSinkStats {
    /// Frames written successfully
    pub frames: u64,
    /// Payload bytes written successfully
    pub bytes: u64,
    /// Frames dropped because the device write failed
    pub write_errors: u64,
}

/// Frame every chunk read from `input` and write it to `output`
///
/// Each read of up to `buffer_size` bytes becomes one frame. A failed device
/// write drops that frame and the loop carries on; the receiver resyncs on the
/// next marker. Returns when `input` reaches EOF or fails.
pub async fn run_frame_sink<R, W>(
    input: R,
    mut output: W,
    buffer_size: usize,
) -> std::io::Result<FrameSinkStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunks = ReaderStream::with_capacity(input, buffer_size.max(1));
    let mut encoder = FrameEncoder::new();
    let mut frame = BytesMut::new();
    let mut stats = FrameSinkStats::default();

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        let len = chunk.len() as u64;

        frame.clear();
        encoder.encode(chunk, &mut frame)?;

        match output.write_all(&frame).await {
            Ok(()) => {
                stats.frames += 1;
                stats.bytes += len;
            }
            Err(e) => {
                stats.write_errors += 1;
                tracing::warn!(error = %e, bytes = len, "Device write failed");
            }
        }
    }

    if let Err(e) = output.flush().await {
        tracing::warn!(error = %e, "Device flush failed");
    }

    tracing::info!(
        frames = stats.frames,
        bytes = stats.bytes,
        write_errors = stats.write_errors,
        "Input closed"
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio_test::io::Builder;

    use super::*;
    use crate::protocol::{encode_frame, FrameReassembler};

    #[tokio::test]
    async fn test_each_read_becomes_one_frame() {
        let input = Builder::new().read(b"hello").read(b"world!").build();
        let mut output = Vec::new();

        let stats = run_frame_sink(input, &mut output, 4096).await.unwrap();

        assert_eq!(stats.frames, 2);
        assert_eq!(stats.bytes, 11);

        let mut expected = encode_frame(b"hello").unwrap().to_vec();
        expected.extend_from_slice(&encode_frame(b"world!").unwrap());
        assert_eq!(output, expected);
    }

    #[tokio::test]
    async fn test_buffer_size_splits_reads() {
        let input = Builder::new().read(&[7u8; 10]).build();
        let mut output = Vec::new();

        let stats = run_frame_sink(input, &mut output, 4).await.unwrap();

        assert!(stats.frames >= 2);
        assert_eq!(stats.bytes, 10);

        let mut reassembler = FrameReassembler::new();
        let payload: Vec<u8> = reassembler.push(&output).flat_map(|f| f.to_vec()).collect();
        assert_eq!(payload, vec![7u8; 10]);
    }

    /// Writer that fails its first write
    struct FlakyWriter {
        failed: bool,
        written: Vec<u8>,
    }

    impl AsyncWrite for FlakyWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if !self.failed {
                self.failed = true;
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "device unplugged")));
            }
            self.written.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_error_is_not_fatal() {
        let input = Builder::new().read(b"lost").read(b"kept").build();
        let mut output = FlakyWriter {
            failed: false,
            written: Vec::new(),
        };

        let stats = run_frame_sink(input, &mut output, 4096).await.unwrap();

        assert_eq!(stats.write_errors, 1);
        assert_eq!(stats.frames, 1);
        assert_eq!(output.written, encode_frame(b"kept").unwrap().to_vec());
    }

    #[tokio::test]
    async fn test_read_error_ends_loop() {
        let input = Builder::new()
            .read(b"ok")
            .read_error(io::Error::new(io::ErrorKind::Other, "stdin gone"))
            .build();
        let mut output = Vec::new();

        let result = run_frame_sink(input, &mut output, 4096).await;

        assert!(result.is_err());
        assert_eq!(output, encode_frame(b"ok").unwrap().to_vec());
    }
}
