//! Terminator-framed byte stream to the loom.
//!
//! Any duplex byte stream can carry the loom link: a non-blocking serial
//! port, or one end of an in-memory pipe for the mock loom. The stream is
//! split into a [`LoomReader`], owned by the loom read loop, and a
//! [`LoomWriter`], owned by the session so all loom writes go through one
//! path.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
#[cfg(unix)]
use {
    futures::ready,
    std::io::{self, Read, Write},
    std::os::unix::fs::OpenOptionsExt,
    std::pin::Pin,
    std::task::{Context, Poll},
    tokio::io::{unix::AsyncFd, ReadBuf},
};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead, FramedWrite};

use crate::error::LoomError;

/// Longest frame accepted from the loom.
pub const MAX_FRAME_LENGTH: usize = 1024;

/// A duplex byte stream usable as a loom link.
pub trait LoomIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> LoomIo for T {}

type BoxedIo = Box<dyn LoomIo>;

fn codec(terminator: u8) -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(vec![terminator], vec![terminator], MAX_FRAME_LENGTH)
}

/// Split a byte stream into framed read and write halves.
pub fn split_loom_io<T: LoomIo>(io: T, terminator: u8) -> (LoomReader, LoomWriter) {
    let boxed: BoxedIo = Box::new(io);
    let (read_half, write_half) = tokio::io::split(boxed);
    (
        LoomReader {
            frames: FramedRead::new(read_half, codec(terminator)),
        },
        LoomWriter {
            frames: FramedWrite::new(write_half, codec(terminator)),
            closed: false,
        },
    )
}

/// Open a serial device for reading and writing.
///
/// Line settings (baud rate etc.) must already be configured on the device.
#[cfg(unix)]
pub fn open_serial_port(path: &Path) -> Result<SerialPort, LoomError> {
    SerialPort::open(path)
}

#[cfg(not(unix))]
pub fn open_serial_port(path: &Path) -> Result<tokio::fs::File, LoomError> {
    Err(LoomError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("serial ports are not supported on this platform: {}", path.display()),
    )))
}

/// A serial device in non-blocking mode, driven by the tokio reactor.
///
/// Reads and writes proceed independently, so a write is never held up by
/// the read the loom loop always has pending.
#[cfg(unix)]
pub struct SerialPort {
    fd: AsyncFd<std::fs::File>,
}

#[cfg(unix)]
impl SerialPort {
    pub fn open(path: &Path) -> Result<Self, LoomError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(path)?;
        Ok(Self {
            fd: AsyncFd::new(file)?,
        })
    }
}

#[cfg(unix)]
impl AsyncRead for SerialPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|fd| {
                let mut file: &std::fs::File = fd.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(unix)]
impl AsyncWrite for SerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|fd| {
                let mut file: &std::fs::File = fd.get_ref();
                file.write(buf)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    // A serial line has no half-close; the fd closes on drop.
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Read half of a loom link.
pub struct LoomReader {
    frames: FramedRead<ReadHalf<BoxedIo>, AnyDelimiterCodec>,
}

impl LoomReader {
    /// Read the next frame, without its terminator.
    ///
    /// Returns `Ok(None)` at end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, LoomError> {
        match self.frames.next().await {
            Some(Ok(frame)) => {
                let frame = match frame.last() {
                    Some(b'\r') => frame.slice(..frame.len() - 1),
                    _ => frame,
                };
                Ok(Some(frame))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// Write half of a loom link.
pub struct LoomWriter {
    frames: FramedWrite<WriteHalf<BoxedIo>, AnyDelimiterCodec>,
    closed: bool,
}

impl LoomWriter {
    /// Write one frame; the terminator is appended.
    pub async fn write_frame(&mut self, frame: &str) -> Result<(), LoomError> {
        if self.closed {
            return Err(LoomError::NotConnected);
        }
        log::debug!("Sending to loom: {:?}", frame);
        self.frames.send(frame).await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flush and shut down the write half.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.frames.get_mut().shutdown().await {
            log::warn!("Failed to close loom connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_frames_round_trip() {
        let (near, mut far) = tokio::io::duplex(256);
        let (mut reader, mut writer) = split_loom_io(near, b'\n');

        writer.write_frame("C0000000f").await.unwrap();
        let mut buf = [0u8; 10];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"C0000000f\n");

        far.write_all(b"m1\nc0000000f\r\np\n").await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), Bytes::from("m1"));
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), Bytes::from("c0000000f"));
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), Bytes::from("p"));

        drop(far);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_writer_rejects_frames() {
        let (near, _far) = tokio::io::duplex(64);
        let (_reader, mut writer) = split_loom_io(near, b'\n');
        writer.close().await;
        assert!(writer.is_closed());
        assert!(matches!(
            writer.write_frame("U0").await,
            Err(LoomError::NotConnected)
        ));
    }

    /// Make a named pipe; opened read-write it loops frames back like a
    /// loom that echoes.
    #[cfg(unix)]
    fn make_fifo(dir: &tempfile::TempDir) -> std::path::PathBuf {
        use std::os::unix::ffi::OsStrExt;
        let path = dir.path().join("loom");
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
        let result = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        assert_eq!(result, 0, "mkfifo failed: {}", io::Error::last_os_error());
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_serial_port_writes_while_reading() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = make_fifo(&dir);
        let port = open_serial_port(&path).unwrap();
        let (mut reader, mut writer) = split_loom_io(port, b'\n');

        let pending_read = tokio::spawn(async move { reader.read_frame().await });
        tokio::task::yield_now().await;

        let timeout = std::time::Duration::from_secs(2);
        tokio::time::timeout(timeout, writer.write_frame("U0"))
            .await
            .expect("write blocked behind a pending read")
            .unwrap();
        let frame = tokio::time::timeout(timeout, pending_read)
            .await
            .expect("read never completed")
            .unwrap()
            .unwrap();
        assert_eq!(frame, Some(Bytes::from("U0")));
    }

    #[tokio::test]
    async fn test_missing_serial_port() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            open_serial_port(&dir.path().join("ttyNOPE")),
            Err(LoomError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_an_error() {
        let (near, mut far) = tokio::io::duplex(4096);
        let (mut reader, _writer) = split_loom_io(near, b'\n');
        far.write_all(&[b'x'; MAX_FRAME_LENGTH + 10]).await.unwrap();
        assert!(matches!(
            reader.read_frame().await,
            Err(LoomError::Protocol(_))
        ));
    }
}
