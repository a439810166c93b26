//! The duplex control channel between manager and requester.
//!
//! One Unix stream socket carries framed field tuples ([`MessageCodec`]) in
//! both directions. Successful spawn replies additionally carry one file
//! descriptor, transmitted as SCM_RIGHTS ancillary data attached to a
//! single payload byte, so the descriptor arrives in-band right after the
//! reply tuple it belongs to.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::codec::MessageCodec;

/// Channel failures. Any of these is fatal to the serve loop: a broken
/// control channel cannot be recovered locally.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed by peer")]
    Closed,

    #[error("channel i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One side of the control channel.
///
/// The manager owns exactly one of these for its whole lifetime; the
/// requester side uses the same type (tests drive the protocol through it).
pub struct ChannelTransport {
    stream: UnixStream,
    codec: MessageCodec,
    read_buf: BytesMut,
}

impl ChannelTransport {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            codec: MessageCodec::new(),
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Wrap a pre-opened stream descriptor inherited from the parent process.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(std_stream)?))
    }

    /// Read the next field tuple. Returns `None` on orderly EOF; an EOF in
    /// the middle of a frame is reported as [`ChannelError::Closed`].
    pub async fn read_message(&mut self) -> Result<Option<Vec<String>>, ChannelError> {
        loop {
            if let Some(fields) = self.codec.decode(&mut self.read_buf)? {
                tracing::trace!(fields = fields.len(), "Message received");
                return Ok(Some(fields));
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ChannelError::Closed);
            }
        }
    }

    /// Write one field tuple (a bare status token is a one-field tuple).
    pub async fn write_message(&mut self, fields: &[&str]) -> Result<(), ChannelError> {
        let mut buf = BytesMut::new();
        self.codec.encode(fields, &mut buf)?;
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    /// Transmit a descriptor as SCM_RIGHTS ancillary data. The kernel dups
    /// the descriptor at send time; the caller keeps its own copy.
    pub async fn send_descriptor(&mut self, fd: BorrowedFd<'_>) -> Result<(), ChannelError> {
        let stream_fd = self.stream.as_raw_fd();
        let payload_fd = fd.as_raw_fd();

        self.stream
            .async_io(Interest::WRITABLE, || {
                let payload = [0u8; 1];
                let iov = [io::IoSlice::new(&payload)];
                let fds = [payload_fd];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(stream_fd, &iov, &cmsgs, MsgFlags::empty(), None)
                    .map_err(io::Error::from)?;
                Ok(())
            })
            .await?;

        tracing::trace!(fd = payload_fd, "Descriptor transmitted");
        Ok(())
    }

    /// Receive one descriptor sent by [`send_descriptor`] on the peer side.
    ///
    /// [`send_descriptor`]: Self::send_descriptor
    pub async fn recv_descriptor(&mut self) -> Result<OwnedFd, ChannelError> {
        let stream_fd = self.stream.as_raw_fd();

        let fd = self
            .stream
            .async_io(Interest::READABLE, || {
                let mut payload = [0u8; 1];
                let mut iov = [io::IoSliceMut::new(&mut payload)];
                let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

                let msg = recvmsg::<()>(
                    stream_fd,
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::empty(),
                )
                .map_err(io::Error::from)?;

                if msg.bytes == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during descriptor receive",
                    ));
                }

                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg
                        && let Some(&fd) = fds.first()
                    {
                        // Safety: the kernel installed this descriptor for us
                        // during recvmsg; nothing else owns it yet.
                        return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }

                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "no descriptor in ancillary data",
                ))
            })
            .await?;

        Ok(fd)
    }
}
