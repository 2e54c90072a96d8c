use std::io::{Error, ErrorKind, Result};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;

/// A wrapper that implements AsyncWrite and turns every line ending into '\r\n'.
///
/// A terminal in raw mode neither returns the cursor on '\n' nor feeds a line
/// on '\r' (which is what the Enter key sends), so both are rewritten.
/// A '\r\n' pair is kept as a single line ending.
pub struct CrlfWriter<T>
where
    T: AsyncWrite + Unpin,
{
    inner: T,
    translate: bool,
    pending: Vec<u8>,
    position: usize,
    last_was_cr: bool,
}

impl<T> CrlfWriter<T>
where
    T: AsyncWrite + Unpin,
{
    /// Wrap `writer`, translating line endings
    pub fn new(writer: T) -> Self {
        CrlfWriter {
            inner: writer,
            translate: true,
            pending: Vec::new(),
            position: 0,
            last_was_cr: false,
        }
    }

    /// Wrap `writer` without touching the bytes (stdout is not a terminal)
    pub fn passthrough(writer: T) -> Self {
        CrlfWriter {
            translate: false,
            ..CrlfWriter::new(writer)
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn push_translated(&mut self, data: &[u8]) {
        // Worst case: every byte is a line ending
        self.pending.reserve(data.len() * 2);

        for &byte in data {
            match byte {
                b'\r' => {
                    self.pending.extend_from_slice(b"\r\n");
                    self.last_was_cr = true;
                }
                // Already emitted together with the '\r'
                b'\n' if self.last_was_cr => self.last_was_cr = false,
                b'\n' => self.pending.extend_from_slice(b"\r\n"),
                _ => {
                    self.pending.push(byte);
                    self.last_was_cr = false;
                }
            }
        }
    }

    /// Write out everything translated so far.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        while self.position < self.pending.len() {
            let written =
                ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.position..]))?;

            if written == 0 {
                return Poll::Ready(Err(Error::new(
                    ErrorKind::WriteZero,
                    "failed to write translated bytes",
                )));
            }
            self.position += written;
        }

        self.pending.clear();
        self.position = 0;
        Poll::Ready(Ok(()))
    }
}

impl<T> AsyncWrite for CrlfWriter<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        let this = &mut *self;

        if !this.translate {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        // Bytes from a previous call go out first
        ready!(this.poll_drain(cx))?;

        this.push_translated(buf);

        // The input is accepted either way. Anything the inner writer could not
        // take yet stays pending until the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
