//! Stream wrapper that reports the outcome of the first write.
//!
//! Adapters whose protocol handshake piggybacks on the first payload write
//! only surface dial failures at that point; groups hook it to keep their
//! failure accounting honest.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub type FirstWriteCallback = Box<dyn FnOnce(io::Result<()>) + Send>;

pub struct FirstWriteStream<S> {
    inner: S,
    callback: Option<FirstWriteCallback>,
}

impl<S> FirstWriteStream<S> {
    pub fn new(inner: S, callback: FirstWriteCallback) -> Self {
        Self {
            inner,
            callback: Some(callback),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FirstWriteStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FirstWriteStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(outcome) = &result {
            if let Some(callback) = self.callback.take() {
                callback(match outcome {
                    Ok(_) => Ok(()),
                    Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
                });
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn callback_fires_once_on_first_write() {
        let (client, _server) = tokio::io::duplex(1024);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = fired.clone();
        let mut wrapped = FirstWriteStream::new(
            client,
            Box::new(move |outcome| {
                assert!(outcome.is_ok());
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        wrapped.write_all(b"hello").await.unwrap();
        wrapped.write_all(b"again").await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_reports_write_errors() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = fired.clone();
        let mut wrapped = FirstWriteStream::new(
            client,
            Box::new(move |outcome| {
                assert!(outcome.is_err());
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(wrapped.write_all(b"hello").await.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
