//! Callback-to-future adapter
//!
//! ```ignore
//! let (callback, reply) = PendingReply::pair();
//! connection.datapaths_get(DatapathId::Name("dp0".into()), callback)?;
//! let datapath = reply.await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::error::{NetlinkError, Result};

/// Receiving side of a reply callback. Resolves to `ConnectionClosed` if
/// the callback is dropped without being called.
#[derive(Debug)]
pub struct PendingReply<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> PendingReply<T> {
    /// A callback and the reply it will complete.
    pub fn pair() -> (impl FnOnce(Result<T>) + Send + 'static, Self) {
        let (tx, rx) = oneshot::channel();
        let callback = move |result: Result<T>| {
            let _ = tx.send(result);
        };
        (callback, Self { rx })
    }

    /// Block the calling thread until the reply arrives.
    ///
    /// Must not be called from the driver thread or from inside an async
    /// runtime.
    pub fn wait(self) -> Result<T> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(NetlinkError::ConnectionClosed))
    }

    /// Take the reply if it already arrived.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(NetlinkError::ConnectionClosed)),
        }
    }
}

impl<T> Future for PendingReply<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(NetlinkError::ConnectionClosed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_take() {
        let (callback, mut reply) = PendingReply::<u32>::pair();
        assert!(reply.try_take().is_none());
        callback(Ok(24));
        assert_eq!(reply.try_take().unwrap().unwrap(), 24);
    }

    #[test]
    fn test_dropped_callback_is_connection_closed() {
        let (callback, reply) = PendingReply::<u32>::pair();
        drop(callback);
        assert!(matches!(reply.wait(), Err(NetlinkError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_await_from_other_thread() {
        let (callback, reply) = PendingReply::<String>::pair();
        std::thread::spawn(move || callback(Ok("ovs_datapath".to_string())));
        assert_eq!(reply.await.unwrap(), "ovs_datapath");
    }
}
