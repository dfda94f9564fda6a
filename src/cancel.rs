// Jackson Coxson
//! Session-wide cancellation.
//!
//! A [`CancelSource`] is owned by the session and fired at most once, either by
//! an explicit close or by the usbmuxd detach watcher. Every connection derived
//! from the session carries a [`CancelToken`] and races each I/O call against it.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::IdeviceError;

/// Why a session stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The owner closed or dropped the session
    Closed,
    /// usbmuxd reported the device as gone
    Disconnected,
}

impl From<CancelReason> for IdeviceError {
    fn from(value: CancelReason) -> Self {
        match value {
            CancelReason::Closed => IdeviceError::Cancelled,
            CancelReason::Disconnected => IdeviceError::Disconnected,
        }
    }
}

/// Fires cancellation for every token created from it
#[derive(Clone, Debug)]
pub struct CancelSource {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Records `reason` unless a reason was already recorded.
    /// Returns whether this call was the one that fired.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observes a [`CancelSource`]. The default token is never cancelled.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    rx: Option<watch::Receiver<Option<CancelReason>>>,
}

impl CancelToken {
    pub fn never() -> Self {
        Self::default()
    }

    /// The recorded reason, or `Closed` once every source handle is gone
    pub fn reason(&self) -> Option<CancelReason> {
        let rx = self.rx.as_ref()?;
        if let Some(reason) = *rx.borrow() {
            return Some(reason);
        }
        match rx.has_changed() {
            Err(_) => Some(CancelReason::Closed),
            Ok(_) => None,
        }
    }

    /// Resolves once the source fires or is dropped
    pub async fn cancelled(&mut self) -> CancelReason {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        match rx.wait_for(|r| r.is_some()).await {
            Ok(reason) => (*reason).unwrap_or(CancelReason::Closed),
            Err(_) => CancelReason::Closed,
        }
    }
}

/// Runs `fut` unless `token` fires or `limit` elapses first.
/// `None` disables the time limit but never the cancellation.
pub async fn guard<T, F>(
    token: &mut CancelToken,
    limit: Option<Duration>,
    fut: F,
) -> Result<T, IdeviceError>
where
    F: Future<Output = Result<T, IdeviceError>>,
{
    if let Some(reason) = token.reason() {
        return Err(reason.into());
    }

    let timed = async {
        match limit {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(IdeviceError::Timeout)),
            None => fut.await,
        }
    };

    tokio::select! {
        biased;
        reason = token.cancelled() => Err(reason.into()),
        res = timed => res,
    }
}
