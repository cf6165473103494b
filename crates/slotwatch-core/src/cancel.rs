//! Cancel - ワーカー単位のキャンセル信号（watch チャネル）
//!
//! `CancelHandle` を drop してもキャンセル扱いにはならない。
//! 明示的に `cancel()` したときだけ。

use tokio::sync::watch;

/// Owning side, kept by the scheduler.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelSignal { rx })
    }

    pub fn cancel(&self) {
        // send_replace は受信側が全部 drop されていても失敗しない
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observing side, handed to workers and through them to every suspension point.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires (tests, one-off calls).
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // 送信側がいない = もう誰もキャンセルしない
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep unless cancelled first. Returns `false` when cancelled.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_sleep() {
        let (handle, signal) = CancelHandle::new();
        let sleeper = tokio::spawn({
            let signal = signal.clone();
            async move { signal.sleep(Duration::from_secs(3600)).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        assert!(!sleeper.await.unwrap());
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn never_signal_lets_sleep_finish() {
        let signal = CancelSignal::never();
        assert!(signal.sleep(Duration::from_secs(5)).await);
        assert!(!signal.is_cancelled());
    }
}
