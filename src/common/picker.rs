use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 并发竞速原语：同时运行多个任务，取第一个成功结果。
///
/// Tasks share a child `CancellationToken`; in the default mode the token
/// is cancelled as soon as one task succeeds, signalling the rest to stop.
/// Cancellation is cooperative, tasks must poll the token. In
/// `without_auto_cancel` mode every task runs to completion while the
/// first success is still delivered to the caller immediately.
pub struct Picker<T> {
    token: CancellationToken,
    auto_cancel: bool,
    tx: mpsc::Sender<T>,
    rx: mpsc::Receiver<T>,
}

impl<T: Send + 'static> Picker<T> {
    pub fn new(parent: &CancellationToken) -> Self {
        Self::with_mode(parent, true)
    }

    pub fn without_auto_cancel(parent: &CancellationToken) -> Self {
        Self::with_mode(parent, false)
    }

    fn with_mode(parent: &CancellationToken, auto_cancel: bool) -> Self {
        // 容量 1 + try_send：只有第一个成功结果会被保留
        let (tx, rx) = mpsc::channel(1);
        Self {
            token: parent.child_token(),
            auto_cancel,
            tx,
            rx,
        }
    }

    /// 任务侧应轮询的取消令牌
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 启动一个候选任务。Err 结果被丢弃，Ok 参与竞速。
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Ok(value) = fut.await {
                let _ = tx.try_send(value);
            }
        });
    }

    /// 等待第一个成功结果。
    ///
    /// Returns `None` when every task failed, or when the token was
    /// cancelled from outside before any success arrived.
    pub async fn wait(mut self) -> Option<T> {
        // 关闭本地发送端，所有任务失败时 recv 返回 None
        drop(self.tx);
        let mut result = tokio::select! {
            biased;
            value = self.rx.recv() => value,
            _ = self.token.cancelled() => None,
        };
        if result.is_none() {
            // 取消与成功竞争时优先取已到达的成功结果
            result = self.rx.try_recv().ok();
        }
        if result.is_some() && self.auto_cancel {
            self.token.cancel();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn sleep_and_send(
        token: CancellationToken,
        delay_ms: u64,
        value: u32,
    ) -> impl Future<Output = anyhow::Result<u32>> {
        async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => Ok(value),
                _ = token.cancelled() => anyhow::bail!("cancelled"),
            }
        }
    }

    #[tokio::test]
    async fn first_success_wins() {
        let root = CancellationToken::new();
        let picker = Picker::new(&root);
        let token = picker.token();
        picker.spawn(sleep_and_send(token.clone(), 60, 2));
        picker.spawn(sleep_and_send(token, 10, 1));

        assert_eq!(picker.wait().await, Some(1));
    }

    #[tokio::test]
    async fn all_failures_yield_none() {
        let root = CancellationToken::new();
        let picker: Picker<u32> = Picker::new(&root);
        picker.spawn(async { anyhow::bail!("nope") });
        picker.spawn(async { anyhow::bail!("nope") });

        assert_eq!(picker.wait().await, None);
    }

    #[tokio::test]
    async fn outside_cancellation_yields_none() {
        let root = CancellationToken::new();
        let picker: Picker<u32> = Picker::new(&root);
        let token = picker.token();
        picker.spawn(sleep_and_send(token, 5_000, 1));

        root.cancel();
        assert_eq!(picker.wait().await, None);
    }

    #[tokio::test]
    async fn auto_cancel_short_circuits_peers() {
        let root = CancellationToken::new();
        let picker = Picker::new(&root);
        let token = picker.token();
        let late_ran = Arc::new(AtomicU32::new(0));

        picker.spawn(sleep_and_send(token.clone(), 1, 7));
        for _ in 0..5 {
            let token = token.clone();
            let late_ran = late_ran.clone();
            picker.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        late_ran.fetch_add(1, Ordering::SeqCst);
                        Ok(0)
                    }
                    _ = token.cancelled() => anyhow::bail!("cancelled"),
                }
            });
        }

        assert_eq!(picker.wait().await, Some(7));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(late_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn late_success_does_not_overwrite_winner() {
        let root = CancellationToken::new();
        let picker = Picker::without_auto_cancel(&root);
        let token = picker.token();
        picker.spawn(sleep_and_send(token.clone(), 1, 1));
        picker.spawn(sleep_and_send(token, 30, 2));

        assert_eq!(picker.wait().await, Some(1));
    }

    #[tokio::test]
    async fn without_auto_cancel_lets_tasks_finish() {
        let root = CancellationToken::new();
        let picker = Picker::without_auto_cancel(&root);
        let token = picker.token();
        let completions = Arc::new(AtomicU32::new(0));

        for delay in [1u64, 20, 40] {
            let token = token.clone();
            let completions = completions.clone();
            picker.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                        completions.fetch_add(1, Ordering::SeqCst);
                        Ok(delay as u32)
                    }
                    _ = token.cancelled() => anyhow::bail!("cancelled"),
                }
            });
        }

        assert_eq!(picker.wait().await, Some(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(completions.load(Ordering::SeqCst), 3);
    }
}
