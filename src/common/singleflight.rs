use std::collections::HashMap;
use std::future::Future;

use anyhow::Result;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// 单飞组：并发的同 key 调用合并为一次执行，共享结果。
///
/// The entry lives only while the execution is in flight; it is removed
/// when the leader finishes, success or failure, so a failed round never
/// poisons the key.
pub struct FlightGroup<T: Clone + Send + 'static> {
    inflight: Mutex<HashMap<String, broadcast::Sender<Result<T, String>>>>,
}

enum Role<T: Clone + Send + 'static> {
    Leader(broadcast::Sender<Result<T, String>>),
    Follower(broadcast::Receiver<Result<T, String>>),
}

impl<T: Clone + Send + 'static> FlightGroup<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// 以 key 执行 `make`；并发同 key 调用阻塞等待首个执行的结果。
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send,
    {
        let role = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(key) {
                Some(tx) => Role::Follower(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), tx.clone());
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let result = make().await;
                self.inflight.lock().await.remove(key);
                let shared = match &result {
                    Ok(v) => Ok(v.clone()),
                    Err(e) => Err(e.to_string()),
                };
                let _ = tx.send(shared);
                result
            }
            Role::Follower(mut rx) => {
                debug!(key = key, "joined in-flight execution");
                match rx.recv().await {
                    Ok(Ok(v)) => Ok(v),
                    Ok(Err(msg)) => Err(anyhow::anyhow!(msg)),
                    Err(_) => {
                        // leader 中途退出且未发布结果，清掉残留槽位
                        self.inflight.lock().await.remove(key);
                        Err(anyhow::anyhow!("shared execution for '{}' aborted", key))
                    }
                }
            }
        }
    }

    pub async fn inflight_len(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

impl<T: Clone + Send + 'static> Default for FlightGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}
