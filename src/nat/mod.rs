//! UDP session tracking.
//!
//! `NatTable` maps a session key (client source + destination) to the
//! established upstream packet transport. An entry's lifetime is bound to
//! its pump task: `add` spawns the caller-supplied pump and removes the
//! entry when the pump exits, whether from idle timeout or error.
//!
//! `Pool` serializes session creation: under a burst of first packets for
//! the same key exactly one caller dials upstream while the rest park on
//! a wait handle and re-read the table afterwards.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::common::{Address, BoxUdpTransport};

/// 会话键：客户端源地址 + 目的地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub source: SocketAddr,
    pub dest: Address,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}", self.source, self.dest)
    }
}

/// NAT 表项：上游报文传输 + 上游回程地址
#[derive(Clone)]
pub struct NatEntry {
    pub transport: Arc<BoxUdpTransport>,
    pub remote: Address,
}

pub struct NatTable {
    entries: Mutex<HashMap<SessionKey, NatEntry>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &SessionKey) -> Option<NatEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    /// 注册表项并启动其泵任务；泵退出时表项随之删除，
    /// 传输连接在最后一个引用释放时关闭。
    pub async fn add<F>(self: Arc<Self>, key: SessionKey, entry: NatEntry, pump: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.entries.lock().await.insert(key.clone(), entry);

        tokio::spawn(async move {
            pump.await;
            self.del(&key).await;
            debug!(session = %key, "udp session closed");
        });
    }

    pub async fn del(&self, key: &SessionKey) -> Option<NatEntry> {
        self.entries.lock().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new()
    }
}

/// 每键一次的创建锁。
///
/// 第一个调用者拿到 `First` 并负责建立上游连接，完成（或失败）后释放；
/// 其余并发调用者拿到 `Wait`，等待后重新查 NAT 表。Guard 在 Drop 时也会
/// 释放，首建失败不会悬死等待者。
pub struct Pool {
    pending: std::sync::Mutex<HashMap<SessionKey, watch::Receiver<bool>>>,
}

pub enum PoolEntry<'a> {
    First(PoolGuard<'a>),
    Wait(PoolWaiter),
}

pub struct PoolGuard<'a> {
    pool: &'a Pool,
    key: SessionKey,
    tx: Option<watch::Sender<bool>>,
}

pub struct PoolWaiter {
    rx: watch::Receiver<bool>,
}

impl Pool {
    pub fn new() -> Self {
        Self {
            pending: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &SessionKey) -> PoolEntry<'_> {
        let mut pending = self.lock_pending();
        if let Some(rx) = pending.get(key) {
            return PoolEntry::Wait(PoolWaiter { rx: rx.clone() });
        }
        let (tx, rx) = watch::channel(false);
        pending.insert(key.clone(), rx);
        PoolEntry::First(PoolGuard {
            pool: self,
            key: key.clone(),
            tx: Some(tx),
        })
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    fn del(&self, key: &SessionKey) {
        self.lock_pending().remove(key);
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SessionKey, watch::Receiver<bool>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolGuard<'_> {
    /// 创建完成（NAT 表已发布或确定失败）后释放所有等待者
    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(true);
            self.pool.del(&self.key);
        }
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl PoolWaiter {
    /// 等待首个调用者完成创建
    pub async fn wait(mut self) {
        if *self.rx.borrow() {
            return;
        }
        // 值变更或发送端被丢弃都表示创建流程已结束
        let _ = self.rx.changed().await;
    }
}
