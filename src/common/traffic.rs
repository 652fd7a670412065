use std::sync::atomic::{AtomicU64, Ordering};

/// 全局流量统计：上下行字节计数
pub struct TrafficStats {
    upload: AtomicU64,
    download: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self {
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        }
    }

    pub fn add_upload(&self, bytes: u64) {
        self.upload.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.download.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.upload() + self.download()
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}
