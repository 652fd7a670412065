use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::proxy::Network;

const CACHE_LIMIT: usize = 4096;

/// 进程名查询：`(协议, 客户端本地地址) -> 进程名`
pub trait ProcessLookup: Send + Sync {
    fn process_name(&self, network: Network, local: SocketAddr) -> Option<String>;
}

/// 基于 procfs 的实现（仅 Linux 上能给出结果）
pub struct ProcfsProcessLookup {
    cache: Mutex<HashMap<String, String>>,
}

impl ProcfsProcessLookup {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ProcfsProcessLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLookup for ProcfsProcessLookup {
    fn process_name(&self, network: Network, local: SocketAddr) -> Option<String> {
        let key = format!("{}:{}", network.as_str(), local);

        if let Ok(cache) = self.cache.lock() {
            if let Some(name) = cache.get(&key) {
                return Some(name.clone());
            }
        }

        let name = detect(network, local)?;

        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() >= CACHE_LIMIT {
                cache.clear();
            }
            cache.insert(key, name.clone());
        }
        Some(name)
    }
}

#[cfg(target_os = "linux")]
fn detect(network: Network, local: SocketAddr) -> Option<String> {
    let tables: &[&str] = match network {
        Network::Tcp => &["/proc/net/tcp", "/proc/net/tcp6"],
        Network::Udp => &["/proc/net/udp", "/proc/net/udp6"],
    };
    let inode = tables.iter().find_map(|path| find_socket_inode(path, local))?;
    let pid = find_pid_by_inode(inode)?;
    let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
    let name = comm.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(not(target_os = "linux"))]
fn detect(_network: Network, _local: SocketAddr) -> Option<String> {
    None
}

/// /proc/net/* 行格式：`sl local_address rem_address st ... uid timeout inode ...`,
/// 地址为内核字节序十六进制
#[cfg(target_os = "linux")]
fn find_socket_inode(path: &str, local: SocketAddr) -> Option<u64> {
    let want_port = format!("{:04X}", local.port());
    let want_ip = hex_ip(&local.ip());
    let content = std::fs::read_to_string(path).ok()?;

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let Some((ip_hex, port_hex)) = fields[1].split_once(':') else {
            continue;
        };
        if port_hex != want_port {
            continue;
        }
        let wildcard = ip_hex.bytes().all(|b| b == b'0');
        if ip_hex != want_ip && !wildcard {
            continue;
        }
        if let Ok(inode) = fields[9].parse::<u64>() {
            if inode != 0 {
                return Some(inode);
            }
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn hex_ip(ip: &std::net::IpAddr) -> String {
    match ip {
        std::net::IpAddr::V4(v4) => {
            format!("{:08X}", u32::from_le_bytes(v4.octets()))
        }
        std::net::IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut out = String::with_capacity(32);
            for chunk in octets.chunks(4) {
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                out.push_str(&format!("{:08X}", word));
            }
            out
        }
    }
}

#[cfg(target_os = "linux")]
fn find_pid_by_inode(inode: u64) -> Option<u32> {
    let target = format!("socket:[{}]", inode);
    let proc_dir = std::fs::read_dir("/proc").ok()?;

    for entry in proc_dir.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(format!("/proc/{}/fd", pid)) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if link.to_string_lossy() == target {
                    return Some(pid);
                }
            }
        }
    }
    None
}
