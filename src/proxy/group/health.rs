use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::common::picker::Picker;
use crate::common::singleflight::FlightGroup;
use crate::common::RouteError;
use crate::proxy::OutboundHandler;

pub const DEFAULT_CHECK_URL: &str = "http://www.gstatic.com/generate_204";
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// 解析简单 URL 为 (host, port, path)
pub fn parse_url(url: &str) -> (String, u16, String) {
    let (scheme, rest) = if let Some(r) = url.strip_prefix("https://") {
        ("https", r)
    } else if let Some(r) = url.strip_prefix("http://") {
        ("http", r)
    } else {
        ("http", url)
    };

    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let default_port: u16 = if scheme == "https" { 443 } else { 80 };

    let (host, port) = match host_port.rfind(':') {
        Some(idx) => {
            let port_str = &host_port[idx + 1..];
            match port_str.parse::<u16>() {
                Ok(p) => (host_port[..idx].to_string(), p),
                Err(_) => (host_port.to_string(), default_port),
            }
        }
        None => (host_port.to_string(), default_port),
    };

    (host, port, path.to_string())
}

/// 健康检查调度器：组级单飞去重 + 成员竞速。
///
/// Explicitly constructed and injected into every group adapter; the
/// single-flight registry it owns collapses the API-triggered and the
/// periodic check for the same (name, url, timeout) into one execution.
pub struct HealthCheckHub {
    flight: Arc<FlightGroup<u16>>,
}

impl HealthCheckHub {
    pub fn new() -> Self {
        Self {
            flight: Arc::new(FlightGroup::new()),
        }
    }

    /// 单飞 key：(名称, url, 超时)
    pub fn flight_key(name: &str, url: &str, timeout: Duration) -> String {
        format!("{}|{}|{}", name, url, timeout.as_millis())
    }

    /// 用户/API 触发的单个出站检查
    pub async fn check_proxy(
        &self,
        proxy: Arc<dyn OutboundHandler>,
        url: &str,
        timeout: Duration,
    ) -> Result<u16> {
        let key = Self::flight_key(proxy.name(), url, timeout);
        let url = url.to_string();
        self.flight
            .run(&key, || async move { proxy.health_check(&url, timeout).await })
            .await
    }

    /// 组级检查：整组单飞，内部对所有成员竞速
    pub async fn check_group(
        &self,
        group: &str,
        members: &[Arc<dyn OutboundHandler>],
        url: &str,
        timeout: Duration,
        check_all: bool,
        parent: &CancellationToken,
    ) -> Result<u16> {
        let group_key = Self::flight_key(group, url, timeout);
        let inner = self.race_members(
            members.to_vec(),
            group_key.clone(),
            url.to_string(),
            timeout,
            check_all,
            parent.clone(),
        );
        self.flight.run(&group_key, move || inner).await
    }

    /// 成员竞速（无组级去重；LoadBalance 的原子守卫路径直接调用）。
    ///
    /// `check_all` 模式下所有成员跑完以刷新各自的 alive/delay 状态，
    /// 但第一个成功的延迟仍立即返回给调用方。
    pub async fn race_members(
        &self,
        members: Vec<Arc<dyn OutboundHandler>>,
        key_prefix: String,
        url: String,
        timeout: Duration,
        check_all: bool,
        parent: CancellationToken,
    ) -> Result<u16> {
        let picker = if check_all {
            Picker::without_auto_cancel(&parent)
        } else {
            Picker::new(&parent)
        };
        let token = picker.token();

        for member in members {
            let flight = self.flight.clone();
            // 组内触发的成员检查带成员名后缀，避免与用户直接触发的
            // 同成员检查（key 为 成员名|url|超时）共享结果
            let key = format!("{}|{}", key_prefix, member.name());
            let url = url.clone();
            let token = token.clone();
            picker.spawn(async move {
                tokio::select! {
                    biased;
                    result = flight.run(&key, || async move {
                        member.health_check(&url, timeout).await
                    }) => result,
                    _ = token.cancelled() => anyhow::bail!("health check cancelled"),
                }
            });
        }

        match tokio::time::timeout(timeout, picker.wait()).await {
            Ok(Some(delay)) => Ok(delay),
            Ok(None) => Err(RouteError::HealthCheckFailed(
                "no member answered the probe".to_string(),
            )
            .into()),
            Err(_) => Err(RouteError::HealthCheckTimeout.into()),
        }
    }
}

impl Default for HealthCheckHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_url_http() {
        let (host, port, path) = parse_url("http://www.gstatic.com/generate_204");
        assert_eq!(host, "www.gstatic.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/generate_204");
    }

    #[test]
    fn parse_url_https() {
        let (host, port, path) = parse_url("https://example.com/test");
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
        assert_eq!(path, "/test");
    }

    #[test]
    fn parse_url_with_port() {
        let (host, port, path) = parse_url("http://localhost:8080/health");
        assert_eq!(host, "localhost");
        assert_eq!(port, 8080);
        assert_eq!(path, "/health");
    }

    #[test]
    fn parse_url_no_path() {
        let (host, port, path) = parse_url("http://example.com");
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/");
    }

    #[test]
    fn flight_key_includes_all_parts() {
        let key = HealthCheckHub::flight_key("g", "http://u/", Duration::from_secs(5));
        assert_eq!(key, "g|http://u/|5000");
    }
}
