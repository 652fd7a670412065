pub mod dag;
pub mod fallback;
pub mod health;
pub mod loadbalance;
pub mod relay;
pub mod selector;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::types::ProxyGroupConfig;
use crate::proxy::OutboundHandler;

use fallback::FallbackGroup;
use health::HealthCheckHub;
use loadbalance::LoadBalanceGroup;
use relay::RelayGroup;
use selector::SelectorGroup;

/// 按依赖序构建全部代理组，返回 (name, handler) 列表（叶子在前）。
///
/// `existing` 为已注册的具体出站；组可以引用更早构建的组。
pub fn build_groups(
    configs: &[ProxyGroupConfig],
    existing: &HashMap<String, Arc<dyn OutboundHandler>>,
    hub: &Arc<HealthCheckHub>,
    parent: &CancellationToken,
) -> Result<Vec<(String, Arc<dyn OutboundHandler>)>> {
    let ordered = dag::sort_groups(configs)?;
    let mut built: Vec<(String, Arc<dyn OutboundHandler>)> = Vec::new();

    for config in ordered {
        let mut members: Vec<Arc<dyn OutboundHandler>> = Vec::new();
        for member_name in &config.proxies {
            let handler = existing
                .get(member_name)
                .or_else(|| {
                    built
                        .iter()
                        .find(|(name, _)| name == member_name)
                        .map(|(_, handler)| handler)
                })
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "proxy group '{}' references unknown proxy '{}'",
                        config.name,
                        member_name
                    )
                })?;
            members.push(handler.clone());
        }

        let url = config
            .url
            .clone()
            .unwrap_or_else(|| health::DEFAULT_CHECK_URL.to_string());
        let interval = Duration::from_secs(config.interval);

        let handler: Arc<dyn OutboundHandler> = match config.group_type.as_str() {
            "selector" => Arc::new(SelectorGroup::new(config.name.clone(), members)?),
            "fallback" => Arc::new(FallbackGroup::new(
                config.name.clone(),
                members,
                url,
                interval,
                hub.clone(),
                parent,
            )?),
            "load-balance" => Arc::new(LoadBalanceGroup::new(
                config.name.clone(),
                members,
                config.url.clone(),
                interval,
                hub.clone(),
                parent,
            )?),
            "relay" => Arc::new(RelayGroup::new(config.name.clone(), members)?),
            other => anyhow::bail!(
                "unsupported proxy group type '{}' for group '{}'",
                other,
                config.name
            ),
        };

        info!(group = config.name, kind = config.group_type, "proxy group built");
        built.push((config.name.clone(), handler));
    }

    Ok(built)
}
