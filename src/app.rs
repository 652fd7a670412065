use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::common::Address;
use crate::config::types::{Config, DnsConfig, OutboundConfig};
use crate::dns::{DnsResolver, FakeIpResolver, HickoryResolver, HostsResolver, SystemResolver};
use crate::proxy::direct::DirectOutbound;
use crate::proxy::group;
use crate::proxy::group::health::HealthCheckHub;
use crate::proxy::http::HttpOutbound;
use crate::proxy::reject::RejectOutbound;
use crate::proxy::socks5::Socks5Outbound;
use crate::proxy::OutboundHandler;
use crate::rule::process::{ProcessLookup, ProcfsProcessLookup};
use crate::rule::{parse_rules, GeoIpDb, Rule};
use crate::tunnel::{Mode, Tunnel, DIRECT_OUTBOUND, GLOBAL_OUTBOUND};

/// 应用装配：显式构建 tunnel / 出站表 / 健康检查调度器并持有其生命周期。
/// 没有全局单例；teardown 由 `shutdown` 确定性完成。
pub struct App {
    tunnel: Arc<Tunnel>,
    proxies: HashMap<String, Arc<dyn OutboundHandler>>,
    hub: Arc<HealthCheckHub>,
    token: CancellationToken,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("proxies", &self.proxies.len())
            .finish_non_exhaustive()
    }
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let token = CancellationToken::new();
        let hub = Arc::new(HealthCheckHub::new());

        let resolver = build_resolver(&config.dns)?;
        let geoip = match &config.geoip_db {
            Some(path) => Some(Arc::new(GeoIpDb::load(path)?)),
            None => None,
        };
        let process: Arc<dyn ProcessLookup> = Arc::new(ProcfsProcessLookup::new());

        let tunnel = Tunnel::new(resolver, geoip, Some(process), &token);

        let mode: Mode = config.mode.parse()?;
        let (rules, proxies) = build_routing(&config, &hub, &token)?;
        tunnel.install(rules, proxies.clone()).await;
        tunnel.set_mode(mode).await;
        tunnel
            .set_ignore_resolve_fail(config.ignore_resolve_fail)
            .await;

        info!(
            outbounds = proxies.len(),
            mode = mode.as_str(),
            "application assembled"
        );
        Ok(Self {
            tunnel,
            proxies,
            hub,
            token,
        })
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn proxies(&self) -> &HashMap<String, Arc<dyn OutboundHandler>> {
        &self.proxies
    }

    pub fn health_hub(&self) -> &Arc<HealthCheckHub> {
        &self.hub
    }

    /// 热重载：新配置构建失败时旧配置保持生效
    pub async fn reload(&mut self, config: Config) -> Result<()> {
        let mode: Mode = config.mode.parse()?;
        let (rules, proxies) = build_routing(&config, &self.hub, &self.token)?;

        let old = std::mem::replace(&mut self.proxies, proxies.clone());
        self.tunnel.install(rules, proxies).await;
        self.tunnel.set_mode(mode).await;
        self.tunnel
            .set_ignore_resolve_fail(config.ignore_resolve_fail)
            .await;

        // 旧组适配器停掉后台循环；在途连接继续用旧的 Arc
        for proxy in old.values() {
            proxy.destroy();
        }
        info!("configuration reloaded");
        Ok(())
    }

    pub async fn shutdown(self) {
        for proxy in self.proxies.values() {
            proxy.destroy();
        }
        self.tunnel.shutdown();
        self.token.cancel();
        info!("shut down");
    }
}

fn build_resolver(dns: &DnsConfig) -> Result<Arc<dyn DnsResolver>> {
    let base: Arc<dyn DnsResolver> = match (&dns.fake_ip, &dns.server) {
        (Some(cidr), _) => Arc::new(FakeIpResolver::new(cidr)?),
        (None, Some(server)) => Arc::new(HickoryResolver::new(server)?),
        (None, None) => Arc::new(SystemResolver),
    };

    if dns.hosts.is_empty() {
        return Ok(base);
    }
    let mut hosts: HashMap<String, Vec<IpAddr>> = HashMap::new();
    for (name, ip) in &dns.hosts {
        let ip: IpAddr = ip
            .parse()
            .with_context(|| format!("invalid hosts entry '{}: {}'", name, ip))?;
        hosts.entry(name.clone()).or_default().push(ip);
    }
    Ok(Arc::new(HostsResolver::new(base, hosts)))
}

fn build_routing(
    config: &Config,
    hub: &Arc<HealthCheckHub>,
    token: &CancellationToken,
) -> Result<(Vec<Rule>, HashMap<String, Arc<dyn OutboundHandler>>)> {
    let rules = parse_rules(&config.rules)?;

    let mut proxies: HashMap<String, Arc<dyn OutboundHandler>> = HashMap::new();
    let mut ordered_names: Vec<String> = Vec::new();

    // 内建出站
    proxies.insert(
        DIRECT_OUTBOUND.to_string(),
        Arc::new(DirectOutbound::new(DIRECT_OUTBOUND)),
    );
    proxies.insert(
        "REJECT".to_string(),
        Arc::new(RejectOutbound::new("REJECT")),
    );

    for outbound in &config.outbounds {
        let handler = build_outbound(outbound)?;
        if proxies.insert(outbound.name.clone(), handler).is_some() {
            anyhow::bail!("duplicate outbound name '{}'", outbound.name);
        }
        ordered_names.push(outbound.name.clone());
    }

    for (name, handler) in group::build_groups(&config.proxy_groups, &proxies, hub, token)? {
        proxies.insert(name.clone(), handler);
        ordered_names.push(name);
    }

    // GLOBAL：覆盖全部出站与组的手动选择器
    if !proxies.contains_key(GLOBAL_OUTBOUND) {
        let mut members: Vec<Arc<dyn OutboundHandler>> =
            vec![proxies[DIRECT_OUTBOUND].clone(), proxies["REJECT"].clone()];
        for name in &ordered_names {
            members.push(proxies[name].clone());
        }
        let global = group::selector::SelectorGroup::new(GLOBAL_OUTBOUND.to_string(), members)?;
        proxies.insert(GLOBAL_OUTBOUND.to_string(), Arc::new(global));
    }

    // 规则目标必须存在，配置期即失败
    for rule in &rules {
        if !proxies.contains_key(rule.adapter()) {
            anyhow::bail!("rule '{}' targets unknown outbound '{}'", rule, rule.adapter());
        }
    }

    Ok((rules, proxies))
}

fn build_outbound(config: &OutboundConfig) -> Result<Arc<dyn OutboundHandler>> {
    let handler: Arc<dyn OutboundHandler> = match config.protocol.as_str() {
        "direct" => Arc::new(DirectOutbound::new(config.name.clone())),
        "reject" => Arc::new(RejectOutbound::new(config.name.clone())),
        "http" => Arc::new(HttpOutbound::new(
            config.name.clone(),
            server_address(config)?,
            config.settings.username.clone(),
            config.settings.password.clone(),
        )),
        "socks5" => Arc::new(Socks5Outbound::new(
            config.name.clone(),
            server_address(config)?,
            config.settings.username.clone(),
            config.settings.password.clone(),
        )),
        other => anyhow::bail!(
            "unsupported outbound protocol '{}' for '{}'",
            other,
            config.name
        ),
    };
    info!(
        outbound = config.name,
        protocol = config.protocol,
        "outbound registered"
    );
    Ok(handler)
}

fn server_address(config: &OutboundConfig) -> Result<Address> {
    let address = config.settings.address.as_ref().ok_or_else(|| {
        anyhow::anyhow!("outbound '{}' missing server address", config.name)
    })?;
    let port = config
        .settings
        .port
        .ok_or_else(|| anyhow::anyhow!("outbound '{}' missing server port", config.name))?;
    Ok(match address.parse::<IpAddr>() {
        Ok(ip) => Address::Ip(std::net::SocketAddr::new(ip, port)),
        Err(_) => Address::Domain(address.clone(), port),
    })
}
