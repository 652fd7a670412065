use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::common::RouteError;
use crate::config::types::ProxyGroupConfig;

struct Node<'a> {
    indegree: usize,
    cfg: Option<&'a ProxyGroupConfig>,
}

/// 校验代理组依赖为 DAG，并按依赖序（叶子在前）返回构建顺序。
///
/// 成环时报告的名字集合恰好是互相依赖的那一圈：剩余子图里把出度为 0
/// 的边界逐层剥掉，剥不动的就是环上的节点。
pub fn sort_groups(configs: &[ProxyGroupConfig]) -> Result<Vec<&ProxyGroupConfig>> {
    let mut graph: HashMap<&str, Node> = HashMap::new();

    for cfg in configs {
        match graph.get_mut(cfg.name.as_str()) {
            Some(node) => {
                if node.cfg.is_some() {
                    anyhow::bail!("duplicate proxy group '{}'", cfg.name);
                }
                node.cfg = Some(cfg);
            }
            None => {
                graph.insert(
                    cfg.name.as_str(),
                    Node {
                        indegree: 0,
                        cfg: Some(cfg),
                    },
                );
            }
        }
        for member in &cfg.proxies {
            graph
                .entry(member.as_str())
                .or_insert(Node {
                    indegree: 0,
                    cfg: None,
                })
                .indegree += 1;
        }
    }

    let mut order = Vec::new();
    while !graph.is_empty() {
        let Some(name) = graph
            .iter()
            .find(|(_, node)| node.indegree == 0)
            .map(|(name, _)| *name)
        else {
            return Err(cycle_members(&graph).into());
        };

        if let Some(node) = graph.remove(name) {
            if let Some(cfg) = node.cfg {
                for member in &cfg.proxies {
                    if let Some(child) = graph.get_mut(member.as_str()) {
                        child.indegree -= 1;
                    }
                }
                order.push(cfg);
            }
        }
    }

    // 无人引用的根先出，反转后叶子在前
    order.reverse();
    Ok(order)
}

fn cycle_members(graph: &HashMap<&str, Node>) -> RouteError {
    let remaining: HashSet<&str> = graph.keys().copied().collect();

    let mut outdeg: HashMap<&str, usize> = remaining.iter().map(|n| (*n, 0)).collect();
    let mut referrers: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, node) in graph {
        if let Some(cfg) = node.cfg {
            for member in &cfg.proxies {
                if remaining.contains(member.as_str()) {
                    *outdeg.entry(name).or_insert(0) += 1;
                    referrers.entry(member.as_str()).or_default().push(name);
                }
            }
        }
    }

    let mut frontier: Vec<&str> = outdeg
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut peeled: HashSet<&str> = HashSet::new();

    while let Some(name) = frontier.pop() {
        if !peeled.insert(name) {
            continue;
        }
        if let Some(parents) = referrers.get(name) {
            for parent in parents {
                if let Some(d) = outdeg.get_mut(parent) {
                    *d -= 1;
                    if *d == 0 {
                        frontier.push(parent);
                    }
                }
            }
        }
    }

    let mut names: Vec<String> = remaining
        .into_iter()
        .filter(|n| !peeled.contains(n))
        .map(|n| n.to_string())
        .collect();
    names.sort();
    RouteError::CycleDetected(names)
}
