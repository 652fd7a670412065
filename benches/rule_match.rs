use criterion::{black_box, criterion_group, criterion_main, Criterion};

use switchyard::proxy::{InboundKind, Metadata, Network};
use switchyard::rule::Rule;

fn rules(n: usize) -> Vec<Rule> {
    let mut out = Vec::new();
    for i in 0..n {
        out.push(Rule::parse(&format!("DOMAIN-SUFFIX,site{}.example.com,PROXY", i)).unwrap());
        out.push(Rule::parse(&format!("IP-CIDR,10.{}.0.0/16,DIRECT,no-resolve", i % 250)).unwrap());
    }
    out.push(Rule::parse("MATCH,DIRECT").unwrap());
    out
}

fn metadata(host: &str) -> Metadata {
    Metadata {
        network: Network::Tcp,
        inbound: InboundKind::Socks,
        src_ip: "192.168.1.2".parse().unwrap(),
        src_port: 40000,
        dst_ip: None,
        host: host.to_string(),
        dst_port: 443,
        process: None,
    }
}

fn bench_rule_match(c: &mut Criterion) {
    let table = rules(500);
    let hit_early = metadata("www.site3.example.com");
    let hit_late = metadata("www.site499.example.com");
    let miss = metadata("unrelated.org");

    c.bench_function("match_hit_early_1000_rules", |b| {
        b.iter(|| {
            black_box(
                table
                    .iter()
                    .find(|rule| rule.matches(black_box(&hit_early), None)),
            );
        });
    });

    c.bench_function("match_hit_late_1000_rules", |b| {
        b.iter(|| {
            black_box(
                table
                    .iter()
                    .find(|rule| rule.matches(black_box(&hit_late), None)),
            );
        });
    });

    c.bench_function("match_fallthrough_1000_rules", |b| {
        b.iter(|| {
            black_box(table.iter().find(|rule| rule.matches(black_box(&miss), None)));
        });
    });
}

fn bench_rule_parse(c: &mut Criterion) {
    c.bench_function("parse_domain_suffix_rule", |b| {
        b.iter(|| {
            black_box(Rule::parse(black_box("DOMAIN-SUFFIX,example.com,PROXY")).unwrap());
        });
    });
}

criterion_group!(benches, bench_rule_match, bench_rule_parse);
criterion_main!(benches);
