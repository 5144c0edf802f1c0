use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use portero::balancer::{RedirectRule, SessionBalancer};
use portero::registry::{BackendDescriptor, NodeRole, NodeStatus};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn descriptors(count: usize) -> Vec<BackendDescriptor> {
    (0..count)
        .map(|id| BackendDescriptor {
            id,
            host: "127.0.0.1".to_string(),
            port: 5432 + id as u16,
            weight: 1.0 + (id % 3) as f64,
            role: if id == 0 {
                NodeRole::Primary
            } else {
                NodeRole::Standby
            },
            status: NodeStatus::Up,
        })
        .collect()
}

fn bench_weighted_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_selection");

    for node_count in [2usize, 8, 32].iter() {
        let nodes = descriptors(*node_count);
        let balancer = SessionBalancer::default();

        group.bench_with_input(
            BenchmarkId::new("select_node", node_count),
            node_count,
            |b, _| {
                let mut rng = StdRng::seed_from_u64(7);
                b.iter(|| {
                    let picked = balancer.select_node(&nodes, "shop", None, &mut rng);
                    black_box(picked);
                });
            },
        );
    }

    group.finish();
}

fn bench_redirect_rules(c: &mut Criterion) {
    let nodes = descriptors(8);
    let balancer = SessionBalancer::new(
        RedirectRule::parse_list("prod:standby(0.8),analytics:2").unwrap(),
        RedirectRule::parse_list("reporting:standby").unwrap(),
    );

    c.bench_function("select_with_database_rule", |b| {
        let mut rng = StdRng::seed_from_u64(7);
        b.iter(|| {
            let picked = balancer.select_node(&nodes, "prod", None, &mut rng);
            black_box(picked);
        });
    });

    c.bench_function("select_with_app_rule", |b| {
        let mut rng = StdRng::seed_from_u64(7);
        b.iter(|| {
            let picked = balancer.select_node(&nodes, "prod", Some("reporting"), &mut rng);
            black_box(picked);
        });
    });
}

criterion_group!(benches, bench_weighted_selection, bench_redirect_rules);
criterion_main!(benches);
