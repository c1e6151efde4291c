use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pasarela::auth::{AccessChecker, Role, RoleSet, WILDCARD};
use pasarela::core::{CommandLabel, Database, StatementsCache};
use std::time::Duration;

/// 创建测试角色集合
fn create_role_set(count: usize) -> RoleSet {
    let roles = (0..count)
        .map(|i| {
            let mut role = Role::new(format!("role-{}", i));
            role.db_names = vec![format!("db-{}", i)];
            role.db_users = vec![format!("user-{}", i)];
            role.db_labels.insert("env".to_string(), format!("env-{}", i % 4));
            role
        })
        .chain(std::iter::once({
            let mut role = Role::new("catch-all");
            role.db_names = vec![WILDCARD.to_string()];
            role.db_users = vec!["alice".to_string()];
            role.db_labels.insert(WILDCARD.to_string(), WILDCARD.to_string());
            role
        }))
        .collect();
    RoleSet::new(roles)
}

/// 创建带有动态标签的数据库
fn create_database(labels: usize) -> Database {
    let mut db = Database::new("pg1", "postgres", "127.0.0.1:5432");
    for i in 0..labels {
        db.static_labels.insert(format!("static-{}", i), "value".to_string());
        let mut label = CommandLabel::new(Duration::from_secs(60), vec!["hostname".to_string()]);
        label.result = format!("host-{}", i);
        db.dynamic_labels.insert(format!("dynamic-{}", i), label);
    }
    db
}

/// 访问检查性能基准测试
fn bench_access_checks(c: &mut Criterion) {
    let mut group = c.benchmark_group("access_checks");
    let db = create_database(4);

    for role_count in [1usize, 16, 128].iter() {
        let roles = create_role_set(*role_count);
        group.bench_with_input(BenchmarkId::new("allowed", role_count), &roles, |b, roles| {
            b.iter(|| black_box(roles.check_access_to_database(&db, "alice", "app").is_ok()));
        });
        group.bench_with_input(BenchmarkId::new("denied", role_count), &roles, |b, roles| {
            b.iter(|| black_box(roles.check_access_to_database(&db, "mallory", "app").is_err()));
        });
    }

    group.finish();
}

/// 预处理语句缓存性能基准测试
fn bench_statements_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("statements_cache");

    for count in [10usize, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("save_get", count), count, |b, &count| {
            b.iter(|| {
                let mut cache = StatementsCache::new();
                for i in 0..count {
                    let name = format!("stmt_{}", i);
                    cache.save(name.as_str(), "SELECT * FROM users WHERE id = $1");
                }
                for i in 0..count {
                    black_box(cache.get(&format!("stmt_{}", i)));
                }
                black_box(cache.len())
            });
        });
    }

    group.finish();
}

/// 标签合并性能基准测试
fn bench_label_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("label_merge");

    for labels in [4usize, 32, 256].iter() {
        let db = create_database(*labels);
        group.bench_with_input(BenchmarkId::new("all_labels", labels), &db, |b, db| {
            b.iter(|| black_box(db.all_labels()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_access_checks,
    bench_statements_cache,
    bench_label_merge
);
criterion_main!(benches);
