use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mealbot::factory::{self, BackendType};
use mealbot::storage::LedgerBackend;
use tempfile::TempDir;

const USERS: usize = 20;

fn setup(backend: BackendType) -> (Box<dyn LedgerBackend>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = factory::create(backend);
    store
        .init(dir.path().join("bench.db").to_str().unwrap())
        .unwrap();
    for i in 0..USERS {
        store.create_user(&format!("user{}", i)).unwrap();
    }
    (store, dir)
}

fn seed_data(store: &dyn LedgerBackend) {
    for i in 0..1000 {
        let payer = format!("user{}", i % USERS);
        let recipient = format!("user{}", (i * 7 + 3) % USERS);
        store.create_record(&payer, &recipient, (i % 5) as u32).unwrap();
    }
}

fn bench_record_creation(c: &mut Criterion) {
    for backend in [BackendType::Json, BackendType::Sqlite] {
        let (store, _dir) = setup(backend);
        c.bench_function(&format!("record_creation_{:?}", backend), |b| {
            b.iter(|| store.create_record(black_box("user0"), black_box("user1"), 1).unwrap())
        });
        store.close().unwrap();
    }
}

fn bench_recent_records(c: &mut Criterion) {
    for backend in [BackendType::Json, BackendType::Sqlite] {
        let (store, _dir) = setup(backend);
        seed_data(store.as_ref());
        c.bench_function(&format!("recent_records_{:?}", backend), |b| {
            b.iter(|| store.get_records_for_user(black_box("user3"), 25).unwrap())
        });
        store.close().unwrap();
    }
}

fn bench_global_summary(c: &mut Criterion) {
    for backend in [BackendType::Json, BackendType::Sqlite] {
        let (store, _dir) = setup(backend);
        seed_data(store.as_ref());
        c.bench_function(&format!("global_summary_{:?}", backend), |b| {
            b.iter(|| store.get_summary().unwrap())
        });
        store.close().unwrap();
    }
}

criterion_group!(
    benches,
    bench_record_creation,
    bench_recent_records,
    bench_global_summary
);
criterion_main!(benches);
