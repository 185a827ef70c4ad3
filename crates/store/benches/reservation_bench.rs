use chrono::{Duration, Utc};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{Money, ReservationRequest, Variant};
use store::{CartStore, InMemoryStore, InventoryLedger, ReservationStore};

fn bench_reserve_and_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();
    let (variant_id, cart_id) = rt.block_on(async {
        let variant = Variant::new("SKU-BENCH", "Bench", Money::from_cents(100), "usd");
        let variant = store.create_variant(variant, u32::MAX / 2).await.unwrap();
        let cart = store
            .create_cart("bench", Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        (variant.id, cart.id)
    });

    c.bench_function("store/reserve_and_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                store
                    .reserve_all(
                        cart_id,
                        vec![ReservationRequest::new(variant_id, 1)],
                        Utc::now() + Duration::minutes(30),
                    )
                    .await
                    .unwrap();
                store.release_all(cart_id).await.unwrap();
            });
        });
    });
}

fn bench_reserve_ten_variants(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();
    let (requests, cart_id) = rt.block_on(async {
        let mut requests = Vec::new();
        for i in 0..10 {
            let variant = Variant::new(format!("SKU-{i}"), "Bench", Money::from_cents(100), "usd");
            let variant = store.create_variant(variant, u32::MAX / 2).await.unwrap();
            requests.push(ReservationRequest::new(variant.id, 2));
        }
        let cart = store
            .create_cart("bench-multi", Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        (requests, cart.id)
    });

    c.bench_function("store/reserve_ten_variants", |b| {
        b.iter(|| {
            rt.block_on(async {
                store
                    .reserve_all(cart_id, requests.clone(), Utc::now() + Duration::minutes(30))
                    .await
                    .unwrap();
                store.release_all(cart_id).await.unwrap();
            });
        });
    });
}

fn bench_read_stock_level(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();
    let variant_id = rt.block_on(async {
        let variant = Variant::new("SKU-READ", "Bench", Money::from_cents(100), "usd");
        store.create_variant(variant, 100).await.unwrap().id
    });

    c.bench_function("store/read_stock_level", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.read(variant_id).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_reserve_and_release,
    bench_reserve_ten_variants,
    bench_read_stock_level
);
criterion_main!(benches);
