use std::collections::HashMap;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tally_core::{AccountId, Currency};
use tally_ledger::{Account, AccountType, CreateTransactionRequest, EntryRequest, Validator};

fn accounts(n: usize) -> Vec<Account> {
    let now = Utc::now();
    let nzd = Currency::parse("NZD").unwrap();
    (0..n)
        .map(|i| Account {
            id: AccountId::new(),
            name: format!("acc-{i}"),
            account_type: AccountType::Asset,
            currency: nzd,
            created_at: now,
            updated_at: now,
        })
        .collect()
}

/// Balanced request with `n` entries alternating +amount / -amount.
fn balanced_request(accounts: &[Account], n: usize) -> CreateTransactionRequest {
    let entries = (0..n)
        .map(|i| EntryRequest {
            account_id: accounts[i % accounts.len()].id.to_string(),
            amount: if i % 2 == 0 { 1_000 } else { -1_000 },
        })
        .collect();
    CreateTransactionRequest {
        idempotency_key: "bench".to_string(),
        description: "benchmark".to_string(),
        source: "api".to_string(),
        posted_at: Some("2025-01-01T00:00:00Z".to_string()),
        entries,
    }
}

fn bench_validate(c: &mut Criterion) {
    let validator = Validator::default();
    let accs = accounts(10);
    let directory: HashMap<AccountId, Account> = accs.iter().map(|a| (a.id, a.clone())).collect();

    let mut group = c.benchmark_group("validate");
    for n in [2usize, 10, 100] {
        let req = balanced_request(&accs, n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &req, |b, req| {
            b.iter(|| validator.validate(black_box(req), black_box(&directory)).unwrap())
        });
    }
    group.finish();
}

fn bench_precheck(c: &mut Criterion) {
    let validator = Validator::default();
    let accs = accounts(10);
    let req = balanced_request(&accs, 100);

    c.bench_function("precheck/100", |b| {
        b.iter(|| validator.precheck(black_box(&req)).unwrap())
    });
}

criterion_group!(benches, bench_validate, bench_precheck);
criterion_main!(benches);
