use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bithedge_api::config::RiskParams;
use bithedge_api::quotes::{black_scholes_put, price_put_quote, PutQuoteParams};

fn bench_black_scholes(c: &mut Criterion) {
    c.bench_function("black_scholes_put", |b| {
        b.iter(|| {
            black_scholes_put(
                black_box(50_000.0),
                black_box(45_000.0),
                black_box(0.6),
                black_box(30.0 / 365.0),
                black_box(0.02),
            )
        })
    });
}

fn bench_full_quote_with_scenarios(c: &mut Criterion) {
    let params = PutQuoteParams {
        spot: 50_000.0,
        strike_pct: 90.0,
        amount: 0.5,
        days: 30,
        sigma: 0.6,
        risk_free_rate: 0.02,
        risk_params: RiskParams::default(),
        include_scenarios: true,
    };
    c.bench_function("put_quote_with_scenarios", |b| {
        b.iter(|| price_put_quote(black_box(params)))
    });
}

criterion_group!(benches, bench_black_scholes, bench_full_quote_with_scenarios);
criterion_main!(benches);
