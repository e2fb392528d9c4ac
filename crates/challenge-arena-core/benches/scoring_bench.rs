use challenge_arena_core::{answer_digest, score_attempt};
use criterion::{criterion_group, criterion_main, Criterion};

fn bench_score_attempt(c: &mut Criterion) {
    c.bench_function("score_attempt_correct_all_bonuses", |b| {
        b.iter(|| {
            for tier in 1..=5_u8 {
                let delta = score_attempt(criterion::black_box(100), tier, true, 12.0, 60.0, 9)
                    .unwrap_or_else(|err| panic!("scoring bench fixture invalid: {err}"));
                criterion::black_box(delta);
            }
        });
    });
}

fn bench_answer_digest(c: &mut Criterion) {
    c.bench_function("answer_digest_short_answer", |b| {
        b.iter(|| criterion::black_box(answer_digest("  The Mitochondria  ")));
    });
}

criterion_group!(benches, bench_score_attempt, bench_answer_digest);
criterion_main!(benches);
