//! Rules engine benchmarks
//!
//! Run: cargo bench --bench rules
//!
//! Covers full move-sequence enumeration (the hot path of every roll)
//! and dice derivation from committed seeds.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use backgammon::fairness::{create_commit, derive_dice, verify_dice};
use backgammon::game::{expand_dice, generate_all_sequences, Board, Color};

// ============================================================================
// MOVE GENERATION
// ============================================================================

fn bench_sequences(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequences");
    let board = Board::initial();

    for (d1, d2) in [(3u8, 1u8), (6, 5), (4, 4), (6, 6)] {
        let dice = match expand_dice(d1, d2) {
            Ok(dice) => dice,
            Err(_) => continue,
        };
        group.bench_with_input(
            BenchmarkId::new("initial", format!("{d1}-{d2}")),
            &dice,
            |b, dice| b.iter(|| black_box(generate_all_sequences(&board, Color::White, dice))),
        );
    }

    group.finish();
}

// ============================================================================
// DICE
// ============================================================================

fn bench_dice(c: &mut Criterion) {
    let mut group = c.benchmark_group("dice");
    let commit = create_commit();

    group.bench_function("derive", |b| {
        let mut turn = 0u32;
        b.iter(|| {
            turn = turn.wrapping_add(1);
            black_box(derive_dice(&commit.server_seed, "client-seed", turn))
        });
    });

    let dice = derive_dice(&commit.server_seed, "client-seed", 7);
    group.bench_function("verify", |b| {
        b.iter(|| {
            black_box(verify_dice(
                &commit.commit_hash,
                &commit.server_seed,
                "client-seed",
                7,
                dice,
            ))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_sequences, bench_dice);
criterion_main!(benches);
