use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use weft::Grammar;

fn digits_grammar() -> Grammar {
    let mut b = Grammar::builder();
    let digits: Vec<_> = (0..10).map(|d| b.literal(&d.to_string())).collect();
    let digit = b.alternative(digits);
    b.rule("<digit>", digit);
    let digit_ref = b.nonterminal("<digit>");
    let body = b.plus(digit_ref);
    b.rule("<start>", body);
    let mut g = b.build().unwrap();
    g.prime().unwrap();
    g
}

fn long_repetition(c: &mut Criterion) {
    let mut grammar = digits_grammar();
    let input = "7".repeat(2_000);
    c.bench_function("parse_2k_repetition", |b| {
        b.iter(|| {
            let tree = grammar.parse(input.as_str(), "<start>").unwrap();
            black_box(tree)
        })
    });
}

criterion_group!(benches, long_repetition);
criterion_main!(benches);
