use core::hint::black_box;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use genserve::{
    detokenize::IncrementalDecoder,
    stop::StopCondition,
    tokenizer::{ByteTokenizer, Tokenizer},
};

const TEXT: &str = "The quick brown fox jumps over the lazy dog.\n\
    Pack my box with five dozen liquor jugs. 日本語のテキストも少し。\n";

fn bench_stop_condition(c: &mut Criterion) {
    let mut group = c.benchmark_group("stop_condition");
    let tokenizer = ByteTokenizer::new();

    for &num_words in &[1usize, 8, 64] {
        let words: Vec<String> = (0..num_words).map(|i| format!("<stop-{i}>")).collect();
        let stop = StopCondition::from_words(&tokenizer, &words).unwrap();
        let tokens = tokenizer.encode(&TEXT.repeat(32), false).unwrap();

        group.throughput(Throughput::Elements(tokens.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("per_token", num_words),
            &tokens,
            |b, tokens| {
                b.iter(|| {
                    let mut hits = 0;
                    for end in 1..=tokens.len() {
                        hits += usize::from(stop.matches(black_box(&tokens[..end])));
                    }
                    black_box(hits)
                });
            },
        );
    }
    group.finish();
}

fn bench_incremental_decoder(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_decoder");
    let tokenizer = ByteTokenizer::new();

    for &repeat in &[1usize, 16] {
        let tokens = tokenizer.encode(&TEXT.repeat(repeat), false).unwrap();
        group.throughput(Throughput::Elements(tokens.len() as u64));
        group.bench_with_input(BenchmarkId::new("token_by_token", repeat), &tokens, |b, tokens| {
            b.iter(|| {
                let mut decoder = IncrementalDecoder::new(tokenizer.clone(), false);
                let mut out = 0;
                for id in tokens {
                    if let Some(text) = decoder.push(core::slice::from_ref(id)).unwrap() {
                        out += text.len();
                    }
                }
                if let Some(text) = decoder.finish().unwrap() {
                    out += text.len();
                }
                black_box(out)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_stop_condition, bench_incremental_decoder);
criterion_main!(benches);
