//! Lexer benchmarks.
//!
//! Run with: `cargo bench --package vpp-lex`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use vpp_lex::{Lexer, TokenKind};

/// Lex the whole input and count tokens, ignoring lexical errors.
fn token_count(source: &str) -> usize {
    let mut lexer = Lexer::new(source);
    let mut count = 0;
    loop {
        match lexer.next_token() {
            Ok(token) if token.kind == TokenKind::EndOfFile => break,
            Ok(_) => count += 1,
            Err(_) => {
                lexer.synchronize();
            }
        }
    }
    count
}

fn bench_verbatim(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexer_verbatim");

    // Pure pass-through text, the dominant case for real templates.
    let source = "module top(input clk, input rst_n, output reg [7:0] q);\n".repeat(200);
    group.throughput(Throughput::Bytes(source.len() as u64));
    group.bench_function("plain_verilog", |b| {
        b.iter(|| token_count(black_box(&source)))
    });

    group.finish();
}

fn bench_directives(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexer_directives");

    let block = "`let width = 8\n`for (i : [0..7])\nassign q[`i] = d[`(width - 1 - i)];\n`endfor\n";
    let source = block.repeat(100);
    group.throughput(Throughput::Bytes(source.len() as u64));
    group.bench_function("mixed_template", |b| {
        b.iter(|| token_count(black_box(&source)))
    });

    let source = "`let s = \"a string with \\\"escapes\\\" in it\"\n".repeat(200);
    group.throughput(Throughput::Bytes(source.len() as u64));
    group.bench_function("quotations", |b| {
        b.iter(|| token_count(black_box(&source)))
    });

    group.finish();
}

criterion_group!(benches, bench_verbatim, bench_directives);
criterion_main!(benches);
