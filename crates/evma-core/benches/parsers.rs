//! Parser throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use evma_core::buffer::InputBuf;
use evma_core::http::HttpParser;
use evma_core::parser::{ParseStatus, Parser};
use evma_core::parsers::Line;

const REQUEST: &[u8] = b"GET /static/app.js?v=12345 HTTP/1.1\r\n\
Host: bench.example.com\r\n\
User-Agent: bench/0.1\r\n\
Accept: */*\r\n\
Accept-Encoding: gzip, deflate\r\n\
Connection: keep-alive\r\n\r\n";

fn bench_http_request(c: &mut Criterion) {
    c.bench_function("http_request", |b| {
        b.iter(|| {
            let mut buf = InputBuf::new();
            buf.fill_from(black_box(REQUEST));
            let mut p = HttpParser::request();
            match p.process(&mut buf) {
                Ok(ParseStatus::Done(vals)) => black_box(vals),
                other => panic!("unexpected: {:?}", other),
            }
        })
    });
}

fn bench_line(c: &mut Criterion) {
    let mut payload = vec![b'x'; 512];
    payload.push(b'\n');

    c.bench_function("line_512", |b| {
        b.iter(|| {
            let mut buf = InputBuf::new();
            buf.fill_from(black_box(&payload));
            let mut p = Line::new(b'\n');
            match p.process(&mut buf) {
                Ok(ParseStatus::Done(vals)) => black_box(vals),
                other => panic!("unexpected: {:?}", other),
            }
        })
    });
}

criterion_group!(benches, bench_http_request, bench_line);
criterion_main!(benches);
