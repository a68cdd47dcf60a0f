// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Benchmarks the RTSP wire codec's hot path: serializing a request and
//! reading it back through the peek-`$` multiplexer (§4.1). This is the
//! per-message cost paid by every `SETUP`/`PLAY`/keepalive round trip a
//! client or server session makes.

use criterion::{criterion_group, criterion_main, Criterion};
use rtsp_core::message::{read_item, Method, Request, Role};
use rtsp_core::{ConnectionContext, RtspUrl};

fn conn_ctx() -> ConnectionContext {
    ConnectionContext::new(
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:554".parse().unwrap(),
    )
}

fn sample_request() -> Request {
    let url = RtspUrl::parse("rtsp://192.168.1.30:554/live/ch0").unwrap();
    let mut req = Request::new(Method::Setup, url);
    req.header.set("CSeq", "2".to_string());
    req.header.set(
        "Transport",
        "RTP/AVP;unicast;client_port=4588-4589".to_string(),
    );
    req.header.set("User-Agent", "rtsp-core".to_string());
    req
}

fn bench_serialize(c: &mut Criterion) {
    let req = sample_request();
    c.bench_function("request_serialize", |b| {
        b.iter(|| req.serialize());
    });
}

fn bench_read_item(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let bytes = sample_request().serialize();
    let ctx = conn_ctx();
    c.bench_function("request_read_item", |b| {
        b.to_async(&rt).iter(|| {
            let bytes = bytes.clone();
            let ctx = ctx;
            async move {
                let mut reader = tokio::io::BufReader::new(&bytes[..]);
                read_item(&mut reader, &ctx, Role::Server).await.unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_serialize, bench_read_item);
criterion_main!(benches);
