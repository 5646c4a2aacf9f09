//! Codec throughput benchmark, trimmed down from the teacher crate's
//! `benches/sip_codec_performance.rs` to the one round trip this crate
//! still performs on every datagram: parse followed by serialize.
//! The teacher's zero-copy/pool benchmarks are dropped along with the
//! code they measured.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sipvine::SipMessage;

const INVITE: &str = "INVITE sip:201@server SIP/2.0\r\nVia: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bK776asdhds\r\nFrom: <sip:[email protected]>;tag=1928301774\r\nTo: <sip:[email protected]>\r\nCall-ID: a84b4c76e66710@pc33.atlanta.com\r\nCSeq: 314159 INVITE\r\nContact: <sip:[email protected]>\r\nContent-Type: application/sdp\r\n\r\nv=0\r\no=alice 2890844526 2890844526 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\nm=audio 49172 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";

fn parse_benchmark(c: &mut Criterion) {
    c.bench_function("parse_invite", |b| {
        b.iter(|| SipMessage::parse(black_box(INVITE.as_bytes())).unwrap())
    });
}

fn round_trip_benchmark(c: &mut Criterion) {
    let message = SipMessage::parse(INVITE.as_bytes()).unwrap();
    c.bench_function("serialize_invite", |b| {
        b.iter(|| black_box(&message).serialize())
    });
}

criterion_group!(benches, parse_benchmark, round_trip_benchmark);
criterion_main!(benches);
