use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use eap_proto::diameter::{Avp, AvpCode, AvpReader, encode_all};
use eap_proto::eap::eap_tls::{EapTlsPacket, FeedResult, FragmentAssembler, FragmentWriter};
use eap_proto::{EapType, mschap};

fn tls_message(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn fragments(message: &[u8], mtu: usize) -> Vec<EapTlsPacket> {
    let mut writer = FragmentWriter::new();
    writer.set_message(message.to_vec());
    let mut packets = Vec::new();
    let mut identifier = 0u8;
    loop {
        let (packet, more) = writer
            .next_fragment(identifier, mtu, EapType::Ttls)
            .expect("Failed to fragment");
        packets.push(EapTlsPacket::from_eap_packet(&packet).expect("Failed to parse fragment"));
        if !more {
            return packets;
        }
        identifier = identifier.wrapping_add(1);
    }
}

fn bench_fragment_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragment_reassembly");

    for size in [1_000, 4_000, 16_000, 64_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let packets = fragments(&tls_message(size), 1020);
            b.iter(|| {
                let mut assembler = FragmentAssembler::new();
                for (identifier, packet) in packets.iter().enumerate() {
                    if let FeedResult::Complete(bytes) = assembler
                        .feed(identifier as u8, black_box(packet))
                        .expect("Failed to reassemble")
                    {
                        return bytes;
                    }
                }
                Vec::new()
            });
        });
    }

    group.finish();
}

fn bench_fragmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragmentation");

    for mtu in [64, 1020, 1400].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(mtu), mtu, |b, &mtu| {
            let message = tls_message(16_000);
            b.iter(|| fragments(black_box(&message), mtu));
        });
    }

    group.finish();
}

fn bench_avp_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("avp_codec");

    let avps = vec![
        Avp::new(AvpCode::USER_NAME, b"testuser@example.com".to_vec()),
        Avp::new(AvpCode::MS_CHAP_CHALLENGE, vec![0x5A; 16]),
        Avp::new(AvpCode::MS_CHAP2_RESPONSE, vec![0x11; 50]),
    ];

    group.bench_function("encode", |b| {
        b.iter(|| encode_all(black_box(&avps)).expect("Failed to encode"))
    });

    let encoded = encode_all(&avps).expect("Failed to encode");
    group.bench_function("decode_for_code", |b| {
        b.iter(|| {
            AvpReader::new(black_box(&encoded))
                .decode_for_code(AvpCode::MS_CHAP2_RESPONSE)
                .expect("Failed to decode")
        })
    });

    group.finish();
}

fn bench_mschapv2(c: &mut Criterion) {
    let auth_challenge = [0x5B; 16];
    let peer_challenge = [0x21; 16];

    c.bench_function("mschapv2_nt_response", |b| {
        b.iter(|| {
            mschap::generate_nt_response(
                black_box(&auth_challenge),
                black_box(&peer_challenge),
                b"User",
                "clientPass",
            )
        })
    });
}

criterion_group!(
    benches,
    bench_fragment_reassembly,
    bench_fragmentation,
    bench_avp_codec,
    bench_mschapv2
);
criterion_main!(benches);
