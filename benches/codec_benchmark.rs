use chrono::Utc;
use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

use vibe_link::codec::{self, WireFormat};
use vibe_link::{
    AnalyzerConfig, CompatibilityAnalyzer, PersonalityProfile,
    PrivacyAnonymizer, PrivacyConfig,
};

fn codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    let anonymizer = PrivacyAnonymizer::new(PrivacyConfig::default()).unwrap();
    let profile = PersonalityProfile::uniform("bench", 0.5);
    let now = Utc::now();
    let fingerprint = anonymizer.derive(&profile, now).unwrap();

    group.bench_function("derive", |b| {
        b.iter(|| anonymizer.derive(black_box(&profile), now).unwrap());
    });

    for format in [
        WireFormat::Compact,
        WireFormat::TextSafe,
        WireFormat::Structured,
    ] {
        let payload = codec::encode(&fingerprint, format);
        group.bench_with_input(
            BenchmarkId::new("encode", format.as_str()),
            &fingerprint,
            |b, fp| b.iter(|| codec::encode(black_box(fp), format)),
        );
        group.bench_with_input(
            BenchmarkId::new("decode", format.as_str()),
            &payload,
            |b, payload| {
                b.iter(|| codec::decode(black_box(payload), format, now).unwrap())
            },
        );
    }

    let other = anonymizer
        .derive(&PersonalityProfile::uniform("other", 0.7), now)
        .unwrap();
    let analyzer = CompatibilityAnalyzer::new(AnalyzerConfig::default());
    group.bench_function("score", |b| {
        b.iter(|| analyzer.score(black_box(&fingerprint), black_box(&other)));
    });

    group.finish();
}

criterion_group!(benches, codec_benchmark);
criterion_main!(benches);
