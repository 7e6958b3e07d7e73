//! Micro-benchmarks for the looping media source
//!
//! These benchmarks cover the per-sample hot path of every publisher:
//! - Pulling samples across clip boundaries at each video tier
//! - Opus sample pulls
//! - IVF header parsing and frame walking
//!
//! Run with: cargo bench --bench looping_source

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use loadtester::media::synth::{synthetic_audio_clip, synthetic_video_clip};
use loadtester::media::{ClipCursor, Codec, LoopingMediaSource, VideoQuality, VideoSpec};

fn bench_video_samples(c: &mut Criterion) {
    let mut group = c.benchmark_group("video_samples");

    // Short clip so every batch wraps several times
    for quality in [VideoQuality::Low, VideoQuality::Medium, VideoQuality::High] {
        let spec = VideoSpec::for_quality(quality);
        let clip = synthetic_video_clip(Codec::Vp8, &spec, 30);
        group.throughput(Throughput::Elements(100));

        group.bench_with_input(
            BenchmarkId::new("next_sample_x100", quality.as_str()),
            &clip,
            |b, clip| {
                let mut source = LoopingMediaSource::video(clip.clone(), &spec, Codec::Vp8);
                b.iter(|| {
                    for _ in 0..100 {
                        black_box(source.next_sample().ok());
                    }
                })
            },
        );
    }

    group.finish();
}

fn bench_audio_samples(c: &mut Criterion) {
    let clip = synthetic_audio_clip(32, 50);
    let mut source = LoopingMediaSource::audio(clip);

    c.bench_function("audio_next_sample", |b| {
        b.iter(|| black_box(source.next_sample().ok()))
    });
}

fn bench_clip_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("clip_walk");

    for frames in [30, 300] {
        let clip = synthetic_video_clip(
            Codec::Vp9,
            &VideoSpec::for_quality(VideoQuality::Medium),
            frames,
        );
        group.throughput(Throughput::Bytes(clip.len() as u64));

        group.bench_with_input(BenchmarkId::new("frames", frames), &clip, |b, clip| {
            b.iter(|| {
                let Ok((mut cursor, _)) = ClipCursor::open(black_box(clip)) else {
                    return 0;
                };
                let mut count = 0;
                while let Ok(Some(frame)) = cursor.next_frame() {
                    count += frame.payload.len();
                }
                count
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_video_samples,
    bench_audio_samples,
    bench_clip_walk,
);
criterion_main!(benches);
