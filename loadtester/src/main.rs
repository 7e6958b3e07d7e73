use clap::Parser;
use loadtester::config::{
    CoupledInput, LoadTestParams, MediaParams, PublisherMode, RampParams, RuntimeConfig,
    SpeakerParams, UNSET, parse_codec, parse_quality,
};
use loadtester::loadtest::{LoadTest, LoadTestError, RunResult, run_suite};
use loadtester::media::{ClipLibrary, Codec, VideoQuality};
use loadtester::session::{LoopbackConnector, LoopbackOptions};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "loadtester",
    about = "Synthetic load generator for real-time media rooms",
    version
)]
struct Args {
    /// Number of rooms; each gets the full set of testers
    #[arg(long, env = "LOADTEST_ROOM_COUNT", default_value_t = 1)]
    room_count: usize,

    /// Room name, or prefix when running more than one room
    #[arg(long, env = "LOADTEST_ROOM", default_value = "load-test")]
    room: String,

    /// Run duration (e.g. 90, 30s, 5m); runs until interrupted when unset
    #[arg(long, env = "LOADTEST_DURATION", value_parser = parse_duration)]
    duration: Option<Duration>,

    /// Testers publishing video per room
    #[arg(long, alias = "publishers", env = "LOADTEST_VIDEO_PUBLISHERS", default_value_t = 0)]
    video_publishers: usize,

    /// Testers publishing audio per room
    #[arg(long, env = "LOADTEST_AUDIO_PUBLISHERS", default_value_t = 0)]
    audio_publishers: usize,

    /// Subscribing testers per room
    #[arg(long, env = "LOADTEST_SUBSCRIBERS", default_value_t = 0)]
    subscribers: usize,

    /// Identity prefix; random when unset
    #[arg(long, env = "LOADTEST_IDENTITY_PREFIX")]
    identity_prefix: Option<String>,

    /// Highest video tier published (low, medium, high)
    #[arg(long, default_value = "high", value_parser = parse_quality)]
    video_resolution: VideoQuality,

    /// Video codec (vp8, vp9); publishers alternate when unset
    #[arg(long, value_parser = parse_codec)]
    video_codec: Option<Codec>,

    /// Testers started per second
    #[arg(long, default_value_t = 5.0)]
    num_per_second: f64,

    /// Layout to simulate: speaker, 3x3, 4x4, 5x5
    #[arg(long, default_value = "speaker")]
    layout: String,

    /// Publish only the top video tier
    #[arg(long)]
    no_simulcast: bool,

    /// Fire random speaker changes
    #[arg(long)]
    simulate_speakers: bool,

    /// Speaker change interval; defaults to the layout's
    #[arg(long, value_parser = parse_duration)]
    speaker_interval: Option<Duration>,

    /// Random spread of the speaker interval, as a fraction of it
    #[arg(long, default_value_t = 0.25)]
    speaker_jitter: f64,

    /// Audio bitrate in kbps
    #[arg(long, default_value_t = 32)]
    audio_bitrate: u32,

    /// Run the preset scenario suite
    #[arg(long)]
    run_all: bool,

    /// Derive a fixed 3 video / 2 audio publisher split from the coupled parameters
    #[arg(long)]
    coupled: bool,

    #[arg(long, default_value_t = UNSET, allow_hyphen_values = true)]
    coupled_web_width: i64,

    #[arg(long, default_value_t = UNSET, allow_hyphen_values = true)]
    coupled_web_height: i64,

    /// Camera bitrate in kbps
    #[arg(long, default_value_t = UNSET, allow_hyphen_values = true)]
    coupled_web_bitrate: i64,

    #[arg(long, default_value_t = UNSET, allow_hyphen_values = true)]
    coupled_screen_width: i64,

    #[arg(long, default_value_t = UNSET, allow_hyphen_values = true)]
    coupled_screen_height: i64,

    /// Screen share bitrate in kbps
    #[arg(long, default_value_t = UNSET, allow_hyphen_values = true)]
    coupled_screen_bitrate: i64,

    /// Audio bitrate in kbps for coupled mode
    #[arg(long, default_value_t = UNSET, allow_hyphen_values = true)]
    coupled_audio_bitrate: i64,

    /// Directory with recorded IVF clips (<codec>_<quality>.ivf, opus.ivf)
    #[arg(long, env = "LOADTEST_CLIP_DIR")]
    clip_dir: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn coupled_input(&self) -> CoupledInput {
        CoupledInput {
            web_width: self.coupled_web_width,
            web_height: self.coupled_web_height,
            web_bitrate_kbps: self.coupled_web_bitrate,
            screen_width: self.coupled_screen_width,
            screen_height: self.coupled_screen_height,
            screen_bitrate_kbps: self.coupled_screen_bitrate,
            audio_bitrate_kbps: self.coupled_audio_bitrate,
        }
    }

    fn to_params(&self) -> LoadTestParams {
        let coupled = self.coupled_input();
        let publishers = if self.coupled || coupled.any_set() {
            PublisherMode::Coupled(coupled)
        } else {
            PublisherMode::Independent {
                video: self.video_publishers,
                audio: self.audio_publishers,
            }
        };

        LoadTestParams {
            room: self.room.clone(),
            room_count: self.room_count,
            duration: self.duration.unwrap_or(Duration::ZERO),
            publishers,
            subscribers: self.subscribers,
            identity_prefix: self.identity_prefix.clone(),
            layout: self.layout.clone(),
            media: MediaParams {
                video_resolution: self.video_resolution,
                video_codec: self.video_codec,
                simulcast: !self.no_simulcast,
                audio_bitrate_kbps: self.audio_bitrate,
                clip_dir: self.clip_dir.clone(),
            },
            ramp: RampParams {
                num_per_second: self.num_per_second,
            },
            speakers: SpeakerParams {
                enabled: self.simulate_speakers,
                interval: self.speaker_interval,
                jitter: self.speaker_jitter,
            },
        }
    }
}

/// Parse `90`, `90s`, `500ms`, `5m` or `1h`
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {value}"))?;
    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(number)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        other => return Err(format!("unknown duration unit: {other}")),
    };
    number
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration out of range: {value}"))
}

fn print_results(results: &[RunResult], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
    } else {
        for result in results {
            println!("\n{}", result);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let default_filter = if args.verbose {
        "loadtester=debug"
    } else {
        "loadtester=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = RuntimeConfig::from_env();
    if let Some(addr) = runtime.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus metrics listening on {}", addr);
    }

    let params = args.to_params();
    let connector = Arc::new(LoopbackConnector::new(
        LoopbackOptions::default()
            .with_connect_latency(runtime.connect_latency)
            .with_failure_rate(runtime.failure_rate),
    ));
    info!(
        "Using loopback router (connect latency {:?}, failure rate {})",
        runtime.connect_latency, runtime.failure_rate
    );
    let mut load_test = LoadTest::new(connector).with_shutdown_grace(runtime.shutdown_grace);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping testers");
            interrupt.cancel();
        }
    });

    if args.run_all {
        let clips = ClipLibrary::load(
            params.media.clip_dir.as_deref(),
            params.media.audio_bitrate_kbps,
        )?;
        load_test = load_test.with_clips(Arc::new(clips));

        match run_suite(&load_test, &params, &cancel).await {
            Ok(results) => print_results(&results, args.json)?,
            Err(LoadTestError::SuiteAborted {
                scenario,
                completed,
                source,
            }) => {
                print_results(&completed, args.json)?;
                error!("Suite aborted at scenario {}", scenario);
                return Err(anyhow::anyhow!("scenario {} failed: {}", scenario, source));
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        let result = load_test.run(&params, &cancel).await?;
        print_results(std::slice::from_ref(&result), args.json)?;
    }

    Ok(())
}
