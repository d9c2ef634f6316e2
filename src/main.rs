use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Arg, ArgAction, Command, value_parser};
use kvsink::config::{SinkConfig, app_name, version};
use kvsink::credentials::{
    CredentialProvider, Credentials, EnvCredentialProvider, StaticCredentialProvider, process_env, resolve_provider,
    resolve_region,
};
use kvsink::pipeline::collector::{FragmentMetadata, SourceItem};
use kvsink::pipeline::{LoopbackBackend, MediaFrame, MediaKind, SessionController, SessionEvent, Timestamp, events};
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const AUDIO_FRAME_MS: u64 = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON session configuration, defaults are used when omitted.")
                .required(false),
        )
        .arg(
            Arg::new("frames")
                .short('n')
                .long("frames")
                .value_name("COUNT")
                .help("Number of synthetic video frames to send.")
                .value_parser(value_parser!(u64))
                .default_value("250"),
        )
        .arg(
            Arg::new("no-audio")
                .long("no-audio")
                .help("Only send a video track.")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => SinkConfig::from_json_file(path)?,
        None => SinkConfig::default(),
    };
    let env = process_env();
    config.aws_region = resolve_region(&config, &env);

    let frames = matches.get_one::<u64>("frames").copied().unwrap_or(250);
    let with_audio = !matches.get_flag("no-audio");

    let credentials: Arc<dyn CredentialProvider> =
        if config.has_explicit_credentials() || EnvCredentialProvider::is_available(&env) {
            resolve_provider(&config, &env, None)?
        } else {
            // the loopback backend does not check keys
            warn!("kvsink: no credentials configured, using loopback credentials");
            Arc::new(StaticCredentialProvider::new(
                Credentials {
                    access_key: "loopback".into(),
                    secret_key: "loopback".into(),
                    session_token: None,
                    expiration: None,
                },
                config.rotation_period(),
            ))
        };

    let framerate = u64::from(config.framerate.max(1));
    let (event_sink, mut event_rx) = events::channel(64);
    let backend = LoopbackBackend::new();
    let mut controller = SessionController::new(config, credentials, Arc::new(backend.clone()), event_sink)?;

    let (video_tx, video_rx) = mpsc::channel(32);
    controller.add_track(MediaKind::Video, Box::new(video_rx))?;
    let audio_tx = if with_audio {
        let (tx, rx) = mpsc::channel(32);
        controller.add_track(MediaKind::Audio, Box::new(rx))?;
        Some(tx)
    } else {
        None
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            cancel.cancel();
        })?;
    }

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                SessionEvent::Error { .. } | SessionEvent::ConnectionFailed { .. } => error!("kvsink: {:?}", event),
                SessionEvent::Stopped { summary } => info!("kvsink: stopped, {}", summary),
                other => info!("kvsink: {:?}", other),
            }
        }
    });

    let frame_duration = Duration::from_millis(1000 / framerate);
    tokio::spawn(produce_video(video_tx, frames, framerate, frame_duration));
    if let Some(tx) = audio_tx {
        tokio::spawn(produce_audio(tx, frame_duration * frames as u32));
    }

    let summary = controller.run(cancel).await?;
    info!(
        "kvsink: {} frames delivered to {} stream(s). {}",
        backend.frames().len(),
        backend.streams_created(),
        summary
    );
    Ok(())
}

/// Synthetic H.264 track: codec data, a stream tag, then one key frame per second
async fn produce_video(tx: mpsc::Sender<SourceItem>, frames: u64, framerate: u64, frame_duration: Duration) {
    let sps = Bytes::from_static(&[0x01, 0x64, 0x00, 0x28, 0xff, 0xe1]);
    if tx.send(SourceItem::CodecData(sps)).await.is_err() {
        return;
    }
    let tag = FragmentMetadata {
        name: "source".into(),
        value: "synthetic".into(),
        persistent: true,
    };
    if tx.send(SourceItem::Metadata(tag)).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(frame_duration);
    for i in 0..frames {
        ticker.tick().await;
        let ts = Timestamp::from_duration(frame_duration * i as u32);
        let frame = MediaFrame::video(Bytes::from(vec![0u8; 4096]), ts, ts, i % framerate == 0);
        if tx.send(SourceItem::Frame(frame)).await.is_err() {
            return;
        }
    }
}

async fn produce_audio(tx: mpsc::Sender<SourceItem>, length: Duration) {
    let asc = Bytes::from_static(&[0x12, 0x10]);
    if tx.send(SourceItem::CodecData(asc)).await.is_err() {
        return;
    }

    let frame_duration = Duration::from_millis(AUDIO_FRAME_MS);
    let mut ticker = tokio::time::interval(frame_duration);
    let mut elapsed = Duration::ZERO;
    while elapsed < length {
        ticker.tick().await;
        let frame = MediaFrame::audio(Bytes::from(vec![0u8; 256]), Timestamp::from_duration(elapsed));
        if tx.send(SourceItem::Frame(frame)).await.is_err() {
            return;
        }
        elapsed += frame_duration;
    }
}
