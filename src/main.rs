/// Voice-trigger service binary
///
/// Long-running service: listens for the wake word, then for a command,
/// and logs every event. Exits non-zero on a fatal fault so the supervisor
/// can restart it. `--list-devices` prints the capture devices and exits.

use anyhow::Context;
use std::str::FromStr;
use tracing::{error, info, warn};
use voice_trigger::{
    input_devices, AudioHandle, AudioSource, BufferedEngine, BurstRecognizerFactory,
    BurstTranscriber, ChannelSink, CpalDevice, EnergySpotter, LogSink, ModelHandle, ModelSet,
    Pipeline, PipelineConfig, PipelineEvent, PipelineReport, PhraseRecognizerFactory,
    RecognizerFactory, WavFileDevice,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voice_trigger=debug".parse().unwrap())
        )
        .init();

    if std::env::args().skip(1).any(|arg| arg == "--list-devices") {
        if let Err(e) = list_devices() {
            error!("Failed to list input devices: {}", e);
            std::process::exit(1);
        }
        return;
    }

    info!("Starting voice-trigger service");

    let config = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let models = match ModelSet::load(&config.models_dir) {
        Ok(models) => models,
        Err(e) => {
            error!("Failed to load models: {}", e);
            std::process::exit(1);
        }
    };

    let wake_model = match models.require(&config.wake_model_prefix, None) {
        Ok(model) => model,
        Err(e) => {
            error!("Wake model unavailable: {}", e);
            std::process::exit(1);
        }
    };
    info!("Wake model: {}", wake_model.name());

    // Owns the capture stream, so it must outlive the pipeline
    let mut microphone = match std::env::var("VOICE_TRIGGER_DEVICE") {
        Ok(name) => CpalDevice::named(name),
        Err(_) => CpalDevice::new(),
    };

    let format = config.stream_format();
    let (read_timeout, retry) = (config.read_timeout(), config.retry_policy());
    let result = match std::env::var("VOICE_TRIGGER_WAV") {
        Ok(path) => {
            let mut device = WavFileDevice::new(&path).paced(1.0);
            match AudioSource::open(&mut device, &format, read_timeout, retry) {
                Ok(source) => serve(config, source, models, wake_model).await,
                Err(e) => Err(anyhow::Error::new(e).context(format!("cannot open {}", path))),
            }
        }
        Err(_) => match AudioSource::open(&mut microphone, &format, read_timeout, retry) {
            Ok(source) => serve(config, source, models, wake_model).await,
            Err(e) => Err(anyhow::Error::new(e).context("cannot open microphone")),
        },
    };

    match result {
        Ok(report) => info!(
            "Voice-trigger service stopped ({} frames, final state {:?})",
            report.frames_fed, report.final_state
        ),
        Err(e) => {
            error!("Voice-trigger service failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    let devices = input_devices()?;
    if devices.is_empty() {
        println!("No input devices found");
        return Ok(());
    }
    println!("Input devices:");
    for (i, device) in devices.iter().enumerate() {
        println!(
            "[{}] {} | rate={} | channels={}",
            i, device.name, device.default_sample_rate, device.max_channels
        );
    }
    Ok(())
}

/// Pick the command recognizer from the config and run the pipeline
async fn serve<H: AudioHandle + 'static>(
    config: PipelineConfig,
    source: AudioSource<H>,
    models: ModelSet,
    wake_model: ModelHandle,
) -> anyhow::Result<PipelineReport> {
    match config.phrase_table() {
        Some(table) => {
            let vad = config.vad.clone();
            let factory =
                PhraseRecognizerFactory::new(table, move || BurstTranscriber::new(vad.clone()));
            run_pipeline(config, source, models, wake_model, factory).await
        }
        None => {
            let factory = BurstRecognizerFactory::new(config.vad.clone());
            run_pipeline(config, source, models, wake_model, factory).await
        }
    }
}

/// Build the pipeline over `source` and run it until it stops
async fn run_pipeline<H, F>(
    config: PipelineConfig,
    source: AudioSource<H>,
    models: ModelSet,
    wake_model: ModelHandle,
    factory: F,
) -> anyhow::Result<PipelineReport>
where
    H: AudioHandle + 'static,
    F: RecognizerFactory + 'static,
    F::Recognizer: 'static,
{
    let spotter = EnergySpotter::new(config.channels, config.vad.clone())
        .with_indices(wake_model.index(), 0);
    let engine = BufferedEngine::new(
        spotter,
        factory,
        config.chunk_size,
        config.channels,
        config.frame_pool_slots,
        config.vad.clone(),
    );

    let (sink, mut events) = ChannelSink::new();
    let pipeline = Pipeline::new(&config, source, engine, &models, sink)?;
    let stop = pipeline.stop_token();
    let stop_on_silence = config.silence.enabled && config.silence.stop_on_timeout;

    let mut worker = tokio::task::spawn_blocking(move || pipeline.run());
    info!("Listening for the wake word...");

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                event.deliver(&mut LogSink);
                if stop_on_silence && matches!(event, PipelineEvent::SilenceTimeout { .. }) {
                    warn!("Stopping after prolonged silence");
                    stop.stop();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                stop.stop();
            }
            joined = &mut worker => {
                while let Ok(event) = events.try_recv() {
                    event.deliver(&mut LogSink);
                }
                let report = joined.context("pipeline task panicked")??;
                return Ok(report);
            }
        }
    }
}

/// Load configuration from the config file, then apply environment overrides
fn load_config() -> anyhow::Result<PipelineConfig> {
    let mut config = match std::env::var("VOICE_TRIGGER_CONFIG") {
        Ok(path) => PipelineConfig::from_file(&path)?,
        Err(_) => PipelineConfig::default(),
    };

    if let Some(channels) = env_override("VOICE_TRIGGER_CHANNELS")? {
        config.channels = channels;
    }
    if let Some(chunk_size) = env_override("VOICE_TRIGGER_CHUNK_SIZE")? {
        config.chunk_size = chunk_size;
    }
    if let Some(cycles) = env_override("VOICE_TRIGGER_COMMAND_TIMEOUT_CYCLES")? {
        config.command_timeout_cycles = cycles;
    }
    if let Some(cycles) = env_override("VOICE_TRIGGER_VERIFY_TIMEOUT_CYCLES")? {
        config.verify_timeout_cycles = cycles;
    }
    if let Some(threshold) = env_override("VOICE_TRIGGER_ENERGY_THRESHOLD")? {
        config.vad.energy_threshold = threshold;
    }
    if let Some(threshold) = env_override("VOICE_TRIGGER_MATCH_THRESHOLD")? {
        config.match_threshold = threshold;
    }
    if let Some(secs) = env_override("VOICE_TRIGGER_MIN_SILENCE_SECS")? {
        config.silence.enabled = true;
        config.silence.min_silence_secs = secs;
    }
    if let Some(secs) = env_override("VOICE_TRIGGER_SILENCE_GRACE_SECS")? {
        config.silence.grace_secs = secs;
    }
    if let Ok(dir) = std::env::var("VOICE_TRIGGER_MODELS_DIR") {
        config.models_dir = dir.into();
    }
    if let Ok(keyword) = std::env::var("VOICE_TRIGGER_COMMAND_KEYWORD") {
        config.command_model_keyword = Some(keyword);
    }

    config.validate()?;
    Ok(config)
}

fn env_override<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {}: '{}'", key, raw)),
        Err(_) => Ok(None),
    }
}
