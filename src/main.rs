use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use oww_stream::source::{open_input, AudioSource};
use oww_stream::{audio, config, Config, OutputMode, Pipeline};

#[derive(Parser)]
#[command(name = "oww-stream")]
#[command(version, about = "Streaming wake word detection over 16 kHz PCM audio")]
struct Args {
    /// Path to a wake word classifier model (repeat for multiple words)
    #[arg(short = 'm', long = "model", value_name = "FILE")]
    models: Vec<PathBuf>,

    /// Activation threshold, 0-1 [default: 0.5]
    #[arg(short, long, value_name = "NUM")]
    threshold: Option<f32>,

    /// Consecutive activations before a detection is emitted [default: 4]
    #[arg(short = 'l', long, value_name = "NUM")]
    trigger_level: Option<u32>,

    /// Predictions to wait after a detection before re-arming [default: 20]
    #[arg(short = 'r', long, value_name = "NUM")]
    refractory: Option<u32>,

    /// Number of 80 ms audio chunks consumed per mel inference [default: 4]
    #[arg(long, value_name = "NUM")]
    step_frames: Option<usize>,

    /// Path to the melspectrogram model [default: models/melspectrogram.onnx]
    #[arg(long, value_name = "FILE")]
    melspectrogram_model: Option<PathBuf>,

    /// Path to the speech embedding model [default: models/embedding_model.onnx]
    #[arg(long, value_name = "FILE")]
    embedding_model: Option<PathBuf>,

    /// Enable VAD with this model [default path: models/silero_vad.onnx]
    #[arg(long, value_name = "FILE")]
    vad_model: Option<PathBuf>,

    /// Enable VAD with this speech threshold, 0-1
    #[arg(long, value_name = "NUM")]
    vad_threshold: Option<f32>,

    /// Enable band-pass noise suppression ahead of the pipeline
    #[arg(long)]
    enable_noise_suppression: bool,

    /// Only emit detections; suppress log output
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose logging on stderr
    #[arg(long)]
    verbose: bool,

    /// Emit detections as JSON records
    #[arg(long)]
    json: bool,

    /// Prefix detections with a wall-clock timestamp
    #[arg(long)]
    timestamp: bool,

    /// Print every model probability to stderr
    #[arg(long)]
    debug: bool,

    /// List models in the models directory and exit
    #[arg(long)]
    list_models: bool,

    /// JSON configuration file overlaying the defaults
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Capture from the default input device instead of reading stdin
    #[arg(long)]
    mic: bool,

    /// Input file: WAV (by extension) or raw s16le PCM; stdin if omitted
    input: Option<PathBuf>,
}

impl Args {
    /// CLI flags win over the config file, which wins over defaults.
    fn into_config(self) -> Result<(Config, Option<PathBuf>, bool)> {
        let mut config = match &self.config {
            Some(path) => Config::load_file(path)?,
            None => Config::default(),
        };

        if !self.models.is_empty() {
            config.wake_word_models = self.models;
        }
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        if let Some(trigger_level) = self.trigger_level {
            config.trigger_level = trigger_level;
        }
        if let Some(refractory) = self.refractory {
            config.refractory_steps = refractory;
        }
        if let Some(step_frames) = self.step_frames {
            config.step_frames = step_frames;
        }
        if let Some(path) = self.melspectrogram_model {
            config.melspectrogram_model = path;
        }
        if let Some(path) = self.embedding_model {
            config.embedding_model = path;
        }
        if let Some(path) = self.vad_model {
            config.vad_model = path;
            config.enable_vad = true;
        }
        if let Some(vad_threshold) = self.vad_threshold {
            config.vad_threshold = vad_threshold;
            config.enable_vad = true;
        }
        if self.enable_noise_suppression {
            config.enable_noise_suppression = true;
        }
        if self.debug {
            config.debug = true;
        }
        if self.json {
            config.output_mode = OutputMode::Json;
        } else if self.quiet {
            config.output_mode = OutputMode::Quiet;
        } else if self.verbose {
            config.output_mode = OutputMode::Verbose;
        }
        if self.timestamp {
            config.show_timestamp = true;
        }

        Ok((config, self.input, self.mic))
    }
}

fn main() {
    let args = Args::parse();

    let default_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    if let Err(e) = run(args) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if args.list_models {
        return config::list_models(&PathBuf::from("models")).map_err(Into::into);
    }

    let (config, input, mic) = args.into_config()?;
    config.validate()?;

    let mut pipeline = Pipeline::new(&config)?;
    let frame_size = pipeline.frame_size();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("failed to install signal handler")?;
    }

    pipeline.start();
    pipeline.wait_until_ready();

    let mut source: Box<dyn AudioSource> = if mic {
        info!("listening on the default input device");
        Box::new(audio::MicSource::new(frame_size)?)
    } else {
        open_input(input.as_deref())?
    };

    let mut samples = vec![0i16; frame_size];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("shutting down");
            break;
        }
        let read = match source.read_samples(&mut samples) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                // Anything but EOF on the source is treated as end of
                // stream: drain the pipeline and exit cleanly.
                warn!("audio source error, draining: {e}");
                break;
            }
        };
        if !pipeline.process_audio(&samples[..read]) {
            break;
        }
    }

    pipeline.stop()?;
    Ok(())
}
