pub mod audio;
pub mod config;
pub mod detector;
pub mod embedding;
pub mod error;
pub mod mel;
pub mod model;
pub mod pipeline;
pub mod preprocessing;
pub mod queue;
pub mod ring;
pub mod sink;
pub mod source;
pub mod vad;

// Critical constants - must match the openWakeWord models exactly
pub const SAMPLE_RATE: u32 = 16000;
pub const CHUNK_SAMPLES: usize = 1280; // 80ms at 16kHz
pub const NUM_MELS: usize = 32;
pub const EMBEDDING_WINDOW: usize = 76; // mel rows per embedding window (775ms)
pub const EMBEDDING_STEP: usize = 8; // mel rows per window slide (80ms)
pub const EMBEDDING_FEATURES: usize = 96;
pub const WAKEWORD_FEATURES: usize = 16;

// VAD constants
pub const VAD_CHUNK_SIZE: usize = 480; // 30ms at 16kHz
pub const VAD_HIDDEN_DIM: usize = 64;

pub const DEFAULT_STEP_FRAMES: usize = 4;

pub use config::{Config, OutputMode, WakeWordConfig};
pub use error::{Error, Result};
pub use pipeline::Pipeline;
