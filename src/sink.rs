use chrono::Local;
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;

/// How detection records are rendered on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFormat {
    /// One line per detection: the wake word label.
    Plain,
    /// One JSON object per detection.
    Json,
}

#[derive(Serialize)]
struct DetectionRecord<'a> {
    wake_word: &'a str,
    score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

/// Serialization point for all detectors. A single mutex orders the
/// records; no ordering is guaranteed between detectors beyond it.
pub struct DetectionSink {
    writer: Mutex<Box<dyn Write + Send>>,
    format: SinkFormat,
    timestamp: bool,
}

impl DetectionSink {
    pub fn stdout(format: SinkFormat, timestamp: bool) -> Self {
        Self::with_writer(Box::new(std::io::stdout()), format, timestamp)
    }

    pub fn with_writer(
        writer: Box<dyn Write + Send>,
        format: SinkFormat,
        timestamp: bool,
    ) -> Self {
        DetectionSink {
            writer: Mutex::new(writer),
            format,
            timestamp,
        }
    }

    /// Emit one detection record. Called exactly once per emission by the
    /// owning detector.
    pub fn emit(&self, label: &str, score: f32, frame_index: u64) {
        let mut writer = self.writer.lock().unwrap();
        let result = match self.format {
            SinkFormat::Plain => {
                if self.timestamp {
                    writeln!(writer, "{} {label}", Self::now())
                } else {
                    writeln!(writer, "{label}")
                }
            }
            SinkFormat::Json => {
                let record = DetectionRecord {
                    wake_word: label,
                    score,
                    timestamp: self.timestamp.then(Self::now),
                };
                match serde_json::to_string(&record) {
                    Ok(json) => writeln!(writer, "{json}"),
                    Err(e) => {
                        log::error!("failed to serialize detection: {e}");
                        return;
                    }
                }
            }
        };
        if let Err(e) = result.and_then(|()| writer.flush()) {
            log::error!("failed to write detection for {label}: {e}");
        }
        log::debug!("detection: {label} score {score:.3} frame {frame_index}");
    }

    /// Per-prediction debug line on stderr, serialized with the records.
    pub fn debug(&self, label: &str, probability: f32) {
        let _guard = self.writer.lock().unwrap();
        eprintln!("{label} {probability}");
    }

    fn now() -> String {
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }
}
