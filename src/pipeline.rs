use log::{debug, info};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::audio::convert_to_float;
use crate::config::Config;
use crate::detector::{ActivationState, DetectorStage};
use crate::embedding::EmbeddingStage;
use crate::error::{Error, Result};
use crate::mel::MelStage;
use crate::model::{Model, OnnxModel};
use crate::preprocessing::{NoiseSuppressor, Preprocessor};
use crate::queue::SampleQueue;
use crate::sink::{DetectionSink, SinkFormat};
use crate::vad::VoiceActivityDetector;
use crate::{EMBEDDING_FEATURES, EMBEDDING_WINDOW, NUM_MELS, SAMPLE_RATE};

/// Start-up barrier: every stage signals once after entering its loop.
struct ReadySignal {
    count: Mutex<usize>,
    cv: Condvar,
}

impl ReadySignal {
    fn new() -> Self {
        ReadySignal {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_all();
    }

    fn wait(&self, expected: usize) {
        let mut count = self.count.lock().unwrap();
        while *count < expected {
            count = self.cv.wait(count).unwrap();
        }
    }
}

/// Owns the stage threads and the queues between them.
///
/// Shutdown flows top-down only: exhausting the audio queue lets every
/// stage drain, exhaust its own outputs, and exit; threads are then
/// joined in topological order.
pub struct Pipeline {
    frame_size: usize,
    audio_queue: Arc<SampleQueue>,
    mel_queue: Arc<SampleQueue>,
    feature_queues: Vec<Arc<SampleQueue>>,
    sink: Arc<DetectionSink>,
    ready: Arc<ReadySignal>,
    expected_ready: usize,
    preprocessors: Vec<Box<dyn Preprocessor>>,

    mel_stage: Option<MelStage>,
    embedding_stage: Option<EmbeddingStage>,
    detector_stages: Vec<DetectorStage>,

    handles: Vec<(String, JoinHandle<Result<()>>)>,
    running: bool,
    convert_buf: Vec<f32>,
}

impl Pipeline {
    /// Load every model and assemble the stages. Any load failure is
    /// fatal; no thread has been spawned yet.
    pub fn new(config: &Config) -> Result<Self> {
        let mel_model = OnnxModel::load_boxed(&config.melspectrogram_model)?;
        info!("loaded mel spectrogram model");
        let embedding_model = OnnxModel::load_boxed(&config.embedding_model)?;
        info!("loaded speech embedding model");

        let mut detectors = Vec::new();
        for word in config.wake_word_configs() {
            let model = OnnxModel::load_boxed(&word.model_path)?;
            info!("loaded wake word model: {}", word.label);
            detectors.push((word, model));
        }

        let format = if config.output_mode == crate::OutputMode::Json {
            SinkFormat::Json
        } else {
            SinkFormat::Plain
        };
        let sink = DetectionSink::stdout(format, config.show_timestamp);

        let mut pipeline =
            Self::from_parts(config.frame_size(), mel_model, embedding_model, detectors, sink);

        if config.enable_noise_suppression {
            pipeline.add_preprocessor(Box::new(NoiseSuppressor::voice_band(SAMPLE_RATE as f32)));
            info!("noise suppression enabled");
        }
        if config.enable_vad {
            let vad = VoiceActivityDetector::new(&config.vad_model, config.vad_threshold)?;
            pipeline.add_preprocessor(Box::new(vad));
            info!("voice activity detection enabled (advisory)");
        }
        debug!(
            "SIMD audio conversion: {}",
            if crate::audio::simd_enabled() {
                "enabled"
            } else {
                "disabled"
            }
        );

        Ok(pipeline)
    }

    /// Assemble a pipeline from already-built models. Tests use this to
    /// wire in mocks; [`Pipeline::new`] uses it with ONNX sessions.
    pub fn from_parts(
        frame_size: usize,
        mel_model: Box<dyn Model>,
        embedding_model: Box<dyn Model>,
        detectors: Vec<(crate::WakeWordConfig, Box<dyn Model>)>,
        sink: DetectionSink,
    ) -> Self {
        let audio_queue = Arc::new(SampleQueue::new(16 * frame_size));
        let mel_queue = Arc::new(SampleQueue::new(16 * EMBEDDING_WINDOW * NUM_MELS));
        let feature_queues: Vec<Arc<SampleQueue>> = detectors
            .iter()
            .map(|_| Arc::new(SampleQueue::new(64 * EMBEDDING_FEATURES)))
            .collect();

        let detector_stages: Vec<DetectorStage> = detectors
            .into_iter()
            .map(|(word, model)| {
                DetectorStage::new(
                    word.label,
                    model,
                    ActivationState::new(word.threshold, word.trigger_level, word.refractory_steps),
                    word.debug,
                )
            })
            .collect();
        let expected_ready = 2 + detector_stages.len();

        Pipeline {
            frame_size,
            audio_queue,
            mel_queue,
            feature_queues,
            sink: Arc::new(sink),
            ready: Arc::new(ReadySignal::new()),
            expected_ready,
            preprocessors: Vec::new(),
            mel_stage: Some(MelStage::new(mel_model, frame_size)),
            embedding_stage: Some(EmbeddingStage::new(embedding_model)),
            detector_stages,
            handles: Vec::new(),
            running: false,
            convert_buf: Vec::new(),
        }
    }

    pub fn add_preprocessor(&mut self, preprocessor: Box<dyn Preprocessor>) {
        self.preprocessors.push(preprocessor);
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Spawn one thread per stage and one per detector.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;

        let mel_stage = self.mel_stage.take().expect("pipeline already started");
        let embedding_stage = self.embedding_stage.take().expect("pipeline already started");

        {
            let ready = Arc::clone(&self.ready);
            let input = Arc::clone(&self.audio_queue);
            let output = Arc::clone(&self.mel_queue);
            self.spawn("mel", move || {
                ready.signal();
                mel_stage.run(&input, &output)
            });
        }
        {
            let ready = Arc::clone(&self.ready);
            let input = Arc::clone(&self.mel_queue);
            let outputs = self.feature_queues.clone();
            self.spawn("embedding", move || {
                ready.signal();
                embedding_stage.run(&input, &outputs)
            });
        }
        for (i, stage) in std::mem::take(&mut self.detector_stages).into_iter().enumerate() {
            let ready = Arc::clone(&self.ready);
            let input = Arc::clone(&self.feature_queues[i]);
            let sink = Arc::clone(&self.sink);
            self.spawn(&format!("detector-{i}"), move || {
                ready.signal();
                stage.run(&input, &sink)
            });
        }
    }

    fn spawn<F>(&mut self, name: &str, body: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .expect("failed to spawn stage thread");
        self.handles.push((name.to_string(), handle));
    }

    /// Block until all `2 + n_detectors` stages have entered their loops.
    pub fn wait_until_ready(&self) {
        self.ready.wait(self.expected_ready);
        info!("pipeline ready");
    }

    /// Convert one batch of samples, run the preprocessors, and push it
    /// into the head queue. Blocks under backpressure. Returns `false`
    /// once the pipeline is shutting down.
    pub fn process_audio(&mut self, samples: &[i16]) -> bool {
        if !self.running {
            return false;
        }
        convert_to_float(samples, &mut self.convert_buf);
        for preprocessor in &mut self.preprocessors {
            preprocessor.process(&mut self.convert_buf);
        }
        self.audio_queue.push_slice(&self.convert_buf)
    }

    /// Exhaust the head queue and join every stage in topological order.
    /// Returns the first stage failure, if any. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running && self.handles.is_empty() {
            return Ok(());
        }
        self.running = false;
        self.audio_queue.set_exhausted();

        let mut failure: Option<Error> = None;
        for (index, (name, handle)) in std::mem::take(&mut self.handles).into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => debug!("stage '{name}' exited cleanly"),
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(_) => {
                    if failure.is_none() {
                        failure = Some(Error::Inference {
                            stage: "pipeline",
                            message: format!("stage '{name}' panicked"),
                        });
                    }
                }
            }
            // A dead stage can no longer exhaust its outputs; do it for
            // it so downstream joins cannot deadlock.
            match index {
                0 => self.mel_queue.set_exhausted(),
                1 => {
                    for queue in &self.feature_queues {
                        queue.set_exhausted();
                    }
                }
                _ => {}
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
