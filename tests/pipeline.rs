//! End-to-end pipeline scenarios with mock models standing in for the
//! ONNX sessions.

use ndarray::ArrayD;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use oww_stream::mel::MelStage;
use oww_stream::model::Model;
use oww_stream::queue::SampleQueue;
use oww_stream::sink::{DetectionSink, SinkFormat};
use oww_stream::{
    Pipeline, Result, WakeWordConfig, EMBEDDING_FEATURES, EMBEDDING_WINDOW, NUM_MELS,
};

const FRAME_SIZE: usize = 5120; // four 80 ms chunks
const ROWS_PER_FRAME: usize = 20; // mel rows the reference model yields per frame

/// Mel mock: fixed number of rows per frame, counts inferences.
struct FakeMel {
    calls: Arc<AtomicUsize>,
}

impl Model for FakeMel {
    fn infer(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        assert_eq!(input.shape(), &[1, FRAME_SIZE]);
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(ArrayD::zeros(ndarray::IxDyn(&[1, ROWS_PER_FRAME, NUM_MELS])))
    }
}

/// Embedding mock: one 96-float vector per window, counts inferences.
struct FakeEmbedding {
    calls: Arc<AtomicUsize>,
}

impl Model for FakeEmbedding {
    fn infer(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        assert_eq!(input.shape(), &[1, EMBEDDING_WINDOW, NUM_MELS, 1]);
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(ArrayD::zeros(ndarray::IxDyn(&[1, EMBEDDING_FEATURES])))
    }
}

/// Classifier mock: replays a probability script, then holds the final
/// value (default 0.0).
struct ScriptedClassifier {
    script: Vec<f32>,
    calls: Arc<AtomicUsize>,
}

impl Model for ScriptedClassifier {
    fn infer(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        assert_eq!(input.shape(), &[1, 16, EMBEDDING_FEATURES]);
        let index = self.calls.fetch_add(1, Ordering::Relaxed);
        let probability = self.script.get(index).copied().unwrap_or(0.0);
        Ok(ArrayD::from_elem(ndarray::IxDyn(&[1, 1]), probability))
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn word(label: &str, trigger_level: u32, refractory_steps: u32) -> WakeWordConfig {
    WakeWordConfig {
        model_path: PathBuf::from("unused.onnx"),
        label: label.to_string(),
        threshold: 0.5,
        trigger_level,
        refractory_steps,
        debug: false,
    }
}

struct Harness {
    pipeline: Pipeline,
    output: SharedBuf,
    mel_calls: Arc<AtomicUsize>,
    embedding_calls: Arc<AtomicUsize>,
    classifier_calls: Vec<Arc<AtomicUsize>>,
}

/// Wire a pipeline exactly as the binary does, with scripted classifiers.
fn harness(words: Vec<(WakeWordConfig, Vec<f32>)>) -> Harness {
    let output = SharedBuf::default();
    let sink = DetectionSink::with_writer(Box::new(output.clone()), SinkFormat::Plain, false);

    let mel_calls = Arc::new(AtomicUsize::new(0));
    let embedding_calls = Arc::new(AtomicUsize::new(0));
    let mut classifier_calls = Vec::new();

    let detectors: Vec<(WakeWordConfig, Box<dyn Model>)> = words
        .into_iter()
        .map(|(config, script)| {
            let calls = Arc::new(AtomicUsize::new(0));
            classifier_calls.push(Arc::clone(&calls));
            let model: Box<dyn Model> = Box::new(ScriptedClassifier { script, calls });
            (config, model)
        })
        .collect();

    let pipeline = Pipeline::from_parts(
        FRAME_SIZE,
        Box::new(FakeMel {
            calls: Arc::clone(&mel_calls),
        }),
        Box::new(FakeEmbedding {
            calls: Arc::clone(&embedding_calls),
        }),
        detectors,
        sink,
    );

    Harness {
        pipeline,
        output,
        mel_calls,
        embedding_calls,
        classifier_calls,
    }
}

/// Feed `samples` zeros through the pipeline in frame-sized pushes and
/// drain it.
fn run_silence(harness: &mut Harness, samples: usize) {
    harness.pipeline.start();
    harness.pipeline.wait_until_ready();
    let frame = vec![0i16; FRAME_SIZE];
    let mut remaining = samples;
    while remaining >= FRAME_SIZE {
        assert!(harness.pipeline.process_audio(&frame));
        remaining -= FRAME_SIZE;
    }
    if remaining > 0 {
        assert!(harness.pipeline.process_audio(&frame[..remaining]));
    }
    harness.pipeline.stop().unwrap();
}

#[test]
fn silence_in_no_detection_out() {
    // Sixty seconds of zeros with a single-word model.
    let mut h = harness(vec![(word("alexa", 4, 20), Vec::new())]);
    run_silence(&mut h, 60 * 16000);
    assert_eq!(h.output.lines(), Vec::<String>::new());
}

#[test]
fn stage_emission_counts_follow_window_arithmetic() {
    let mut h = harness(vec![(word("alexa", 4, 20), Vec::new())]);
    // 187.5 frames: the half frame at the tail must not produce a mel.
    let total = 187 * FRAME_SIZE + FRAME_SIZE / 2;
    run_silence(&mut h, total);

    let mels = h.mel_calls.load(Ordering::Relaxed);
    assert_eq!(mels, total / FRAME_SIZE);

    let mel_rows = mels * ROWS_PER_FRAME;
    let embeddings = h.embedding_calls.load(Ordering::Relaxed);
    assert_eq!(embeddings, (mel_rows - EMBEDDING_WINDOW) / 8 + 1);

    let predictions = h.classifier_calls[0].load(Ordering::Relaxed);
    assert_eq!(predictions, embeddings - 15);
}

#[test]
fn eof_mid_frame_shuts_down_cleanly() {
    let mut h = harness(vec![(word("alexa", 4, 20), Vec::new())]);
    run_silence(&mut h, 3 * FRAME_SIZE + FRAME_SIZE / 2);
    assert_eq!(h.mel_calls.load(Ordering::Relaxed), 3);
    assert_eq!(h.output.lines(), Vec::<String>::new());
}

#[test]
fn synthetic_spike_fires_exactly_once() {
    // Four supra-threshold predictions, then quiet: one detection, and
    // the refractory period absorbs the next twenty predictions.
    let mut script = vec![0.9, 0.9, 0.9, 0.9];
    script.extend(vec![0.0; 100]);
    let mut h = harness(vec![(word("alexa", 4, 20), script)]);
    run_silence(&mut h, 40 * FRAME_SIZE);

    assert!(h.classifier_calls[0].load(Ordering::Relaxed) >= 24);
    assert_eq!(h.output.lines(), vec!["alexa"]);
}

#[test]
fn spike_after_refractory_fires_again() {
    // Second burst lands after the cooldown has counted back to zero.
    let mut script = vec![0.9; 4];
    script.extend(vec![0.0; 20]);
    script.extend(vec![0.9; 4]);
    let mut h = harness(vec![(word("alexa", 4, 20), script)]);
    run_silence(&mut h, 40 * FRAME_SIZE);
    assert_eq!(h.output.lines(), vec!["alexa", "alexa"]);
}

#[test]
fn sub_threshold_flutter_never_fires() {
    let script: Vec<f32> = (0..200)
        .map(|i| if i % 2 == 0 { 0.6 } else { 0.4 })
        .collect();
    let mut h = harness(vec![(word("alexa", 4, 20), script)]);
    run_silence(&mut h, 40 * FRAME_SIZE);
    assert_eq!(h.output.lines(), Vec::<String>::new());
}

#[test]
fn two_words_interleave_with_correct_labels() {
    // Detector A reaches its trigger at prediction 10, B at 12.
    let mut script_a = vec![0.0; 6];
    script_a.extend(vec![0.9; 4]);
    let mut script_b = vec![0.0; 8];
    script_b.extend(vec![0.9; 4]);

    let mut h = harness(vec![
        (word("word_a", 4, 20), script_a),
        (word("word_b", 4, 20), script_b),
    ]);
    run_silence(&mut h, 40 * FRAME_SIZE);

    let mut lines = h.output.lines();
    lines.sort();
    assert_eq!(lines, vec!["word_a", "word_b"]);
}

/// Mel mock that dies after a fixed number of inferences.
struct FailingMel {
    remaining: usize,
}

impl Model for FailingMel {
    fn infer(&mut self, _input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        if self.remaining == 0 {
            return Err(oww_stream::Error::Inference {
                stage: "mel",
                message: "synthetic runtime failure".to_string(),
            });
        }
        self.remaining -= 1;
        Ok(ArrayD::zeros(ndarray::IxDyn(&[1, ROWS_PER_FRAME, NUM_MELS])))
    }
}

#[test]
fn mid_run_inference_failure_unblocks_the_reader() {
    let output = SharedBuf::default();
    let sink = DetectionSink::with_writer(Box::new(output.clone()), SinkFormat::Plain, false);
    let mut pipeline = Pipeline::from_parts(
        FRAME_SIZE,
        Box::new(FailingMel { remaining: 2 }),
        Box::new(FakeEmbedding {
            calls: Arc::new(AtomicUsize::new(0)),
        }),
        vec![(
            word("alexa", 4, 20),
            Box::new(ScriptedClassifier {
                script: Vec::new(),
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        )],
        sink,
    );

    pipeline.start();
    pipeline.wait_until_ready();

    // The dead stage latches its input, so the reader cannot stay
    // blocked on backpressure.
    let frame = vec![0i16; FRAME_SIZE];
    let mut accepted = 0;
    for _ in 0..1000 {
        if !pipeline.process_audio(&frame) {
            break;
        }
        accepted += 1;
    }
    assert!(accepted < 1000, "push never failed fast after stage death");

    let err = pipeline.stop().unwrap_err();
    assert!(err.to_string().contains("mel"));
    assert_eq!(output.lines(), Vec::<String>::new());
}

/// Mel mock that stalls per inference and tags each emission with the
/// first sample of its frame.
struct SlowEchoMel;

impl Model for SlowEchoMel {
    fn infer(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        std::thread::sleep(Duration::from_millis(50));
        Ok(ArrayD::from_elem(
            ndarray::IxDyn(&[1, 1, NUM_MELS]),
            input[[0, 0]],
        ))
    }
}

#[test]
fn backpressure_loses_nothing_and_keeps_order() {
    // A two-frame queue forces the producer to block while the slow mel
    // model works through the backlog.
    let input = Arc::new(SampleQueue::new(2 * FRAME_SIZE));
    let output = Arc::new(SampleQueue::new(1 << 20));
    let stage = MelStage::new(Box::new(SlowEchoMel), FRAME_SIZE);

    let producer = {
        let input = Arc::clone(&input);
        std::thread::spawn(move || {
            for i in 0..10 {
                assert!(input.push(vec![i as f32; FRAME_SIZE]));
            }
            input.set_exhausted();
        })
    };

    stage.run(&input, &output).unwrap();
    producer.join().unwrap();

    // Every frame surfaced exactly once, in order (values rescaled by
    // the mel stage's x/10 + 2).
    let mels = output.pull(0);
    assert_eq!(mels.len(), 10 * NUM_MELS);
    for (frame, row) in mels.chunks(NUM_MELS).enumerate() {
        let expected = frame as f32 / 10.0 + 2.0;
        assert!(row.iter().all(|&v| v == expected), "frame {frame} reordered");
    }
    assert!(output.is_exhausted());
}
