use log::debug;
use ndarray::Array3;

use crate::error::{Error, Result};
use crate::model::Model;
use crate::queue::SampleQueue;
use crate::ring::RingBuffer;
use crate::sink::DetectionSink;
use crate::{EMBEDDING_FEATURES, WAKEWORD_FEATURES};

/// Hysteresis over per-window probabilities. A detection needs
/// `trigger_level` supra-threshold predictions (with unit decay on
/// misses); each emission starts a refractory count-up from
/// `-refractory_steps` before the counter can rebuild.
#[derive(Debug, Clone)]
pub struct ActivationState {
    count: i32,
    threshold: f32,
    trigger_level: i32,
    refractory_steps: i32,
}

impl ActivationState {
    pub fn new(threshold: f32, trigger_level: u32, refractory_steps: u32) -> Self {
        ActivationState {
            count: 0,
            threshold,
            trigger_level: trigger_level as i32,
            refractory_steps: refractory_steps as i32,
        }
    }

    /// Feed one prediction; returns true when a detection fires.
    pub fn update(&mut self, probability: f32) -> bool {
        if probability > self.threshold {
            self.count += 1;
            if self.count >= self.trigger_level {
                self.count = -self.refractory_steps;
                return true;
            }
        } else if self.count > 0 {
            self.count -= 1;
        } else if self.count < 0 {
            self.count += 1;
        }
        false
    }
}

/// Final pipeline stage, one per wake word: slides a 16-embedding window
/// over its feature stream, classifies each window, and reports
/// detections through the shared sink.
pub struct DetectorStage {
    label: String,
    model: Box<dyn Model>,
    activation: ActivationState,
    ring: RingBuffer<f32>,
    window: Vec<f32>,
    frame_index: u64,
    debug: bool,
}

impl DetectorStage {
    pub fn new(
        label: impl Into<String>,
        model: Box<dyn Model>,
        activation: ActivationState,
        debug: bool,
    ) -> Self {
        DetectorStage {
            label: label.into(),
            model,
            activation,
            ring: RingBuffer::new(4 * WAKEWORD_FEATURES * EMBEDDING_FEATURES),
            window: vec![0.0; WAKEWORD_FEATURES * EMBEDDING_FEATURES],
            frame_index: 0,
            debug,
        }
    }

    /// Thread entry point. Exits when the feature queue is exhausted and
    /// drained, or on a fatal inference error; either way the input is
    /// latched so the fan-out cannot block on a dead detector.
    pub fn run(mut self, input: &SampleQueue, sink: &DetectionSink) -> Result<()> {
        let result = self.process(input, sink);
        input.set_exhausted();
        if let Err(ref e) = result {
            log::error!("detector '{}' failed: {e}", self.label);
        }
        result
    }

    fn process(&mut self, input: &SampleQueue, sink: &DetectionSink) -> Result<()> {
        loop {
            let features = input.pull(self.ring.available());
            if features.is_empty() && input.is_exhausted() {
                debug!(
                    "detector '{}': input exhausted after {} predictions",
                    self.label, self.frame_index
                );
                return Ok(());
            }
            self.ring.push(&features);

            while self.ring.len() / EMBEDDING_FEATURES >= WAKEWORD_FEATURES {
                self.ring.peek(&mut self.window, 0);
                let probability = self.classify()?;
                self.frame_index += 1;

                if self.debug {
                    sink.debug(&self.label, probability);
                }
                if self.activation.update(probability) {
                    sink.emit(&self.label, probability, self.frame_index);
                }

                // Slide by one embedding (~80 ms).
                self.ring.skip(EMBEDDING_FEATURES);
            }
        }
    }

    fn classify(&mut self) -> Result<f32> {
        let input = Array3::from_shape_vec(
            (1, WAKEWORD_FEATURES, EMBEDDING_FEATURES),
            self.window.clone(),
        )?;
        let output = self.model.infer(input.into_dyn())?;
        output
            .iter()
            .next()
            .copied()
            .ok_or_else(|| Error::inference("detector", "classifier returned no output"))
    }
}
