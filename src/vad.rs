use log::{debug, warn};
use ndarray::{Array1, Array2, Array3};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::collections::VecDeque;
use std::path::Path;

use crate::error::{Error, Result};
use crate::preprocessing::Preprocessor;
use crate::{SAMPLE_RATE, VAD_CHUNK_SIZE, VAD_HIDDEN_DIM};

const SMOOTHING_WINDOW: usize = 125;

/// Silero-style recurrent voice activity detector.
///
/// Advisory only: it scores 30 ms windows and exposes a smoothed speech
/// decision, but never mutates or gates the audio passing through it.
pub struct VoiceActivityDetector {
    model: Session,
    h: Array3<f32>,
    c: Array3<f32>,
    sample_rate: i64,
    pending: Vec<f32>,
    prediction_buffer: VecDeque<f32>,
    threshold: f32,
}

impl VoiceActivityDetector {
    pub fn new(model_path: &Path, threshold: f32) -> Result<Self> {
        let model = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .with_inter_threads(1)?
            .commit_from_file(model_path)
            .map_err(|e| Error::ModelLoad {
                path: model_path.to_path_buf(),
                message: e.to_string(),
            })?;

        Ok(VoiceActivityDetector {
            model,
            h: Array3::zeros((2, 1, VAD_HIDDEN_DIM)),
            c: Array3::zeros((2, 1, VAD_HIDDEN_DIM)),
            sample_rate: SAMPLE_RATE as i64,
            pending: Vec::with_capacity(VAD_CHUNK_SIZE * 2),
            prediction_buffer: VecDeque::with_capacity(SMOOTHING_WINDOW),
            threshold,
        })
    }

    /// Score buffered audio one 30 ms window at a time; leftover samples
    /// wait for the next frame. Input is raw-range floats.
    fn score(&mut self, frame: &[f32]) -> Result<f32> {
        self.pending.extend(frame.iter().map(|&s| s / 32768.0));

        let mut window_scores = Vec::new();
        while self.pending.len() >= VAD_CHUNK_SIZE {
            let window: Vec<f32> = self.pending.drain(..VAD_CHUNK_SIZE).collect();

            let input = Array2::from_shape_vec((1, VAD_CHUNK_SIZE), window)?;
            let sr = Array1::from_elem(1, self.sample_rate);

            let input_tensor = Tensor::from_array(input)?;
            let sr_tensor = Tensor::from_array(sr)?;
            let h_tensor = Tensor::from_array(self.h.clone())?;
            let c_tensor = Tensor::from_array(self.c.clone())?;

            let outputs = self
                .model
                .run(ort::inputs![input_tensor, sr_tensor, h_tensor, c_tensor])?;

            let score: ndarray::ArrayViewD<f32> = outputs[0].try_extract_array()?;
            let new_h: ndarray::ArrayViewD<f32> = outputs[1].try_extract_array()?;
            let new_c: ndarray::ArrayViewD<f32> = outputs[2].try_extract_array()?;

            for i in 0..2 {
                for j in 0..VAD_HIDDEN_DIM {
                    self.h[[i, 0, j]] = new_h[[i, 0, j]];
                    self.c[[i, 0, j]] = new_c[[i, 0, j]];
                }
            }
            window_scores.push(score[[0, 0]]);
        }

        let mean = if window_scores.is_empty() {
            self.last_score()
        } else {
            window_scores.iter().sum::<f32>() / window_scores.len() as f32
        };
        if self.prediction_buffer.len() >= SMOOTHING_WINDOW {
            self.prediction_buffer.pop_front();
        }
        self.prediction_buffer.push_back(mean);
        Ok(mean)
    }

    /// Recent-window speech decision: any of the last few smoothed
    /// scores above threshold counts as speech.
    pub fn is_speech(&self) -> bool {
        let len = self.prediction_buffer.len();
        if len < 7 {
            return false;
        }
        self.prediction_buffer
            .range(len - 7..len - 4)
            .copied()
            .fold(0.0f32, f32::max)
            >= self.threshold
    }

    pub fn last_score(&self) -> f32 {
        self.prediction_buffer.back().copied().unwrap_or(0.0)
    }

    pub fn reset(&mut self) {
        self.h.fill(0.0);
        self.c.fill(0.0);
        self.pending.clear();
        self.prediction_buffer.clear();
    }
}

impl Preprocessor for VoiceActivityDetector {
    fn process(&mut self, frame: &mut [f32]) {
        match self.score(frame) {
            Ok(score) => debug!("vad score {score:.3} speech={}", self.is_speech()),
            Err(e) => warn!("vad inference failed: {e}"),
        }
    }

    fn name(&self) -> &str {
        "vad"
    }
}
