use log::debug;
use ndarray::Array4;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::Model;
use crate::queue::SampleQueue;
use crate::ring::RingBuffer;
use crate::{EMBEDDING_FEATURES, EMBEDDING_STEP, EMBEDDING_WINDOW, NUM_MELS};

/// Second pipeline stage: slides a 76-row window over the mel stream and
/// fans each 96-float embedding out to every detector queue as an owned
/// copy.
pub struct EmbeddingStage {
    model: Box<dyn Model>,
    ring: RingBuffer<f32>,
    window: Vec<f32>,
}

impl EmbeddingStage {
    pub fn new(model: Box<dyn Model>) -> Self {
        EmbeddingStage {
            model,
            // Two full windows of mel rows absorb pull bursts while one
            // window is in flight.
            ring: RingBuffer::new(2 * EMBEDDING_WINDOW * NUM_MELS),
            window: vec![0.0; EMBEDDING_WINDOW * NUM_MELS],
        }
    }

    /// Thread entry point. Every exit path exhausts all detector queues
    /// and the mel queue, so neither side can stay blocked on this stage.
    pub fn run(mut self, input: &SampleQueue, outputs: &[Arc<SampleQueue>]) -> Result<()> {
        let result = self.process(input, outputs);
        for output in outputs {
            output.set_exhausted();
        }
        input.set_exhausted();
        if let Err(ref e) = result {
            log::error!("embedding stage failed: {e}");
        }
        result
    }

    fn process(&mut self, input: &SampleQueue, outputs: &[Arc<SampleQueue>]) -> Result<()> {
        loop {
            let mels = input.pull(self.ring.available());
            if mels.is_empty() && input.is_exhausted() {
                debug!(
                    "embedding stage: input exhausted, {} mel rows dropped",
                    self.ring.len() / NUM_MELS
                );
                return Ok(());
            }
            self.ring.push(&mels);

            while self.ring.len() / NUM_MELS >= EMBEDDING_WINDOW {
                self.ring.peek(&mut self.window, 0);
                let embedding = self.embed()?;
                for output in outputs {
                    if !output.push(embedding.clone()) {
                        return Ok(());
                    }
                }
                self.ring.skip(EMBEDDING_STEP * NUM_MELS);
            }
        }
    }

    fn embed(&mut self) -> Result<Vec<f32>> {
        let input = Array4::from_shape_vec(
            (1, EMBEDDING_WINDOW, NUM_MELS, 1),
            self.window.clone(),
        )?;
        let output = self.model.infer(input.into_dyn())?;

        if output.len() != EMBEDDING_FEATURES {
            return Err(Error::inference(
                "embedding",
                format!(
                    "model produced {} values, expected {EMBEDDING_FEATURES}",
                    output.len()
                ),
            ));
        }
        Ok(output.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    /// Counts windows and tags each embedding with its ordinal.
    struct FakeEmbeddingModel {
        calls: f32,
    }

    impl Model for FakeEmbeddingModel {
        fn infer(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
            assert_eq!(
                input.shape(),
                &[1, EMBEDDING_WINDOW, NUM_MELS, 1],
                "embedding input window shape"
            );
            let ordinal = self.calls;
            self.calls += 1.0;
            Ok(ArrayD::from_elem(
                ndarray::IxDyn(&[1, EMBEDDING_FEATURES]),
                ordinal,
            ))
        }
    }

    fn run_over_rows(rows: usize, sinks: usize) -> Vec<Arc<SampleQueue>> {
        let stage = EmbeddingStage::new(Box::new(FakeEmbeddingModel { calls: 0.0 }));
        let input = SampleQueue::new(EMBEDDING_WINDOW * NUM_MELS * 4);
        let outputs: Vec<Arc<SampleQueue>> = (0..sinks)
            .map(|_| Arc::new(SampleQueue::new(1 << 20)))
            .collect();

        // One row per push exercises the re-buffering path.
        for _ in 0..rows {
            input.push(vec![0.0f32; NUM_MELS]);
        }
        input.set_exhausted();
        stage.run(&input, &outputs).unwrap();
        outputs
    }

    #[test]
    fn emission_count_follows_window_arithmetic() {
        // floor((M - 76) / 8) + 1 emissions for M >= 76.
        for (rows, expected) in [(75, 0), (76, 1), (83, 1), (84, 2), (76 + 8 * 9, 10)] {
            let outputs = run_over_rows(rows, 1);
            assert_eq!(
                outputs[0].len(),
                expected * EMBEDDING_FEATURES,
                "rows = {rows}"
            );
        }
    }

    #[test]
    fn fan_out_copies_to_every_detector() {
        let outputs = run_over_rows(76 + 8, 3);
        for output in &outputs {
            let data = output.pull(0);
            assert_eq!(data.len(), 2 * EMBEDDING_FEATURES);
            // First embedding tagged 0, second tagged 1.
            assert!(data[..EMBEDDING_FEATURES].iter().all(|&v| v == 0.0));
            assert!(data[EMBEDDING_FEATURES..].iter().all(|&v| v == 1.0));
            assert!(output.is_exhausted());
        }
    }
}
