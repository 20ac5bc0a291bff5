use log::debug;
use ndarray::Array2;

use crate::error::{Error, Result};
use crate::model::Model;
use crate::queue::SampleQueue;
use crate::ring::RingBuffer;
use crate::NUM_MELS;

/// First pipeline stage: frames the raw float stream and turns each frame
/// into rescaled mel rows.
pub struct MelStage {
    model: Box<dyn Model>,
    frame_size: usize,
    ring: RingBuffer<f32>,
    frame: Vec<f32>,
}

impl MelStage {
    pub fn new(model: Box<dyn Model>, frame_size: usize) -> Self {
        MelStage {
            model,
            frame_size,
            // Room for 16 frames of backlog plus the partial frame in flight.
            ring: RingBuffer::new(17 * frame_size),
            frame: vec![0.0; frame_size],
        }
    }

    /// Thread entry point. Consumes raw samples from `input` until it is
    /// exhausted, emitting one mel batch per complete frame.
    ///
    /// Every exit path exhausts the output queue (so downstream drains)
    /// and the input queue (so a blocked producer fails fast instead of
    /// waiting on a consumer that is gone).
    pub fn run(mut self, input: &SampleQueue, output: &SampleQueue) -> Result<()> {
        let result = self.process(input, output);
        output.set_exhausted();
        input.set_exhausted();
        if let Err(ref e) = result {
            log::error!("mel stage failed: {e}");
        }
        result
    }

    fn process(&mut self, input: &SampleQueue, output: &SampleQueue) -> Result<()> {
        loop {
            let samples = input.pull(self.ring.available());
            if samples.is_empty() && input.is_exhausted() {
                debug!("mel stage: input exhausted, {} samples dropped", self.ring.len());
                return Ok(());
            }
            self.ring.push(&samples);

            while self.ring.len() >= self.frame_size {
                self.ring.pop(&mut self.frame);
                let mels = self.compute_mels()?;
                if !output.push(mels) {
                    return Ok(());
                }
            }
        }
    }

    fn compute_mels(&mut self) -> Result<Vec<f32>> {
        let input = Array2::from_shape_vec((1, self.frame_size), self.frame.clone())?;
        let output = self.model.infer(input.into_dyn())?;

        if output.len() % NUM_MELS != 0 {
            return Err(Error::inference(
                "mel",
                format!(
                    "model produced {} values, not a multiple of {NUM_MELS} mel bins",
                    output.len()
                ),
            ));
        }

        // Rescale for the Google speech embedding model's expected range.
        Ok(output.iter().map(|&x| x / 10.0 + 2.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    /// Emits `rows_per_frame` rows of 32 constant mels per inference.
    struct FakeMelModel {
        rows_per_frame: usize,
    }

    impl Model for FakeMelModel {
        fn infer(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
            assert_eq!(input.shape()[0], 1);
            let values = vec![0.0f32; self.rows_per_frame * NUM_MELS];
            Ok(ArrayD::from_shape_vec(
                ndarray::IxDyn(&[1, self.rows_per_frame, NUM_MELS]),
                values,
            )
            .unwrap())
        }
    }

    #[test]
    fn one_mel_batch_per_complete_frame() {
        let frame_size = 5120;
        let stage = MelStage::new(Box::new(FakeMelModel { rows_per_frame: 20 }), frame_size);
        let input = SampleQueue::new(16 * frame_size);
        let output = SampleQueue::new(1 << 20);

        // 3.5 frames: exactly three emissions, tail dropped.
        input.push(vec![0.0; frame_size * 3 + frame_size / 2]);
        input.set_exhausted();
        stage.run(&input, &output).unwrap();

        assert_eq!(output.len(), 3 * 20 * NUM_MELS);
        output.pull(0);
        assert!(output.is_exhausted());
    }

    #[test]
    fn rescales_mel_values() {
        struct ConstModel;
        impl Model for ConstModel {
            fn infer(&mut self, _input: ArrayD<f32>) -> Result<ArrayD<f32>> {
                Ok(ArrayD::from_elem(ndarray::IxDyn(&[1, 1, NUM_MELS]), -20.0))
            }
        }
        let stage = MelStage::new(Box::new(ConstModel), 1280);
        let input = SampleQueue::new(1280 * 16);
        let output = SampleQueue::new(1 << 16);
        input.push(vec![0.0; 1280]);
        input.set_exhausted();
        stage.run(&input, &output).unwrap();

        let mels = output.pull(0);
        assert_eq!(mels.len(), NUM_MELS);
        // -20 / 10 + 2 == 0
        assert!(mels.iter().all(|&m| m == 0.0));
    }

    #[test]
    fn bad_output_width_is_fatal() {
        struct BrokenModel;
        impl Model for BrokenModel {
            fn infer(&mut self, _input: ArrayD<f32>) -> Result<ArrayD<f32>> {
                Ok(ArrayD::from_elem(ndarray::IxDyn(&[1, 7]), 0.0))
            }
        }
        let stage = MelStage::new(Box::new(BrokenModel), 1280);
        let input = SampleQueue::new(1280 * 16);
        let output = SampleQueue::new(1 << 16);
        input.push(vec![0.0; 1280]);
        input.set_exhausted();

        assert!(stage.run(&input, &output).is_err());
        // Downstream still observes a clean end of stream.
        assert!(output.is_exhausted());
    }
}
