use std::f32::consts::PI;

/// Hook for transforms applied on the ingest thread, after sample
/// conversion and before the audio queue. Implementations mutate the
/// frame in place; advisory preprocessors (VAD) observe and leave it
/// unchanged.
pub trait Preprocessor: Send {
    fn process(&mut self, frame: &mut [f32]);

    fn name(&self) -> &str;
}

/// Biquad band-pass noise filter: drops rumble below the voice band and
/// hiss above it. Stands in for heavier spectral suppression while
/// keeping the wake word band untouched.
pub struct NoiseSuppressor {
    // feed-forward / feed-back coefficients
    a0: f32,
    a1: f32,
    a2: f32,
    b1: f32,
    b2: f32,
    // two-sample delay line
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl NoiseSuppressor {
    /// Band edges in Hz. The defaults (80, 7600) bracket speech at a
    /// 16 kHz rate.
    pub fn new(sample_rate: f32, low_cut: f32, high_cut: f32) -> Self {
        let center = (low_cut * high_cut).sqrt();
        let q = center / (high_cut - low_cut);
        let omega = 2.0 * PI * center / sample_rate;
        let alpha = omega.sin() / (2.0 * q);
        let norm = 1.0 + alpha;

        NoiseSuppressor {
            a0: alpha / norm,
            a1: 0.0,
            a2: -alpha / norm,
            b1: (-2.0 * omega.cos()) / norm,
            b2: (1.0 - alpha) / norm,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn voice_band(sample_rate: f32) -> Self {
        Self::new(sample_rate, 80.0, 7600.0)
    }
}

impl Preprocessor for NoiseSuppressor {
    fn process(&mut self, frame: &mut [f32]) {
        for sample in frame {
            let x0 = *sample;
            let y0 = self.a0 * x0 + self.a1 * self.x1 + self.a2 * self.x2
                - self.b1 * self.y1
                - self.b2 * self.y2;
            self.x2 = self.x1;
            self.x1 = x0;
            self.y2 = self.y1;
            self.y1 = y0;
            *sample = y0;
        }
    }

    fn name(&self) -> &str {
        "noise-suppression"
    }
}
