use hound::{SampleFormat, WavReader};
use log::debug;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::audio::MicSource;
use crate::error::{Error, Result};
use crate::SAMPLE_RATE;

/// A stream of signed 16-bit mono samples at 16 kHz. Sources are driven
/// from the reader thread only and need not be `Send`.
pub trait AudioSource {
    /// Read up to `buf.len()` samples. `Ok(0)` signals end of stream; a
    /// short read is allowed at any time.
    fn read_samples(&mut self, buf: &mut [i16]) -> Result<usize>;
}

/// Raw little-endian PCM from any byte reader (typically stdin). A
/// trailing odd byte at EOF is discarded.
pub struct RawPcmSource<R: Read> {
    reader: R,
    bytes: Vec<u8>,
}

impl<R: Read> RawPcmSource<R> {
    pub fn new(reader: R) -> Self {
        RawPcmSource {
            reader,
            bytes: Vec::new(),
        }
    }
}

impl<R: Read> AudioSource for RawPcmSource<R> {
    fn read_samples(&mut self, buf: &mut [i16]) -> Result<usize> {
        self.bytes.resize(buf.len() * 2, 0);
        let mut filled = 0;
        while filled < self.bytes.len() {
            match self.reader.read(&mut self.bytes[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let samples = filled / 2;
        for (i, sample) in buf[..samples].iter_mut().enumerate() {
            *sample = i16::from_le_bytes([self.bytes[2 * i], self.bytes[2 * i + 1]]);
        }
        Ok(samples)
    }
}

/// WAV container input. The header must declare 16 kHz mono 16-bit PCM;
/// anything else is a configuration error.
pub struct WavSource<R: Read> {
    reader: WavReader<R>,
}

impl<R: Read> WavSource<R> {
    pub fn new(reader: R) -> Result<Self> {
        let reader = WavReader::new(reader)
            .map_err(|e| Error::Wav(format!("cannot parse WAV header: {e}")))?;
        let spec = reader.spec();
        if spec.sample_rate != SAMPLE_RATE {
            return Err(Error::Wav(format!(
                "sample rate {} Hz, expected {SAMPLE_RATE} Hz",
                spec.sample_rate
            )));
        }
        if spec.channels != 1 {
            return Err(Error::Wav(format!(
                "{} channels, expected mono",
                spec.channels
            )));
        }
        if spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int {
            return Err(Error::Wav(format!(
                "{}-bit {:?} samples, expected 16-bit PCM",
                spec.bits_per_sample, spec.sample_format
            )));
        }
        Ok(WavSource { reader })
    }
}

impl<R: Read> AudioSource for WavSource<R> {
    fn read_samples(&mut self, buf: &mut [i16]) -> Result<usize> {
        let mut n = 0;
        let mut samples = self.reader.samples::<i16>();
        while n < buf.len() {
            match samples.next() {
                Some(Ok(sample)) => {
                    buf[n] = sample;
                    n += 1;
                }
                Some(Err(e)) => {
                    return Err(Error::Wav(format!("WAV read failed: {e}")));
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl AudioSource for MicSource {
    fn read_samples(&mut self, buf: &mut [i16]) -> Result<usize> {
        Ok(self.read(buf))
    }
}

/// Open the configured input: a file path (WAV by extension, raw
/// otherwise) or stdin with RIFF sniffing.
pub fn open_input(path: Option<&Path>) -> Result<Box<dyn AudioSource>> {
    match path {
        Some(path) => {
            let file = File::open(path)
                .map_err(|e| Error::Config(format!("cannot open {}: {e}", path.display())))?;
            let reader = BufReader::new(file);
            if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("wav")) {
                debug!("reading WAV input from {}", path.display());
                Ok(Box::new(WavSource::new(reader)?))
            } else {
                debug!("reading raw PCM input from {}", path.display());
                Ok(Box::new(RawPcmSource::new(reader)))
            }
        }
        None => {
            let mut stdin = std::io::stdin().lock();
            // Sniff the container: a WAV stream opens with "RIFF".
            let mut prefix = [0u8; 4];
            let mut got = 0;
            while got < prefix.len() {
                match stdin.read(&mut prefix[got..]) {
                    Ok(0) => break,
                    Ok(n) => got += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            let chained = std::io::Cursor::new(prefix[..got].to_vec()).chain(stdin);
            if &prefix[..got] == b"RIFF" {
                debug!("reading WAV input from stdin");
                Ok(Box::new(WavSource::new(chained)?))
            } else {
                debug!("reading raw PCM input from stdin");
                Ok(Box::new(RawPcmSource::new(chained)))
            }
        }
    }
}
