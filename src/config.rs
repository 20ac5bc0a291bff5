use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::{CHUNK_SAMPLES, DEFAULT_STEP_FRAMES};

/// Output verbosity / rendering selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Normal,
    Quiet,
    Verbose,
    Json,
}

/// Full pipeline configuration. Field defaults mirror the reference
/// models shipped alongside the binary; a JSON file loaded with
/// `-c/--config` overlays them, and explicit CLI flags win over both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub melspectrogram_model: PathBuf,
    pub embedding_model: PathBuf,
    pub wake_word_models: Vec<PathBuf>,

    pub threshold: f32,
    pub trigger_level: u32,
    pub refractory_steps: u32,
    pub step_frames: usize,

    pub vad_model: PathBuf,
    pub vad_threshold: f32,
    pub enable_vad: bool,
    pub enable_noise_suppression: bool,

    pub debug: bool,
    pub output_mode: OutputMode,
    pub show_timestamp: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            melspectrogram_model: PathBuf::from("models/melspectrogram.onnx"),
            embedding_model: PathBuf::from("models/embedding_model.onnx"),
            wake_word_models: Vec::new(),
            threshold: 0.5,
            trigger_level: 4,
            refractory_steps: 20,
            step_frames: DEFAULT_STEP_FRAMES,
            vad_model: PathBuf::from("models/silero_vad.onnx"),
            vad_threshold: 0.5,
            enable_vad: false,
            enable_noise_suppression: false,
            debug: false,
            output_mode: OutputMode::Normal,
            show_timestamp: false,
        }
    }
}

/// Per-word detector settings, derived from the global config.
#[derive(Debug, Clone)]
pub struct WakeWordConfig {
    pub model_path: PathBuf,
    pub label: String,
    pub threshold: f32,
    pub trigger_level: u32,
    pub refractory_steps: u32,
    pub debug: bool,
}

impl Config {
    /// Samples consumed per mel inference.
    pub fn frame_size(&self) -> usize {
        self.step_frames * CHUNK_SAMPLES
    }

    /// One detector config per wake word model, labelled by file stem.
    pub fn wake_word_configs(&self) -> Vec<WakeWordConfig> {
        self.wake_word_models
            .iter()
            .map(|path| WakeWordConfig {
                model_path: path.clone(),
                label: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string_lossy().into_owned()),
                threshold: self.threshold,
                trigger_level: self.trigger_level,
                refractory_steps: self.refractory_steps,
                debug: self.debug,
            })
            .collect()
    }

    /// Load a JSON overlay. Unknown fields are rejected so typos fail
    /// loudly.
    pub fn load_file(path: &Path) -> Result<Config> {
        let data = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        if self.wake_word_models.is_empty() {
            return Err(Error::Config("no wake word models specified".into()));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::Config("threshold must be between 0 and 1".into()));
        }
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(Error::Config(
                "VAD threshold must be between 0 and 1".into(),
            ));
        }
        if self.trigger_level == 0 {
            return Err(Error::Config("trigger level must be at least 1".into()));
        }
        if self.step_frames == 0 {
            return Err(Error::Config("step frames must be at least 1".into()));
        }
        for path in [&self.melspectrogram_model, &self.embedding_model]
            .into_iter()
            .chain(&self.wake_word_models)
        {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "model not found: {}",
                    path.display()
                )));
            }
        }
        if self.enable_vad && !self.vad_model.exists() {
            return Err(Error::Config(format!(
                "VAD model not found: {}",
                self.vad_model.display()
            )));
        }
        Ok(())
    }
}

/// Print the `.onnx` files under `dir`, one stem per line.
pub fn list_models(dir: &Path) -> Result<()> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "onnx"))
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    for name in names {
        println!("{name}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_scales_with_step_frames() {
        let mut config = Config::default();
        assert_eq!(config.frame_size(), 5120);
        config.step_frames = 2;
        assert_eq!(config.frame_size(), 2560);
    }

    #[test]
    fn labels_derive_from_file_stems() {
        let config = Config {
            wake_word_models: vec![PathBuf::from("models/hey_jarvis.onnx")],
            ..Config::default()
        };
        let words = config.wake_word_configs();
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].label, "hey_jarvis");
        assert_eq!(words[0].trigger_level, 4);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let config = Config {
            wake_word_models: vec![PathBuf::from("x.onnx")],
            threshold: 1.5,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_empty_model_list() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn config_file_overlay_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"threshold": 0.7, "trigger_level": 2}"#).unwrap();
        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.threshold, 0.7);
        assert_eq!(config.trigger_level, 2);
        // untouched fields keep their defaults
        assert_eq!(config.refractory_steps, 20);
    }
}
