//! Real/tampered text samples cut from source files, for training a judge
//! that tells whether the second half of a snippet belongs to the first.

use anyhow::{Context, Result};
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::module::{Describe, FunctionSchema};
use crate::trainers::error::TrainError;

const SELF_TEST_SAMPLES: usize = 100;

pub const JUDGE_PROMPT: &str = r#"
INPUT (JSON):
```{sample}```
QUESTION:

WAS THE INPUT REAL (1) OR TAMPERED (0)? -> :

OUTPUT (answer: int):
json```
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealfakeConfig {
    pub folder_path: PathBuf,
    /// File extension to keep, without the dot
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_extension() -> String {
    "py".to_string()
}

impl RealfakeConfig {
    pub fn new(folder_path: impl Into<PathBuf>) -> Self {
        Self {
            folder_path: folder_path.into(),
            extension: default_extension(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleOptions {
    /// File index; random when unset
    pub idx: Option<usize>,
    /// Cap on the sliced text, in characters
    pub num_chars: Option<usize>,
    /// First line of the slice; uniform in `[0, num_lines]` when unset
    pub random_start_line: Option<usize>,
    pub real_prob: f64,
    pub input_output_ratio: f64,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            idx: None,
            num_chars: None,
            random_start_line: None,
            real_prob: 0.5,
            input_output_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealfakeSample {
    pub input_text: String,
    pub output_text: String,
    pub filepath: PathBuf,
    /// 1 when `output_text` continues `input_text`, 0 when it was swapped
    pub real: u8,
}

pub struct DataTextRealfake {
    config: RealfakeConfig,
    filepaths: Vec<PathBuf>,
}

impl DataTextRealfake {
    pub fn new(config: RealfakeConfig) -> Result<Self> {
        let mut filepaths = Vec::new();
        walk(&config.folder_path, &config.extension, &mut filepaths)?;
        filepaths.sort();
        info!(
            "Found {} .{} files under {}",
            filepaths.len(),
            config.extension,
            config.folder_path.display()
        );
        Ok(Self { config, filepaths })
    }

    pub fn config(&self) -> &RealfakeConfig {
        &self.config
    }

    pub fn filepaths(&self) -> &[PathBuf] {
        &self.filepaths
    }

    pub fn len(&self) -> usize {
        self.filepaths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filepaths.is_empty()
    }

    pub fn random_idx<R: Rng>(&self, rng: &mut R) -> Result<usize> {
        if self.filepaths.is_empty() {
            return Err(TrainError::InvalidConfig(format!(
                "no .{} files under {}",
                self.config.extension,
                self.config.folder_path.display()
            ))
            .into());
        }
        Ok(rng.gen_range(0..self.filepaths.len()))
    }

    pub fn sample<R: Rng>(&self, options: &SampleOptions, rng: &mut R) -> Result<RealfakeSample> {
        let idx = match options.idx {
            Some(idx) => idx,
            None => self.random_idx(rng)?,
        };
        let (mut sample, output_chars) = self.real_slice(idx, options, rng)?;

        let real = rng.gen_range(0.0..1.0) > options.real_prob;
        sample.real = u8::from(real);

        if !real {
            let other_idx = self.other_idx(idx, rng)?;
            let other_options = SampleOptions {
                idx: Some(other_idx),
                random_start_line: None,
                ..options.clone()
            };
            let (other, _) = self.real_slice(other_idx, &other_options, rng)?;
            sample.output_text = other.output_text.chars().take(output_chars).collect();
        }
        Ok(sample)
    }

    /// A different file than `idx` when there is more than one
    fn other_idx<R: Rng>(&self, idx: usize, rng: &mut R) -> Result<usize> {
        let n = self.filepaths.len();
        if n < 2 {
            return self.random_idx(rng);
        }
        let offset = rng.gen_range(1..n);
        Ok((idx + offset) % n)
    }

    /// Untampered slice of file `idx`, plus the output length in characters
    fn real_slice<R: Rng>(&self, idx: usize, options: &SampleOptions, rng: &mut R) -> Result<(RealfakeSample, usize)> {
        let filepath = self.filepaths.get(idx).with_context(|| {
            format!("file index {} out of range ({} files)", idx, self.filepaths.len())
        })?;
        let text = fs::read_to_string(filepath).with_context(|| format!("Failed to read {}", filepath.display()))?;

        let lines: Vec<&str> = text.split('\n').collect();
        let num_lines = lines.len();
        let start_line = match options.random_start_line {
            Some(line) => line.min(num_lines),
            None => rng.gen_range(0..=num_lines),
        };

        let mut chars: Vec<char> = lines[start_line..].join("\n").chars().collect();
        if let Some(limit) = options.num_chars {
            chars.truncate(limit);
        }
        let ratio = options.input_output_ratio.clamp(0.0, 1.0);
        let input_chars = (chars.len() as f64 * ratio) as usize;

        let sample = RealfakeSample {
            input_text: chars[..input_chars].iter().collect(),
            output_text: chars[input_chars..].iter().collect(),
            filepath: filepath.clone(),
            real: 1,
        };
        Ok((sample, chars.len() - input_chars))
    }

    /// Judge prompt with the sample embedded as JSON
    pub fn prompt(&self, sample: &RealfakeSample) -> Result<String> {
        Ok(JUDGE_PROMPT.replace("{sample}", &serde_json::to_string(sample)?))
    }

    /// Map a judge reply to 0 or 1
    pub fn parse_output(&self, output: &str) -> Result<u8> {
        if output.contains('0') {
            Ok(0)
        } else if output.contains('1') {
            Ok(1)
        } else {
            Err(TrainError::InvalidConfig(format!("Invalid output: {}, expected 0 or 1", output)).into())
        }
    }

    /// Draw `n` samples and report samples per second
    pub fn throughput<R: Rng>(&self, n: usize, rng: &mut R) -> Result<f64> {
        let start = Instant::now();
        let options = SampleOptions::default();
        for i in 0..n {
            self.sample(&options, rng)?;
            if (i + 1) % 100 == 0 {
                info!("samples_per_second: {:.1}", (i + 1) as f64 / start.elapsed().as_secs_f64());
            }
        }
        Ok(n as f64 / start.elapsed().as_secs_f64().max(f64::EPSILON))
    }
}

impl Describe for DataTextRealfake {
    fn module_file(&self) -> &'static str {
        file!()
    }

    fn functions(&self) -> Vec<FunctionSchema> {
        vec![
            FunctionSchema::new("random_idx", &[], "usize"),
            FunctionSchema::new(
                "sample",
                &[
                    ("idx", "Option<usize>"),
                    ("num_chars", "Option<usize>"),
                    ("random_start_line", "Option<usize>"),
                    ("real_prob", "f64"),
                    ("input_output_ratio", "f64"),
                ],
                "RealfakeSample",
            )
            .with_docs("Cut a snippet and maybe swap its second half"),
            FunctionSchema::new("prompt", &[("sample", "RealfakeSample")], "String"),
            FunctionSchema::new("parse_output", &[("output", "str")], "u8"),
            FunctionSchema::new("test", &[("n", "usize")], "f64"),
        ]
    }

    fn self_test(&mut self) -> Result<()> {
        let mut rng = rand::thread_rng();
        let rate = self.throughput(SELF_TEST_SAMPLES, &mut rng)?;
        info!("{} samples at {:.1} samples/s", SELF_TEST_SAMPLES, rate);
        Ok(())
    }
}

fn walk(dir: &Path, extension: &str, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            walk(&path, extension, out)?;
        } else if path.extension().map_or(false, |ext| ext == extension) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn corpus() -> Result<(tempfile::TempDir, DataTextRealfake)> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("pkg/sub"))?;
        fs::write(dir.path().join("a.py"), "import os\nprint('a')\nx = 1\n")?;
        fs::write(dir.path().join("pkg/b.py"), "def f():\n    return 2\n")?;
        fs::write(dir.path().join("pkg/sub/c.py"), "one_line = True")?;
        fs::write(dir.path().join("pkg/readme.md"), "# not python")?;
        let data = DataTextRealfake::new(RealfakeConfig::new(dir.path()))?;
        Ok((dir, data))
    }

    #[test]
    fn test_walks_recursively_and_sorts() -> Result<()> {
        let (dir, data) = corpus()?;
        let names: Vec<_> = data
            .filepaths()
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![PathBuf::from("a.py"), PathBuf::from("pkg/b.py"), PathBuf::from("pkg/sub/c.py")]
        );
        Ok(())
    }

    #[test]
    fn test_real_sample_reconstructs_slice() -> Result<()> {
        let (_dir, data) = corpus()?;
        let mut rng = StdRng::seed_from_u64(3);
        let options = SampleOptions {
            idx: Some(0),
            random_start_line: Some(1),
            real_prob: 0.0,
            ..Default::default()
        };
        let sample = data.sample(&options, &mut rng)?;
        assert_eq!(sample.real, 1);
        assert_eq!(format!("{}{}", sample.input_text, sample.output_text), "print('a')\nx = 1\n");
        Ok(())
    }

    #[test]
    fn test_fake_sample_keeps_output_length() -> Result<()> {
        let (_dir, data) = corpus()?;
        let mut rng = StdRng::seed_from_u64(11);
        let options = SampleOptions {
            idx: Some(0),
            random_start_line: Some(0),
            real_prob: 1.0,
            ..Default::default()
        };
        let sample = data.sample(&options, &mut rng)?;
        assert_eq!(sample.real, 0);
        let full = "import os\nprint('a')\nx = 1\n";
        let input_chars = full.chars().count() / 2;
        assert_eq!(sample.input_text, full[..input_chars]);
        assert!(sample.output_text.chars().count() <= full.chars().count() - input_chars);
        Ok(())
    }

    #[test]
    fn test_never_fails_on_short_files() -> Result<()> {
        let (_dir, data) = corpus()?;
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..500 {
            let sample = data.sample(&SampleOptions::default(), &mut rng)?;
            if sample.real == 1 {
                let text = fs::read_to_string(&sample.filepath)?;
                assert!(text.ends_with(&format!("{}{}", sample.input_text, sample.output_text)));
            }
        }
        Ok(())
    }

    #[test]
    fn test_start_line_past_end_is_empty() -> Result<()> {
        let (_dir, data) = corpus()?;
        let mut rng = StdRng::seed_from_u64(0);
        let options = SampleOptions {
            idx: Some(2),
            random_start_line: Some(10),
            real_prob: 0.0,
            ..Default::default()
        };
        let sample = data.sample(&options, &mut rng)?;
        assert!(sample.input_text.is_empty() && sample.output_text.is_empty());
        Ok(())
    }

    #[test]
    fn test_parse_output() -> Result<()> {
        let (_dir, data) = corpus()?;
        assert_eq!(data.parse_output("answer: 0")?, 0);
        assert_eq!(data.parse_output("{\"answer\": 1}")?, 1);
        assert_eq!(data.parse_output("10")?, 0);
        assert!(data.parse_output("maybe").is_err());
        Ok(())
    }

    #[test]
    fn test_prompt_embeds_sample() -> Result<()> {
        let (_dir, data) = corpus()?;
        let sample = RealfakeSample {
            input_text: "a".into(),
            output_text: "b".into(),
            filepath: PathBuf::from("x.py"),
            real: 1,
        };
        let prompt = data.prompt(&sample)?;
        assert!(prompt.contains(r#""input_text":"a""#));
        assert!(prompt.contains("WAS THE INPUT REAL (1) OR TAMPERED (0)?"));
        Ok(())
    }

    #[test]
    fn test_empty_folder() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data = DataTextRealfake::new(RealfakeConfig::new(dir.path()))?;
        let mut rng = StdRng::seed_from_u64(0);
        assert!(data.sample(&SampleOptions::default(), &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn test_wrapped_sampler() -> Result<()> {
        use crate::module::{ModuleInterface, ModuleWrapper};

        let (_dir, data) = corpus()?;
        let mut module = ModuleWrapper::new(data);
        assert_eq!(module.module_path(), "datatextrealfake");
        assert!(module.functions().contains(&"sample".to_string()));
        assert_eq!(module.len(), 3);
        module.test()?;
        Ok(())
    }
}
