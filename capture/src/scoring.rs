//! Anomaly scoring – the pretrained model runs outside this process.
//!
//! The pipeline only needs a scalar per still: it smooths the last ten
//! scores and compares the mean against two thresholds.

use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use plantcam_common::config::Config;

/// Number of scores averaged to damp single-frame noise.
pub const WINDOW: usize = 10;

/// Scores one still image. Higher means more anomalous.
pub trait Scorer: Send {
    fn score(&mut self, image: &Path) -> Result<f64>;
}

/// Runs `SCORER_COMMAND <image>` and reads the score from its last
/// stdout line.
pub struct CommandScorer {
    program: String,
    args: Vec<String>,
}

impl CommandScorer {
    pub fn from_config(config: &Config) -> Result<Self> {
        let line = config
            .scorer_command
            .as_deref()
            .context("SCORER_COMMAND is not set")?;
        Self::parse(line)
    }

    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().context("SCORER_COMMAND is empty")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl Scorer for CommandScorer {
    fn score(&mut self, image: &Path) -> Result<f64> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run scorer {}", self.program))?;
        if !output.status.success() {
            bail!(
                "Scorer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_score(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse the last non-empty line as a finite, non-negative score.
pub fn parse_score(stdout: &str) -> Result<f64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .context("Scorer printed nothing")?;
    let score: f64 = line
        .parse()
        .with_context(|| format!("Scorer printed a non-number: {line}"))?;
    if !score.is_finite() || score < 0.0 {
        bail!("Scorer returned {score}, expected a value in [0, inf)");
    }
    Ok(score)
}

/// Fixed-size rolling mean over the most recent scores.
#[derive(Debug, Clone, Default)]
pub struct ScoreWindow {
    values: [f64; WINDOW],
    next: usize,
    filled: usize,
}

impl ScoreWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a score and return the updated mean.
    pub fn push(&mut self, score: f64) -> f64 {
        self.values[self.next] = score;
        self.next = (self.next + 1) % WINDOW;
        self.filled = (self.filled + 1).min(WINDOW);
        self.mean()
    }

    /// Mean of the recorded scores; 0 before the first one.
    pub fn mean(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.values[..self.filled].iter().sum::<f64>() / self.filled as f64
    }
}

/// Needs-water window on the smoothed score (both bounds exclusive).
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub under: f64,
    pub upper: f64,
}

impl Thresholds {
    pub fn from_config(config: &Config) -> Self {
        Self {
            under: config.score_threshold_under,
            upper: config.score_threshold_upper,
        }
    }

    pub fn needs_water(&self, mean: f64) -> bool {
        self.under < mean && mean < self.upper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_averages_last_ten() {
        let mut w = ScoreWindow::new();
        assert_eq!(w.mean(), 0.0);
        assert_eq!(w.push(4.0), 4.0);
        assert_eq!(w.push(8.0), 6.0);
        for _ in 0..10 {
            w.push(1.0);
        }
        assert_eq!(w.mean(), 1.0);
        // One outlier moves the mean by a tenth of its size.
        assert!((w.push(11.0) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_thresholds_are_exclusive() {
        let t = Thresholds { under: 6.0, upper: 10.0 };
        assert!(!t.needs_water(6.0));
        assert!(t.needs_water(6.1));
        assert!(t.needs_water(9.9));
        assert!(!t.needs_water(10.0));
        assert!(!t.needs_water(2.0));
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("loading model\n7.25\n").unwrap(), 7.25);
        assert!(parse_score("").is_err());
        assert!(parse_score("nan").is_err());
        assert!(parse_score("-1.0").is_err());
        assert!(parse_score("dry").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_scorer_runs_script_with_image_path() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("score.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"scoring $1\"\ntest -n \"$1\" && echo 6.5\n",
        )
        .unwrap();

        let mut scorer = CommandScorer::parse(&format!("sh {}", script.display())).unwrap();
        assert_eq!(scorer.score(Path::new("/tmp/plant.jpg")).unwrap(), 6.5);

        let mut failing = CommandScorer::parse("false").unwrap();
        assert!(failing.score(Path::new("/tmp/plant.jpg")).is_err());
    }
}
