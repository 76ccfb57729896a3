//! Property scorers.
//!
//! Property values come from external programs. A row whose SMILES is empty
//! or whose program run fails scores `None`; in CSV output that becomes
//! [`SCORE_SENTINEL`].

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Result};

use crate::config::{Property, RunConfig};
use crate::parallel::ParallelMap;

/// Numeric flag written for rows that could not be scored.
pub const SCORE_SENTINEL: f64 = -100.0;

pub fn to_sentinel(score: Option<f64>) -> f64 {
    score.unwrap_or(SCORE_SENTINEL)
}

/// Reads a CSV value back, mapping the sentinel to `None`.
pub fn from_sentinel(value: f64) -> Option<f64> {
    (value != SCORE_SENTINEL && value.is_finite()).then_some(value)
}

pub trait Scorer: Send + Sync {
    fn property(&self) -> Property;

    /// Scores one molecule, `None` on failure.
    fn score(&self, smiles: &str) -> Option<f64>;
}

/// Scores every SMILES on the pool, keeping input order.
pub fn score_all(scorer: &dyn Scorer, smiles: &[String], pool: &ParallelMap) -> Vec<Option<f64>> {
    let scores = pool.map(smiles, |s| {
        if s.trim().is_empty() {
            None
        } else {
            scorer.score(s.trim())
        }
    });
    let failed = scores.iter().filter(|s| s.is_none()).count();
    log::info!(
        "scored {} molecules for {} ({} failed)",
        smiles.len(),
        scorer.property(),
        failed
    );
    scores
}

fn run(program: &Path, args: &[&str]) -> Option<String> {
    let output = match Command::new(program).args(args).output() {
        Ok(output) => output,
        Err(e) => {
            log::warn!("cannot run {:?}: {}", program, e);
            return None;
        }
    };
    if !output.status.success() {
        log::debug!(
            "{:?} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Invoked as `program <property> <smiles>`; prints one number.
#[derive(Debug, Clone)]
pub struct CommandScorer {
    program: PathBuf,
    property: Property,
}

impl CommandScorer {
    pub fn new(program: impl Into<PathBuf>, property: Property) -> Self {
        Self {
            program: program.into(),
            property,
        }
    }
}

impl Scorer for CommandScorer {
    fn property(&self) -> Property {
        self.property
    }

    fn score(&self, smiles: &str) -> Option<f64> {
        let property = self.property.to_string();
        let stdout = run(&self.program, &[property.as_str(), smiles])?;
        stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())?
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
    }
}

/// Invoked as `binary <protein> <smiles>`; the last number printed is the affinity.
#[derive(Debug, Clone)]
pub struct DockingScorer {
    binary: PathBuf,
    protein: PathBuf,
}

impl DockingScorer {
    pub fn new(binary: impl Into<PathBuf>, protein: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            protein: protein.into(),
        }
    }
}

impl Scorer for DockingScorer {
    fn property(&self) -> Property {
        Property::BindingAffinity
    }

    fn score(&self, smiles: &str) -> Option<f64> {
        let protein = self.protein.to_string_lossy().into_owned();
        let stdout = run(&self.binary, &[protein.as_str(), smiles])?;
        stdout
            .split_whitespace()
            .rev()
            .find_map(|token| token.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }
}

/// Builds the scorer for the configured property.
pub fn build_scorer(config: &RunConfig) -> Result<Box<dyn Scorer>> {
    match config.property {
        Property::BindingAffinity => {
            let binary = config
                .docking_binary
                .as_ref()
                .ok_or_else(|| anyhow!("binding_affinity scoring requires docking_binary"))?;
            let protein = config
                .protein_path
                .as_ref()
                .ok_or_else(|| anyhow!("binding_affinity scoring requires protein_path"))?;
            Ok(Box::new(DockingScorer::new(binary, protein)))
        }
        property => {
            let program = config
                .scorer_program
                .as_ref()
                .ok_or_else(|| anyhow!("{} scoring requires scorer_program", property))?;
            Ok(Box::new(CommandScorer::new(program, property)))
        }
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_sentinel_mapping() {
        assert_eq!(to_sentinel(None), -100.0);
        assert_eq!(to_sentinel(Some(1.5)), 1.5);
        assert_eq!(from_sentinel(-100.0), None);
        assert_eq!(from_sentinel(f64::NAN), None);
        assert_eq!(from_sentinel(0.25), Some(0.25));
    }

    #[test]
    fn test_command_scorer() {
        let dir = tempfile::tempdir().unwrap();
        let scorer = CommandScorer::new(length_scorer(dir.path()), Property::Qed);
        assert_eq!(scorer.score("CCO"), Some(3.0));
        assert_eq!(scorer.score("CXO"), None);
    }

    #[test]
    fn test_command_scorer_passes_property_name() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "prop.sh", r#"[ "$1" = "plogp" ] && echo 2.5"#);
        assert_eq!(CommandScorer::new(program, Property::Plogp).score("C"), Some(2.5));
    }

    #[test]
    fn test_docking_scorer_takes_last_number() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "dock.sh", r#"echo "docking $1"; echo "mode 1 affinity -7.25""#);
        let scorer = DockingScorer::new(binary, "receptor.pdbqt");
        assert_eq!(scorer.score("CCO"), Some(-7.25));
    }

    #[test]
    fn test_score_all_keeps_order_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let scorer = CommandScorer::new(length_scorer(dir.path()), Property::Qed);
        let pool = ParallelMap::new(2).unwrap();
        let smiles = vec!["CC".to_string(), String::new(), "CXC".to_string(), "CCCC".to_string()];
        assert_eq!(score_all(&scorer, &smiles, &pool), vec![Some(2.0), None, None, Some(4.0)]);
    }

    #[test]
    fn test_missing_program_is_none() {
        let scorer = CommandScorer::new("/nonexistent/scorer", Property::Qed);
        assert_eq!(scorer.score("C"), None);
    }

    #[test]
    fn test_build_scorer_requires_program() {
        let config = RunConfig::default();
        assert!(build_scorer(&config).is_err());
        let config = RunConfig {
            scorer_program: Some("score".into()),
            ..RunConfig::default()
        };
        assert_eq!(build_scorer(&config).unwrap().property(), Property::Plogp);
    }
}
