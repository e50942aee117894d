//! Sample registry: the fan-out key set of a run.
//!
//! A sample map is a JSON object keyed by sample identifier. Each entry names
//! its input files by role; `forward` is mandatory and `reverse` is optional.
//! The grouped form produced by directory staging (`{"min_reads", "above",
//! "below"}`) is accepted too, in which case only `above` entries fan out.

use crate::error::{Error, Result};
use crate::mlog_debug;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Mandatory input role.
pub const FORWARD: &str = "forward";
/// Optional input role; absent for single-ended samples.
pub const REVERSE: &str = "reverse";

/// A unit of fan-out: an identifier and its named input files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub id: String,
    /// Input files keyed by role.
    pub inputs: BTreeMap<String, PathBuf>,
    /// Read count recorded at staging time, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reads: Option<u64>,
}

impl Sample {
    pub fn input(&self, role: &str) -> Option<&Path> {
        self.inputs.get(role).map(PathBuf::as_path)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.inputs.contains_key(role)
    }

    pub fn is_paired(&self) -> bool {
        self.has_role(REVERSE)
    }
}

/// Staging threshold information carried by a grouped sample map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadThreshold {
    pub min_reads: Option<u64>,
    /// Samples that fell below the threshold and do not fan out.
    pub excluded: Vec<String>,
}

/// Summary of how many staged samples met the read threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdSummary {
    pub reads_threshold: Option<u64>,
    pub n_samples_total: usize,
    pub n_samples_above_threshold: usize,
    pub percent_above_threshold: f64,
    /// 1 = all above, 2 = at least 80% above, 3 = otherwise.
    pub flag: u8,
    pub message: String,
}

/// The immutable set of samples for a run, ordered by identifier.
#[derive(Debug, Clone, Default)]
pub struct SampleRegistry {
    samples: BTreeMap<String, Sample>,
    threshold: Option<ReadThreshold>,
}

impl SampleRegistry {
    /// Load a sample map from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        mlog_debug!("SampleRegistry::load path={}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::MalformedInput(format!("sample map is not valid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| Error::MalformedInput("sample map must be a JSON object".to_string()))?;

        if is_grouped(root) {
            let above = match root.get("above") {
                Some(Value::Object(above)) => above,
                _ => {
                    return Err(Error::MalformedInput(
                        "grouped sample map needs an \"above\" object".to_string(),
                    ))
                }
            };
            let excluded = match root.get("below") {
                Some(Value::Object(below)) => below.keys().cloned().collect(),
                Some(Value::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(Error::MalformedInput(
                        "\"below\" must be an object".to_string(),
                    ))
                }
            };
            let min_reads = root.get("min_reads").and_then(Value::as_u64);
            let samples = parse_entries(above)?;
            return Ok(Self {
                samples,
                threshold: Some(ReadThreshold {
                    min_reads,
                    excluded,
                }),
            });
        }

        Ok(Self {
            samples: parse_entries(root)?,
            threshold: None,
        })
    }

    /// Build a registry directly from samples.
    pub fn from_samples(samples: impl IntoIterator<Item = Sample>) -> Self {
        Self {
            samples: samples.into_iter().map(|s| (s.id.clone(), s)).collect(),
            threshold: None,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Sample> {
        self.samples.get(id)
    }

    /// Samples in lexicographic identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.values()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.samples.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn threshold(&self) -> Option<&ReadThreshold> {
        self.threshold.as_ref()
    }

    /// Read-threshold summary; `None` unless the map came from staging.
    pub fn threshold_summary(&self) -> Option<ThresholdSummary> {
        let threshold = self.threshold.as_ref()?;
        let n_above = self.samples.len();
        let n_total = n_above + threshold.excluded.len();
        let percent = if n_total == 0 {
            0.0
        } else {
            100.0 * n_above as f64 / n_total as f64
        };
        let reads = threshold
            .min_reads
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let (flag, message) = if n_total == 0 {
            (
                3,
                "No samples were found in the input data; cannot evaluate read threshold."
                    .to_string(),
            )
        } else if n_above == n_total {
            (
                1,
                format!(
                    "All samples ({}/{}, {:.1}%) are above the read threshold ({} reads).",
                    n_above, n_total, percent, reads
                ),
            )
        } else if percent >= 80.0 {
            (
                2,
                format!(
                    "Most samples ({}/{}, {:.1}%) are above the read threshold ({} reads), but some are below.",
                    n_above, n_total, percent, reads
                ),
            )
        } else {
            (
                3,
                format!(
                    "Only {}/{} samples ({:.1}%) are above the read threshold ({} reads). \
                     Choose a lower threshold with -r; estimations will be less accurate.",
                    n_above, n_total, percent, reads
                ),
            )
        };

        Some(ThresholdSummary {
            reads_threshold: threshold.min_reads,
            n_samples_total: n_total,
            n_samples_above_threshold: n_above,
            percent_above_threshold: percent,
            flag,
            message,
        })
    }

    /// Anchor relative input paths at `base`.
    ///
    /// Steps run inside the output root, so inputs named relative to the
    /// sample map's directory must be made absolute before binding.
    pub fn absolutize(mut self, base: &Path) -> Self {
        for sample in self.samples.values_mut() {
            for path in sample.inputs.values_mut() {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }
        self
    }
}

fn is_grouped(root: &Map<String, Value>) -> bool {
    root.contains_key("above")
        && root
            .keys()
            .all(|k| matches!(k.as_str(), "above" | "below" | "min_reads"))
}

fn parse_entries(entries: &Map<String, Value>) -> Result<BTreeMap<String, Sample>> {
    let mut samples = BTreeMap::new();
    for (id, entry) in entries {
        let sample = parse_entry(id, entry)?;
        samples.insert(id.clone(), sample);
    }
    Ok(samples)
}

fn parse_entry(id: &str, entry: &Value) -> Result<Sample> {
    if id.trim().is_empty() {
        return Err(Error::MalformedInput("empty sample identifier".to_string()));
    }
    let fields = entry.as_object().ok_or_else(|| {
        Error::MalformedInput(format!("sample {} must map to an object of input files", id))
    })?;

    let mut inputs = BTreeMap::new();
    let mut reads = None;
    for (key, value) in fields {
        match (key.as_str(), value) {
            ("reads", v) => reads = v.as_u64(),
            (_, Value::String(path)) if !path.is_empty() => {
                inputs.insert(key.clone(), PathBuf::from(path));
            }
            (REVERSE, Value::Null) => {}
            (FORWARD | REVERSE, _) => {
                return Err(Error::MalformedInput(format!(
                    "sample {}: \"{}\" must be a path string",
                    id, key
                )))
            }
            // Staging annotations such as "reads_estimated".
            _ => {}
        }
    }

    if !inputs.contains_key(FORWARD) {
        return Err(Error::MalformedInput(format!(
            "sample {} lacks mandatory input \"{}\"",
            id, FORWARD
        )));
    }

    Ok(Sample {
        id: id.to_string(),
        inputs,
        reads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_flat_map_sorted() {
        let registry = SampleRegistry::from_json_str(
            r#"{"B": {"forward": "b_1.fq", "reverse": "b_2.fq"}, "A": {"forward": "a.fq"}}"#,
        )
        .unwrap();
        assert_eq!(registry.ids(), vec!["A", "B"]);
        assert!(!registry.get("A").unwrap().is_paired());
        assert!(registry.get("B").unwrap().is_paired());
        assert_eq!(
            registry.get("B").unwrap().input(REVERSE),
            Some(Path::new("b_2.fq"))
        );
        assert!(registry.threshold_summary().is_none());
    }

    #[test]
    fn test_missing_forward_is_malformed() {
        let err = SampleRegistry::from_json_str(r#"{"A": {"reverse": "a_2.fq"}}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));
        assert!(err.to_string().contains("forward"));
    }

    #[test]
    fn test_not_a_mapping_of_mappings() {
        assert!(matches!(
            SampleRegistry::from_json_str(r#"["a.fq"]"#),
            Err(Error::MalformedInput(_))
        ));
        assert!(matches!(
            SampleRegistry::from_json_str(r#"{"A": "a.fq"}"#),
            Err(Error::MalformedInput(_))
        ));
        assert!(matches!(
            SampleRegistry::from_json_str(r#"{"A": {"forward": 3}}"#),
            Err(Error::MalformedInput(_))
        ));
        assert!(matches!(
            SampleRegistry::from_json_str("not json"),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_null_reverse_is_single_ended() {
        let registry =
            SampleRegistry::from_json_str(r#"{"A": {"forward": "a.fq", "reverse": null}}"#)
                .unwrap();
        assert!(!registry.get("A").unwrap().is_paired());
    }

    #[test]
    fn test_grouped_map_fans_out_above_only() {
        let registry = SampleRegistry::from_json_str(
            r#"{
                "min_reads": 1000,
                "above": {
                    "S2": {"forward": "s2_1.fq", "reverse": "s2_2.fq", "reads": 5000},
                    "S1": {"forward": "s1_1.fq", "reads": 2000, "reads_estimated": true}
                },
                "below": {"S3": {"forward": "s3_1.fq", "reads": 10}}
            }"#,
        )
        .unwrap();
        assert_eq!(registry.ids(), vec!["S1", "S2"]);
        assert_eq!(registry.get("S2").unwrap().reads, Some(5000));
        let threshold = registry.threshold().unwrap();
        assert_eq!(threshold.min_reads, Some(1000));
        assert_eq!(threshold.excluded, vec!["S3".to_string()]);
    }

    #[test]
    fn test_sample_named_above_is_not_grouped() {
        let registry = SampleRegistry::from_json_str(
            r#"{"above": {"forward": "x.fq"}, "other": {"forward": "y.fq"}}"#,
        )
        .unwrap();
        assert_eq!(registry.ids(), vec!["above", "other"]);
    }

    #[test]
    fn test_threshold_summary_flags() {
        let all_above = SampleRegistry::from_json_str(
            r#"{"min_reads": 10, "above": {"A": {"forward": "a.fq"}}, "below": {}}"#,
        )
        .unwrap();
        assert_eq!(all_above.threshold_summary().unwrap().flag, 1);

        let mostly_above = SampleRegistry::from_json_str(
            r#"{"min_reads": 10,
                "above": {"A": {"forward": "a"}, "B": {"forward": "b"}, "C": {"forward": "c"}, "D": {"forward": "d"}},
                "below": {"E": {"forward": "e"}}}"#,
        )
        .unwrap();
        let summary = mostly_above.threshold_summary().unwrap();
        assert_eq!(summary.flag, 2);
        assert_eq!(summary.n_samples_total, 5);
        assert!((summary.percent_above_threshold - 80.0).abs() < 1e-9);

        let few_above = SampleRegistry::from_json_str(
            r#"{"min_reads": 10, "above": {"A": {"forward": "a"}},
                "below": {"B": {"forward": "b"}, "C": {"forward": "c"}}}"#,
        )
        .unwrap();
        assert_eq!(few_above.threshold_summary().unwrap().flag, 3);
    }

    #[test]
    fn test_absolutize_anchors_relative_inputs() {
        let registry = SampleRegistry::from_json_str(
            r#"{"A": {"forward": "reads/a_1.fq", "reverse": "/abs/a_2.fq"}}"#,
        )
        .unwrap()
        .absolutize(Path::new("/data"));
        let a = registry.get("A").unwrap();
        assert_eq!(a.input(FORWARD), Some(Path::new("/data/reads/a_1.fq")));
        assert_eq!(a.input(REVERSE), Some(Path::new("/abs/a_2.fq")));
    }
}
