//! Directory staging: discover FASTQ files, pair them into samples, count
//! reads and split the samples at a read threshold.
//!
//! The result is written in the grouped sample-map form that
//! `SampleRegistry` loads.

use crate::error::{Error, Result};
use crate::util::blocking;
use crate::{mlog, mlog_debug, mlog_warn};
use flate2::read::MultiGzDecoder;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// How reads are counted for paired samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadCountMode {
    /// Count both files of a pair.
    #[default]
    Exact,
    /// Count the forward file only and assume the reverse matches.
    AssumePairedEqual,
}

/// A discovered sample with its read count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedSample {
    #[serde(skip)]
    pub id: String,
    pub forward: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse: Option<PathBuf>,
    pub reads: u64,
    /// The reverse count was assumed, not measured.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reads_estimated: bool,
}

/// Staged samples split at `min_reads`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSamples {
    pub min_reads: u64,
    /// `reads >= min_reads`, by id.
    pub above: Vec<StagedSample>,
    pub below: Vec<StagedSample>,
}

#[derive(Serialize)]
struct GroupedMap<'a> {
    min_reads: u64,
    above: BTreeMap<&'a str, &'a StagedSample>,
    below: BTreeMap<&'a str, &'a StagedSample>,
}

impl StagedSamples {
    pub fn len(&self) -> usize {
        self.above.len() + self.below.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        let grouped = GroupedMap {
            min_reads: self.min_reads,
            above: self.above.iter().map(|s| (s.id.as_str(), s)).collect(),
            below: self.below.iter().map(|s| (s.id.as_str(), s)).collect(),
        };
        Ok(serde_json::to_value(grouped)?)
    }

    /// Write the grouped sample map.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.to_value()?)?)?;
        mlog!(
            "Staged {} samples ({} >= {} reads, {} below) to {}",
            self.len(),
            self.above.len(),
            self.min_reads,
            self.below.len(),
            path.display()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Forward,
    Reverse,
}

/// Split a FASTQ file name into its sample id and read end.
///
/// `S1_R1.fastq.gz` and `S1_1.fq` are the forward end of `S1`; `_R2` and `_2`
/// mark the reverse end. A FASTQ name without a marker is a single-ended
/// sample. Non-FASTQ names give `None`.
fn split_name(file_name: &str) -> Option<(String, End)> {
    let lower = file_name.to_ascii_lowercase();
    let without_gz = if lower.ends_with(".gz") {
        &file_name[..file_name.len() - 3]
    } else {
        file_name
    };
    let lower_stem = without_gz.to_ascii_lowercase();
    let stem = [".fastq", ".fq"]
        .iter()
        .find(|ext| lower_stem.ends_with(*ext))
        .map(|ext| &without_gz[..without_gz.len() - ext.len()])?;

    for (marker, end) in [
        ("_R1", End::Forward),
        ("_1", End::Forward),
        ("_R2", End::Reverse),
        ("_2", End::Reverse),
    ] {
        if let Some(id) = stem.strip_suffix(marker) {
            if !id.is_empty() {
                return Some((id.to_string(), end));
            }
        }
    }
    (!stem.is_empty()).then(|| (stem.to_string(), End::Forward))
}

/// Walk `dir` recursively and pair FASTQ files into samples.
fn discover(dir: &Path) -> Result<BTreeMap<String, (Option<PathBuf>, Option<PathBuf>)>> {
    if !dir.is_dir() {
        return Err(Error::MalformedInput(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut pairs: BTreeMap<String, (Option<PathBuf>, Option<PathBuf>)> = BTreeMap::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                mlog_warn!("Skipping unreadable entry under {}: {}", dir.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let Some((id, end)) = split_name(&name) else {
            continue;
        };
        let path = std::path::absolute(entry.path())?;
        let slot = pairs.entry(id.clone()).or_default();
        let target = match end {
            End::Forward => &mut slot.0,
            End::Reverse => &mut slot.1,
        };
        if let Some(previous) = target.replace(path) {
            return Err(Error::MalformedInput(format!(
                "sample {} has two {:?} files: {} and {}",
                id,
                end,
                previous.display(),
                entry.path().display()
            )));
        }
    }

    if pairs.is_empty() {
        return Err(Error::MalformedInput(format!(
            "no FASTQ files found in {}",
            dir.display()
        )));
    }
    Ok(pairs)
}

/// Count reads in a FASTQ file (lines / 4). Gzip is detected by extension.
pub fn count_reads(path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let gz = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"));
    let reader: Box<dyn Read> = if gz {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut lines = 0u64;
    let mut buf = Vec::with_capacity(256);
    let mut reader = BufReader::new(reader);
    while reader.read_until(b'\n', &mut buf)? > 0 {
        lines += 1;
        buf.clear();
    }
    Ok(lines / 4)
}

/// Discover, count and bucket every sample under `dir`.
///
/// Files are counted on the blocking pool, at most `workers` at a time.
pub async fn stage_directory(
    dir: &Path,
    min_reads: u64,
    mode: ReadCountMode,
    workers: usize,
) -> Result<StagedSamples> {
    let pairs = discover(dir)?;
    mlog!("Found {} samples under {}", pairs.len(), dir.display());

    let mut jobs = Vec::with_capacity(pairs.len());
    for (id, (forward, reverse)) in pairs {
        let Some(forward) = forward else {
            return Err(Error::MalformedInput(format!(
                "sample {} has a reverse file but no forward file",
                id
            )));
        };
        jobs.push((id, forward, reverse));
    }

    let counted: Vec<StagedSample> = stream::iter(jobs)
        .map(|(id, forward, reverse)| {
            blocking(move || {
                let reads = count_reads(&forward)?;
                mlog_debug!("Staging sample {}: {} reads", id, reads);
                let estimated = reverse.is_some() && mode == ReadCountMode::AssumePairedEqual;
                if let (Some(rev), ReadCountMode::Exact) = (&reverse, mode) {
                    let reverse_reads = count_reads(rev)?;
                    if reverse_reads != reads {
                        mlog_warn!(
                            "Sample {}: forward has {} reads but reverse has {}",
                            id,
                            reads,
                            reverse_reads
                        );
                    }
                }
                Ok(StagedSample {
                    id,
                    forward,
                    reverse,
                    reads,
                    reads_estimated: estimated,
                })
            })
        })
        .buffer_unordered(workers.max(1))
        .try_collect()
        .await?;

    let (mut above, mut below): (Vec<_>, Vec<_>) =
        counted.into_iter().partition(|s| s.reads >= min_reads);
    above.sort_by(|a, b| a.id.cmp(&b.id));
    below.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(StagedSamples {
        min_reads,
        above,
        below,
    })
}
