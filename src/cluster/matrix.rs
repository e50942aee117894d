//! Pairwise distance matrix input.
//!
//! Two layouts are read: a square TSV (header row of names, then one row per
//! sample whose first field is its name), and the long pairwise listing that
//! `mash dist` prints (`ref  query  distance  p-value  shared-hashes`).

use crate::error::{Error, Result};
use crate::mlog_debug;
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::Path;

/// Extensions dropped from matrix names, innermost last.
const SEQUENCE_EXTENSIONS: &[&str] = &[
    "gz", "bz2", "xz", "msh", "fastq", "fq", "fasta", "fa", "fna", "ffn",
];

/// A symmetric, zero-diagonal distance matrix with named rows.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatrix {
    ids: Vec<String>,
    distances: Array2<f64>,
}

impl DistanceMatrix {
    /// Build a matrix from ids and a square array.
    ///
    /// The array is symmetrized as `(D + Dᵀ) / 2` and its diagonal zeroed.
    pub fn new(ids: Vec<String>, distances: Array2<f64>) -> Result<Self> {
        let n = ids.len();
        if distances.nrows() != n || distances.ncols() != n {
            return Err(Error::MalformedInput(format!(
                "distance matrix is {}x{} but names {} samples",
                distances.nrows(),
                distances.ncols(),
                n
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for id in &ids {
            if !seen.insert(id.as_str()) {
                return Err(Error::MalformedInput(format!(
                    "sample {} appears twice in the distance matrix",
                    id
                )));
            }
        }
        for ((i, j), &d) in distances.indexed_iter() {
            if !d.is_finite() || d < 0.0 {
                return Err(Error::MalformedInput(format!(
                    "distance between {} and {} is {}; expected a finite non-negative number",
                    ids[i], ids[j], d
                )));
            }
        }

        let transposed = distances.t().to_owned();
        let mut symmetric = (&distances + &transposed) * 0.5;
        symmetric.diag_mut().fill(0.0);
        Ok(Self {
            ids,
            distances: symmetric,
        })
    }

    /// Read a distance file in either layout.
    pub fn from_tsv(path: &Path) -> Result<Self> {
        mlog_debug!("DistanceMatrix::from_tsv path={}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse a distance table, detecting the layout from its first line.
    pub fn parse(text: &str) -> Result<Self> {
        let first = text
            .lines()
            .find(|l| !l.trim().is_empty() && !l.starts_with('#'))
            .ok_or_else(|| Error::MalformedInput("distance matrix is empty".to_string()))?;
        let fields: Vec<&str> = first.split('\t').collect();
        // A square header starts with the corner cell; a mash line with a
        // name and ends with `shared/total` hashes.
        let pairwise = fields.len() == 5
            && !fields[0].trim().is_empty()
            && fields[2].trim().parse::<f64>().is_ok()
            && is_hash_ratio(fields[4]);
        if pairwise {
            Self::parse_pairs(text)
        } else {
            Self::parse_square(text)
        }
    }

    /// Parse a square TSV with a header row.
    pub fn parse_square(text: &str) -> Result<Self> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| Error::MalformedInput("distance matrix is empty".to_string()))?;
        // The corner cell is ignored.
        let columns: Vec<String> = header.split('\t').skip(1).map(clean_name).collect();
        let n = columns.len();
        if n == 0 {
            return Err(Error::MalformedInput(
                "distance matrix header names no samples".to_string(),
            ));
        }

        let mut ids = Vec::with_capacity(n);
        let mut distances = Array2::<f64>::zeros((n, n));
        for (row, line) in lines.enumerate() {
            if row >= n {
                return Err(Error::MalformedInput(format!(
                    "distance matrix has more rows than its {} columns",
                    n
                )));
            }
            let mut fields = line.split('\t');
            let name = fields.next().map(clean_name).unwrap_or_default();
            let cells: Vec<&str> = fields.collect();
            if cells.len() != n {
                return Err(Error::MalformedInput(format!(
                    "row {} of the distance matrix has {} cells, expected {}",
                    name,
                    cells.len(),
                    n
                )));
            }
            for (col, cell) in cells.iter().enumerate() {
                distances[[row, col]] = parse_distance(cell, &name)?;
            }
            ids.push(name);
        }

        if ids.len() != n {
            return Err(Error::MalformedInput(format!(
                "distance matrix has {} rows but {} columns",
                ids.len(),
                n
            )));
        }
        if ids != columns {
            return Err(Error::MalformedInput(
                "distance matrix row names do not match its column names".to_string(),
            ));
        }
        Self::new(ids, distances)
    }

    /// Parse `mash dist` output. Every pair must be present in at least one
    /// direction.
    pub fn parse_pairs(text: &str) -> Result<Self> {
        let mut pairs: BTreeMap<(String, String), f64> = BTreeMap::new();
        let mut names = std::collections::BTreeSet::new();
        for line in text.lines() {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 3 {
                return Err(Error::MalformedInput(format!(
                    "pairwise distance line has {} fields: {}",
                    fields.len(),
                    line
                )));
            }
            let a = clean_name(fields[0]);
            let b = clean_name(fields[1]);
            let d = parse_distance(fields[2], &a)?;
            names.insert(a.clone());
            names.insert(b.clone());
            pairs.insert((a, b), d);
        }

        let ids: Vec<String> = names.into_iter().collect();
        let n = ids.len();
        let mut distances = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let forward = pairs.get(&(ids[i].clone(), ids[j].clone()));
                let backward = pairs.get(&(ids[j].clone(), ids[i].clone()));
                distances[[i, j]] = match (forward, backward) {
                    (Some(&d), _) | (None, Some(&d)) => d,
                    (None, None) => {
                        return Err(Error::MalformedInput(format!(
                            "no distance between {} and {}",
                            ids[i], ids[j]
                        )))
                    }
                };
            }
        }
        Self::new(ids, distances)
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.distances[[i, j]]
    }

    pub fn distances(&self) -> &Array2<f64> {
        &self.distances
    }

    /// Write as a square TSV.
    pub fn to_tsv(&self) -> String {
        let mut out = String::from("sample");
        for id in &self.ids {
            out.push('\t');
            out.push_str(id);
        }
        out.push('\n');
        for (i, id) in self.ids.iter().enumerate() {
            out.push_str(id);
            for j in 0..self.len() {
                out.push_str(&format!("\t{}", self.distances[[i, j]]));
            }
            out.push('\n');
        }
        out
    }
}

fn is_hash_ratio(cell: &str) -> bool {
    cell.trim()
        .split_once('/')
        .is_some_and(|(shared, total)| shared.parse::<u64>().is_ok() && total.parse::<u64>().is_ok())
}

fn parse_distance(cell: &str, row: &str) -> Result<f64> {
    cell.trim().parse::<f64>().map_err(|_| {
        Error::MalformedInput(format!(
            "distance \"{}\" in row {} is not a number",
            cell.trim(),
            row
        ))
    })
}

/// Normalize a matrix name: drop directories and sequence-file extensions.
///
/// `/data/sub/S10_1.fastq.gz` becomes `S10_1`.
pub fn clean_name(raw: &str) -> String {
    let raw = raw.trim();
    let mut name = Path::new(raw)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| raw.to_string());
    while let Some((stem, ext)) = name.rsplit_once('.') {
        if stem.is_empty() || !SEQUENCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            break;
        }
        name = stem.to_string();
    }
    name
}
