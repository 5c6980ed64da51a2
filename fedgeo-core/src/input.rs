//! Loaders for the plain text inputs consumed by the binaries.
//!
//! Every file starts with a line holding the number of entries, followed by
//! that many entry lines:
//!
//! ```text
//! records:    id x y
//! queries:    RangeQuery x y radius      (circle)
//!             RangeCount x y dx dy       (rectangle, half extents)
//! addresses:  host:port
//! ```

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use thiserror::Error;
use tracing::debug;

use crate::types::{Circle, QueryKind, QueryShape, Record, Rectangle, SpatialQuery};

#[derive(Debug, Error)]
pub enum InputError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("{path}: header announces {expected} entries but only {found} present")]
    Truncated {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}

pub fn load_records(path: &Path) -> Result<Vec<Record>, InputError> {
    let records = parse_records(path, &read(path)?)?;
    debug!(path = %path.display(), records = records.len(), "loaded record file");
    Ok(records)
}

pub fn load_queries(path: &Path) -> Result<Vec<SpatialQuery>, InputError> {
    let queries = parse_entries(path, &read(path)?, parse_query)?;
    debug!(path = %path.display(), queries = queries.len(), "loaded query file");
    Ok(queries)
}

pub fn load_addresses(path: &Path) -> Result<Vec<String>, InputError> {
    parse_entries(path, &read(path)?, |fields| match fields {
        [address] => Ok((*address).to_owned()),
        _ => Err(format!("expected one address, found {} fields", fields.len())),
    })
}

/// Record ids must be unique within one file.
pub fn parse_records(path: &Path, contents: &str) -> Result<Vec<Record>, InputError> {
    let entries = parse_lines(path, contents, parse_record)?;
    let mut first_seen = HashMap::with_capacity(entries.len());
    for (line, record) in &entries {
        if let Some(first) = first_seen.insert(record.id, *line) {
            return Err(InputError::Malformed {
                path: path.to_path_buf(),
                line: *line,
                reason: format!("record id {} already used on line {first}", record.id),
            });
        }
    }
    Ok(entries.into_iter().map(|(_, record)| record).collect())
}

pub fn parse_queries(path: &Path, contents: &str) -> Result<Vec<SpatialQuery>, InputError> {
    parse_entries(path, contents, parse_query)
}

fn read(path: &Path) -> Result<String, InputError> {
    fs::read_to_string(path).map_err(|source| InputError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_entries<T>(
    path: &Path,
    contents: &str,
    parse: impl Fn(&[&str]) -> Result<T, String>,
) -> Result<Vec<T>, InputError> {
    let entries = parse_lines(path, contents, parse)?;
    Ok(entries.into_iter().map(|(_, entry)| entry).collect())
}

/// Entries paired with the 1-based line they came from.
fn parse_lines<T>(
    path: &Path,
    contents: &str,
    parse: impl Fn(&[&str]) -> Result<T, String>,
) -> Result<Vec<(usize, T)>, InputError> {
    let malformed = |line: usize, reason: String| InputError::Malformed {
        path: path.to_path_buf(),
        line,
        reason,
    };
    let mut lines = contents
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty());

    let expected = match lines.next() {
        Some((line_no, header)) => header
            .parse::<usize>()
            .map_err(|_| malformed(line_no, format!("invalid entry count {header:?}")))?,
        None => return Ok(Vec::new()),
    };

    let mut entries = Vec::with_capacity(expected);
    for (line_no, line) in lines.take(expected) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let entry = parse(&fields).map_err(|reason| malformed(line_no, reason))?;
        entries.push((line_no, entry));
    }
    if entries.len() < expected {
        return Err(InputError::Truncated {
            path: path.to_path_buf(),
            expected,
            found: entries.len(),
        });
    }
    Ok(entries)
}

fn number<T: FromStr>(field: &str) -> Result<T, String> {
    field
        .parse::<T>()
        .map_err(|_| format!("invalid number {field:?}"))
}

/// Coordinates and extents: any finite value of `T`.
fn finite<T: FromStr + Copy + Into<f64>>(field: &str) -> Result<T, String> {
    let value: T = number(field)?;
    if value.into().is_finite() {
        Ok(value)
    } else {
        Err(format!("{field:?} is not a finite number"))
    }
}

fn parse_record(fields: &[&str]) -> Result<Record, String> {
    match fields {
        [id, x, y] => {
            let id: i32 = number(id)?;
            if id < 0 {
                return Err(format!("record id {id} is reserved"));
            }
            Ok(Record::new(id, finite(x)?, finite(y)?))
        }
        _ => Err(format!("expected `id x y`, found {} fields", fields.len())),
    }
}

fn parse_query(fields: &[&str]) -> Result<SpatialQuery, String> {
    let (kind, rest) = fields
        .split_first()
        .ok_or_else(|| "empty query line".to_owned())?;
    let kind = QueryKind::from_str(kind).map_err(|err| err.to_string())?;
    let shape = match rest {
        [x, y, radius] => {
            let radius: f64 = finite(radius)?;
            if radius < 0.0 {
                return Err("radius must be non-negative".into());
            }
            QueryShape::Circle(Circle::new(finite(x)?, finite(y)?, radius))
        }
        [x, y, dx, dy] => {
            let (dx, dy): (f64, f64) = (finite(dx)?, finite(dy)?);
            if dx < 0.0 || dy < 0.0 {
                return Err("rectangle half extents must be non-negative".into());
            }
            QueryShape::Rectangle(Rectangle::new(finite(x)?, finite(y)?, dx, dy))
        }
        _ => {
            return Err(format!(
                "expected `kind x y radius` or `kind x y dx dy`, found {} fields",
                fields.len()
            ))
        }
    };
    Ok(SpatialQuery { kind, shape })
}
