//! Persistence of per-lambda tuning records.
//!
//! A record is written once every fold of its lambda has finished. The
//! directory sink stores one JSON document per lambda and publishes it with a
//! rename, so a concurrent reader sees either the whole record or none of it.

use super::tuner::{LambdaRecord, TuningResult};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const RECORD_PREFIX: &str = "lambda_";
const RECORD_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error in tuning output: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to (de)serialize tuning record {path}: {source}")]
    Serialization {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("No tuning results found: {0}")]
    NotFound(String),
}

/// Destination for finished lambda records.
pub trait TuningSink {
    fn write_record(&mut self, record: &LambdaRecord) -> Result<(), SinkError>;

    /// Records already persisted, used to resume an interrupted run.
    fn completed(&self) -> Result<Vec<LambdaRecord>, SinkError>;
}

/// Keeps records in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Vec<LambdaRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[LambdaRecord] {
        &self.records
    }
}

impl TuningSink for MemorySink {
    fn write_record(&mut self, record: &LambdaRecord) -> Result<(), SinkError> {
        self.records.retain(|existing| existing.index != record.index);
        self.records.push(record.clone());
        Ok(())
    }

    fn completed(&self) -> Result<Vec<LambdaRecord>, SinkError> {
        Ok(self.records.clone())
    }
}

/// One `lambda_<index>.json` file per lambda inside a directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Opens `dir` for writing, creating it if needed.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("{RECORD_PREFIX}{index:04}.{RECORD_EXTENSION}"))
    }
}

impl TuningSink for DirectorySink {
    fn write_record(&mut self, record: &LambdaRecord) -> Result<(), SinkError> {
        let target = self.record_path(record.index);
        let staging = target.with_extension("partial");
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            serde_json::to_writer_pretty(&mut writer, record).map_err(|source| {
                SinkError::Serialization {
                    path: staging.display().to_string(),
                    source,
                }
            })?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&staging, &target)?;
        log::debug!("Wrote tuning record {}", target.display());
        Ok(())
    }

    fn completed(&self) -> Result<Vec<LambdaRecord>, SinkError> {
        read_records(&self.dir)
    }
}

fn is_record_file(path: &Path) -> bool {
    let named = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(RECORD_PREFIX));
    named && path.extension().and_then(|ext| ext.to_str()) == Some(RECORD_EXTENSION)
}

fn read_records(dir: &Path) -> Result<Vec<LambdaRecord>, SinkError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_record_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .iter()
        .map(|path| {
            let reader = BufReader::new(File::open(path)?);
            serde_json::from_reader(reader).map_err(|source| SinkError::Serialization {
                path: path.display().to_string(),
                source,
            })
        })
        .collect()
}

/// Reassembles a tuning run from the records persisted under `path`.
///
/// Fails with `NotFound` when the directory is missing, holds no records, or
/// holds a record that cannot be parsed.
pub fn get_tuning_result(path: impl AsRef<Path>) -> Result<TuningResult, SinkError> {
    let dir = path.as_ref();
    if !dir.is_dir() {
        return Err(SinkError::NotFound(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }
    let records = match read_records(dir) {
        Ok(records) => records,
        Err(SinkError::Serialization { path, source }) => {
            return Err(SinkError::NotFound(format!(
                "malformed record '{path}': {source}"
            )));
        }
        Err(other) => return Err(other),
    };
    if records.is_empty() {
        return Err(SinkError::NotFound(format!(
            "'{}' contains no {RECORD_PREFIX}*.{RECORD_EXTENSION} records",
            dir.display()
        )));
    }
    Ok(TuningResult::from_records(records))
}
