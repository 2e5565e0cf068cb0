//! Tab-separated input and output.
//!
//! Matrices have a header row naming the features, preceded by one column of
//! sample identifiers. Label tables have two columns, sample identifier and a
//! numeric label. Selection lists have the header `feature`, `weight`,
//! `tendency`.

use crate::model::{FittedModel, SelectionEntry};
use crate::optimizer::FitError;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use ndarray::{Array1, Array2};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed table: {0}")]
    Csv(#[from] csv::Error),
    #[error("{path}, line {line}: {message}")]
    Parse {
        path: String,
        line: u64,
        message: String,
    },
    #[error("Inconsistent inputs: {0}")]
    Shape(String),
    #[error(transparent)]
    Model(#[from] FitError),
}

/// A samples × features table with its row and column names.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub sample_ids: Vec<String>,
    pub feature_names: Vec<String>,
    pub values: Array2<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelTable {
    pub sample_ids: Vec<String>,
    pub labels: Vec<f64>,
}

fn parse_value(path: &Path, line: u64, field: &str) -> Result<f64, FileError> {
    field.trim().parse::<f64>().map_err(|e| FileError::Parse {
        path: path.display().to_string(),
        line,
        message: format!("'{field}' is not a number ({e})"),
    })
}

fn line_of(record: &StringRecord) -> u64 {
    record.position().map_or(0, |p| p.line())
}

pub fn read_matrix(path: impl AsRef<Path>) -> Result<FeatureMatrix, FileError> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    let feature_names: Vec<String> = reader.headers()?.iter().skip(1).map(str::to_string).collect();
    if feature_names.is_empty() {
        return Err(FileError::Parse {
            path: path.display().to_string(),
            line: 1,
            message: "header names no feature columns".to_string(),
        });
    }

    let mut sample_ids = Vec::new();
    let mut flat = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = line_of(&record);
        let mut fields = record.iter();
        let sample = fields.next().unwrap_or_default().to_string();
        for field in fields {
            flat.push(parse_value(path, line, field)?);
        }
        sample_ids.push(sample);
    }

    let values = Array2::from_shape_vec((sample_ids.len(), feature_names.len()), flat)
        .map_err(|e| FileError::Shape(format!("{}: {e}", path.display())))?;
    log::debug!(
        "Read {} samples x {} features from {}",
        sample_ids.len(),
        feature_names.len(),
        path.display()
    );
    Ok(FeatureMatrix {
        sample_ids,
        feature_names,
        values,
    })
}

pub fn write_matrix(path: impl AsRef<Path>, matrix: &FeatureMatrix) -> Result<(), FileError> {
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    let mut header = vec!["sample_id".to_string()];
    header.extend(matrix.feature_names.iter().cloned());
    writer.write_record(&header)?;
    for (sample, row) in matrix.sample_ids.iter().zip(matrix.values.rows()) {
        let mut fields = vec![sample.clone()];
        fields.extend(row.iter().map(|v| v.to_string()));
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_labels(path: impl AsRef<Path>) -> Result<LabelTable, FileError> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    let mut table = LabelTable {
        sample_ids: Vec::new(),
        labels: Vec::new(),
    };
    for record in reader.records() {
        let record = record?;
        let line = line_of(&record);
        if record.len() < 2 {
            return Err(FileError::Parse {
                path: path.display().to_string(),
                line,
                message: "expected a sample identifier and a label".to_string(),
            });
        }
        table.sample_ids.push(record[0].to_string());
        table.labels.push(parse_value(path, line, &record[1])?);
    }
    Ok(table)
}

/// Reorders `labels` to the row order of `matrix`. Every matrix sample needs a label.
pub fn align_labels(matrix: &FeatureMatrix, labels: &LabelTable) -> Result<Array1<f64>, FileError> {
    let by_sample: HashMap<&str, f64> = labels
        .sample_ids
        .iter()
        .map(String::as_str)
        .zip(labels.labels.iter().copied())
        .collect();
    matrix
        .sample_ids
        .iter()
        .map(|sample| {
            by_sample
                .get(sample.as_str())
                .copied()
                .ok_or_else(|| FileError::Shape(format!("sample '{sample}' has no label")))
        })
        .collect()
}

/// Checks that two matrices describe the same samples and features in the same order.
pub fn check_same_layout(first: &FeatureMatrix, second: &FeatureMatrix) -> Result<(), FileError> {
    if first.sample_ids != second.sample_ids {
        return Err(FileError::Shape(
            "matrices list different samples or a different sample order".to_string(),
        ));
    }
    if first.feature_names != second.feature_names {
        return Err(FileError::Shape(
            "matrices list different features or a different feature order".to_string(),
        ));
    }
    Ok(())
}

/// Writes the nonzero features of `model` in ranking order. Returns the number of rows written.
pub fn write_selection_list(
    path: impl AsRef<Path>,
    model: &FittedModel,
    feature_names: &[String],
) -> Result<usize, FileError> {
    let entries = model.selection_list(feature_names)?;
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    for entry in &entries {
        writer.serialize(entry)?;
    }
    if entries.is_empty() {
        writer.write_record(["feature", "weight", "tendency"])?;
    }
    writer.flush()?;
    Ok(entries.len())
}

pub fn read_selection_list(path: impl AsRef<Path>) -> Result<Vec<SelectionEntry>, FileError> {
    let mut reader = ReaderBuilder::new().delimiter(b'\t').from_path(path)?;
    let mut entries = Vec::new();
    for entry in reader.deserialize() {
        entries.push(entry?);
    }
    Ok(entries)
}
