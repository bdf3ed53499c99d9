//! Columnar view of an evaluation memory, for reporting and persistence.
//!
//! Layout: one column per parameter (decoded values, in dimension order),
//! then `score`, then one nullable column per extra metric in first-seen
//! order. Parameters whose candidates are all integers map to `Int64`, all
//! floats to `Float64`, anything else to `Utf8` holding compact JSON.

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use hf_types::{
    Evaluation, HfError, HfResult, MemoryError, ParameterDef, ParameterSpace, ParameterValue,
    Position,
};

use crate::memory::Memory;

pub const SCORE_COLUMN: &str = "score";

fn arrow_error(e: ArrowError) -> HfError {
    HfError::Arrow(e.to_string())
}

fn parquet_error(e: ParquetError) -> HfError {
    HfError::Parquet(e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Int,
    Float,
    Json,
}

impl ColumnKind {
    fn of(param: &ParameterDef) -> Self {
        if param.values.iter().all(|v| matches!(v, ParameterValue::Int(_))) {
            Self::Int
        } else if param.values.iter().all(|v| matches!(v, ParameterValue::Float(_))) {
            Self::Float
        } else {
            Self::Json
        }
    }

    fn data_type(self) -> DataType {
        match self {
            Self::Int => DataType::Int64,
            Self::Float => DataType::Float64,
            Self::Json => DataType::Utf8,
        }
    }
}

fn encode_json(value: &ParameterValue) -> String {
    value.to_json().to_string()
}

/// A memory rendered as an arrow record batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTable {
    batch: RecordBatch,
}

impl MemoryTable {
    pub fn from_memory(space: &ParameterSpace, memory: &dyn Memory) -> HfResult<Self> {
        Self::from_entries(space, &memory.entries())
    }

    /// Build the table from `(position, evaluation)` pairs. Repeated
    /// positions keep their first occurrence.
    pub fn from_entries(
        space: &ParameterSpace,
        entries: &[(Position, Evaluation)],
    ) -> HfResult<Self> {
        let mut seen = std::collections::HashSet::new();
        let rows: Vec<&(Position, Evaluation)> = entries
            .iter()
            .filter(|(position, _)| seen.insert(position.clone()))
            .collect();

        for (position, _) in &rows {
            if !space.contains(position) {
                return Err(MemoryError::PositionOutOfSpace {
                    position: position.clone(),
                }
                .into());
            }
        }

        let mut metric_names: Vec<String> = Vec::new();
        for (_, evaluation) in &rows {
            for name in evaluation.metrics.keys() {
                if !metric_names.contains(name) {
                    metric_names.push(name.clone());
                }
            }
        }

        let mut fields = Vec::with_capacity(space.dimensions() + 1 + metric_names.len());
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.capacity());

        for (dim, param) in space.parameters.iter().enumerate() {
            let kind = ColumnKind::of(param);
            fields.push(Field::new(&param.name, kind.data_type(), false));
            let values = rows
                .iter()
                .map(|(position, _)| &param.values[position.indices()[dim]]);
            let column: ArrayRef = match kind {
                ColumnKind::Int => Arc::new(Int64Array::from(
                    values.map(|v| v.as_i64().unwrap_or_default()).collect::<Vec<_>>(),
                )),
                ColumnKind::Float => Arc::new(Float64Array::from(
                    values.map(|v| v.as_f64().unwrap_or_default()).collect::<Vec<_>>(),
                )),
                ColumnKind::Json => Arc::new(StringArray::from(
                    values.map(encode_json).collect::<Vec<_>>(),
                )),
            };
            columns.push(column);
        }

        fields.push(Field::new(SCORE_COLUMN, DataType::Float64, false));
        columns.push(Arc::new(Float64Array::from(
            rows.iter().map(|(_, e)| e.score).collect::<Vec<_>>(),
        )));

        for name in &metric_names {
            fields.push(Field::new(name, DataType::Float64, true));
            columns.push(Arc::new(Float64Array::from(
                rows.iter().map(|(_, e)| e.metric(name)).collect::<Vec<_>>(),
            )));
        }

        let batch =
            RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(arrow_error)?;
        Ok(Self { batch })
    }

    /// Decode every row back into `(position, evaluation)` pairs.
    pub fn to_entries(&self, space: &ParameterSpace) -> HfResult<Vec<(Position, Evaluation)>> {
        let schema = self.batch.schema();
        let dims = space.dimensions();
        let rows = self.batch.num_rows();

        if schema.fields().len() <= dims {
            return Err(MemoryError::MissingColumn {
                column: SCORE_COLUMN.to_string(),
            }
            .into());
        }

        let mut positions: Vec<Vec<usize>> = vec![Vec::with_capacity(dims); rows];
        for (dim, param) in space.parameters.iter().enumerate() {
            let field = schema.field(dim);
            if field.name() != &param.name {
                return Err(MemoryError::MissingColumn {
                    column: param.name.clone(),
                }
                .into());
            }
            let indices = decode_parameter_column(param, self.batch.column(dim))?;
            for (row, index) in indices.into_iter().enumerate() {
                positions[row].push(index);
            }
        }

        if schema.field(dims).name() != SCORE_COLUMN {
            return Err(MemoryError::MissingColumn {
                column: SCORE_COLUMN.to_string(),
            }
            .into());
        }
        let scores = float_column(SCORE_COLUMN, self.batch.column(dims))?;

        let mut metrics: Vec<(&str, &Float64Array)> = Vec::new();
        for col in dims + 1..schema.fields().len() {
            let name = schema.field(col).name().as_str();
            metrics.push((name, float_column(name, self.batch.column(col))?));
        }

        let mut entries = Vec::with_capacity(rows);
        for (row, indices) in positions.into_iter().enumerate() {
            if scores.is_null(row) {
                return Err(MemoryError::NullCell {
                    column: SCORE_COLUMN.to_string(),
                    row,
                }
                .into());
            }
            let mut named = BTreeMap::new();
            for (name, column) in &metrics {
                if !column.is_null(row) {
                    named.insert(name.to_string(), column.value(row));
                }
            }
            entries.push((
                Position::new(indices),
                Evaluation {
                    score: scores.value(row),
                    metrics: named,
                },
            ));
        }
        Ok(entries)
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_batch(self) -> RecordBatch {
        self.batch
    }

    pub fn write_parquet(&self, path: &Path) -> HfResult<()> {
        let file = File::create(path)?;
        let mut writer =
            ArrowWriter::try_new(file, self.batch.schema(), None).map_err(parquet_error)?;
        writer.write(&self.batch).map_err(parquet_error)?;
        writer.close().map_err(parquet_error)?;
        Ok(())
    }

    pub fn read_parquet(path: &Path) -> HfResult<Self> {
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_error)?;
        let schema = builder.schema().clone();
        let reader = builder.build().map_err(parquet_error)?;

        let batches = reader
            .collect::<Result<Vec<_>, _>>()
            .map_err(arrow_error)?;
        let batch = concat_batches(&schema, &batches).map_err(arrow_error)?;
        Ok(Self { batch })
    }
}

fn float_column<'a>(name: &str, column: &'a ArrayRef) -> HfResult<&'a Float64Array> {
    column
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| {
            MemoryError::ColumnType {
                column: name.to_string(),
                found: column.data_type().to_string(),
            }
            .into()
        })
}

fn decode_parameter_column(param: &ParameterDef, column: &ArrayRef) -> HfResult<Vec<usize>> {
    let unknown = |row: usize, value: String| -> HfError {
        MemoryError::UnknownValue {
            name: param.name.clone(),
            row,
            value,
        }
        .into()
    };
    let null = |row: usize| -> HfError {
        MemoryError::NullCell {
            column: param.name.clone(),
            row,
        }
        .into()
    };

    let mut indices = Vec::with_capacity(column.len());
    match column.data_type() {
        DataType::Int64 => {
            let values = column
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| internal_column_error(param, column))?;
            for row in 0..values.len() {
                if values.is_null(row) {
                    return Err(null(row));
                }
                let value = ParameterValue::Int(values.value(row));
                indices.push(param.index_of(&value).ok_or_else(|| unknown(row, value.to_string()))?);
            }
        }
        DataType::Float64 => {
            let values = float_column(&param.name, column)?;
            for row in 0..values.len() {
                if values.is_null(row) {
                    return Err(null(row));
                }
                let value = ParameterValue::Float(values.value(row));
                indices.push(param.index_of(&value).ok_or_else(|| unknown(row, value.to_string()))?);
            }
        }
        DataType::Utf8 => {
            let values = column
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| internal_column_error(param, column))?;
            let encoded: Vec<String> = param.values.iter().map(encode_json).collect();
            for row in 0..values.len() {
                if values.is_null(row) {
                    return Err(null(row));
                }
                let cell = values.value(row);
                let index = encoded
                    .iter()
                    .position(|candidate| candidate == cell)
                    .ok_or_else(|| unknown(row, cell.to_string()))?;
                indices.push(index);
            }
        }
        _ => return Err(internal_column_error(param, column)),
    }
    Ok(indices)
}

fn internal_column_error(param: &ParameterDef, column: &ArrayRef) -> HfError {
    MemoryError::ColumnType {
        column: param.name.clone(),
        found: column.data_type().to_string(),
    }
    .into()
}
