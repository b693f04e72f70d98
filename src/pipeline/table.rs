use arrow::array::{
    Array, ArrayRef, AsArray, Float32Builder, Float64Builder, Int64Builder, ListBuilder, StringArray,
};
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::constants::{
    ACTION_COL, EPISODE_INDEX_COL, FRAME_INDEX_COL, GLOBAL_INDEX_COL, OBS_STATE_COL,
    REQUIRED_COLUMNS, TASK_INDEX_COL, TIMESTAMP_COL,
};
use crate::error::{PipelineError, Result};
use crate::storage;

/// One row of an episode table. `None` marks a null (or NaN) cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub action: Option<Vec<f64>>,
    pub observation_state: Option<Vec<f64>>,
    pub timestamp: Option<f64>,
    pub frame_index: Option<i64>,
    pub episode_index: Option<i64>,
    pub task_index: Option<i64>,
    pub index: Option<i64>,
}

impl Frame {
    /// True when any required cell is null.
    pub fn has_required_null(&self) -> bool {
        self.action.is_none()
            || self.observation_state.is_none()
            || self.timestamp.is_none()
            || self.frame_index.is_none()
            || self.episode_index.is_none()
            || self.task_index.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Vector,
    Float,
    Integer,
}

fn column_kind(name: &str) -> ColumnKind {
    match name {
        ACTION_COL | OBS_STATE_COL => ColumnKind::Vector,
        TIMESTAMP_COL => ColumnKind::Float,
        _ => ColumnKind::Integer,
    }
}

fn type_matches(kind: ColumnKind, dt: &DataType) -> bool {
    match kind {
        ColumnKind::Vector => match dt {
            DataType::List(f) | DataType::LargeList(f) | DataType::FixedSizeList(f, _) => {
                f.data_type().is_numeric()
            }
            _ => false,
        },
        ColumnKind::Float => dt.is_floating(),
        ColumnKind::Integer => dt.is_integer(),
    }
}

/// What the reader found for a column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnState {
    Ok,
    Missing,
    WrongType(String),
}

/// An episode's frames plus what the reader learned about its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeTable {
    pub columns: BTreeMap<String, ColumnState>,
    pub frames: Vec<Frame>,
}

impl EpisodeTable {
    /// A table with every column present, as produced by the transform stage.
    pub fn new(frames: Vec<Frame>) -> Self {
        let columns = REQUIRED_COLUMNS
            .iter()
            .chain(std::iter::once(&GLOBAL_INDEX_COL))
            .map(|c| (c.to_string(), ColumnState::Ok))
            .collect();
        Self { columns, frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Column present with the expected logical type.
    pub fn usable(&self, column: &str) -> bool {
        matches!(self.columns.get(column), Some(ColumnState::Ok))
    }

    /// Human-readable schema problems among the required columns.
    pub fn schema_problems(&self) -> Vec<String> {
        REQUIRED_COLUMNS
            .iter()
            .filter_map(|c| match self.columns.get(*c) {
                Some(ColumnState::Ok) => None,
                Some(ColumnState::WrongType(t)) => Some(format!("{} has type {}", c, t)),
                _ => Some(format!("{} is missing", c)),
            })
            .collect()
    }
}

fn int_values(col: &ArrayRef) -> Result<Vec<Option<i64>>> {
    let casted = cast(col.as_ref(), &DataType::Int64)?;
    Ok(casted.as_primitive::<Int64Type>().iter().collect())
}

fn float_values(col: &ArrayRef) -> Result<Vec<Option<f64>>> {
    let casted = cast(col.as_ref(), &DataType::Float64)?;
    Ok(casted
        .as_primitive::<Float64Type>()
        .iter()
        .map(|v| v.filter(|x| !x.is_nan()))
        .collect())
}

fn vector_values(col: &ArrayRef) -> Result<Vec<Option<Vec<f64>>>> {
    let target = DataType::List(Arc::new(Field::new("item", DataType::Float64, true)));
    let casted = cast(col.as_ref(), &target)?;
    let list = casted.as_list::<i32>();

    Ok((0..list.len())
        .map(|i| {
            if list.is_null(i) {
                return None;
            }
            let values = list.value(i);
            let prim = values.as_primitive::<Float64Type>();
            if prim.null_count() > 0 {
                return None;
            }
            let v: Vec<f64> = prim.values().iter().copied().collect();
            if v.iter().any(|x| x.is_nan()) {
                None
            } else {
                Some(v)
            }
        })
        .collect())
}

/// Decode a record batch into frames, tolerating missing or mistyped columns.
pub fn from_record_batch(batch: &RecordBatch) -> Result<EpisodeTable> {
    let mut frames = vec![Frame::default(); batch.num_rows()];
    let mut columns = BTreeMap::new();

    for name in REQUIRED_COLUMNS.iter().chain(std::iter::once(&GLOBAL_INDEX_COL)) {
        let Some(col) = batch.column_by_name(name) else {
            columns.insert(name.to_string(), ColumnState::Missing);
            continue;
        };
        let kind = column_kind(name);
        if !type_matches(kind, col.data_type()) {
            columns.insert(name.to_string(), ColumnState::WrongType(col.data_type().to_string()));
            continue;
        }

        let filled = match kind {
            ColumnKind::Vector => vector_values(col).map(|vals| {
                for (frame, v) in frames.iter_mut().zip(vals) {
                    if *name == ACTION_COL {
                        frame.action = v;
                    } else {
                        frame.observation_state = v;
                    }
                }
            }),
            ColumnKind::Float => float_values(col).map(|vals| {
                for (frame, v) in frames.iter_mut().zip(vals) {
                    frame.timestamp = v;
                }
            }),
            ColumnKind::Integer => int_values(col).map(|vals| {
                for (frame, v) in frames.iter_mut().zip(vals) {
                    match *name {
                        FRAME_INDEX_COL => frame.frame_index = v,
                        EPISODE_INDEX_COL => frame.episode_index = v,
                        TASK_INDEX_COL => frame.task_index = v,
                        _ => frame.index = v,
                    }
                }
            }),
        };

        match filled {
            Ok(()) => {
                columns.insert(name.to_string(), ColumnState::Ok);
            }
            Err(e) => {
                columns.insert(name.to_string(), ColumnState::WrongType(e.to_string()));
            }
        }
    }

    Ok(EpisodeTable { columns, frames })
}

fn read_batch(path: &Path) -> Result<RecordBatch> {
    let file = File::open(path).map_err(|e| PipelineError::io_at(path, e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().clone();
    let reader = builder.build()?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &batches)?)
}

/// Read a whole episode parquet file.
pub fn read_episode_table(path: &Path) -> Result<EpisodeTable> {
    from_record_batch(&read_batch(path)?)
}

fn vector_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::List(Arc::new(Field::new("item", DataType::Float32, true))),
        true,
    )
}

fn output_field(name: &str) -> Field {
    match column_kind(name) {
        ColumnKind::Vector => vector_field(name),
        ColumnKind::Float => Field::new(name, DataType::Float64, true),
        ColumnKind::Integer => Field::new(name, DataType::Int64, true),
    }
}

fn vector_array(frames: &[Frame], pick: impl Fn(&Frame) -> &Option<Vec<f64>>) -> ArrayRef {
    let mut builder = ListBuilder::new(Float32Builder::new());
    for frame in frames {
        match pick(frame) {
            Some(values) => {
                for v in values {
                    builder.values().append_value(*v as f32);
                }
                builder.append(true);
            }
            None => builder.append(false),
        }
    }
    Arc::new(builder.finish())
}

fn int_array(frames: &[Frame], pick: impl Fn(&Frame) -> Option<i64>) -> ArrayRef {
    let mut builder = Int64Builder::with_capacity(frames.len());
    for frame in frames {
        builder.append_option(pick(frame));
    }
    Arc::new(builder.finish())
}

/// Encode the columns the table carries (missing ones stay missing).
pub fn to_record_batch(table: &EpisodeTable) -> Result<RecordBatch> {
    let frames = &table.frames;
    let mut fields = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::new();

    for name in REQUIRED_COLUMNS.iter().chain(std::iter::once(&GLOBAL_INDEX_COL)) {
        if matches!(table.columns.get(*name), None | Some(ColumnState::Missing)) {
            continue;
        }
        let array = match *name {
            ACTION_COL => vector_array(frames, |f| &f.action),
            OBS_STATE_COL => vector_array(frames, |f| &f.observation_state),
            TIMESTAMP_COL => {
                let mut builder = Float64Builder::with_capacity(frames.len());
                for frame in frames {
                    builder.append_option(frame.timestamp);
                }
                Arc::new(builder.finish()) as ArrayRef
            }
            FRAME_INDEX_COL => int_array(frames, |f| f.frame_index),
            EPISODE_INDEX_COL => int_array(frames, |f| f.episode_index),
            TASK_INDEX_COL => int_array(frames, |f| f.task_index),
            _ => int_array(frames, |f| f.index),
        };
        fields.push(output_field(name));
        arrays.push(array);
    }

    let schema: SchemaRef = Arc::new(Schema::new(fields));
    Ok(RecordBatch::try_new(schema, arrays)?)
}

fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(props))?;
    writer.write(batch)?;
    Ok(writer.into_inner()?)
}

/// Parquet bytes for an episode table. Deterministic for identical input.
pub fn encode_parquet(table: &EpisodeTable) -> Result<Vec<u8>> {
    encode_batch(&to_record_batch(table)?)
}

pub fn write_episode_table(path: &Path, table: &EpisodeTable) -> Result<()> {
    storage::write_atomic(path, &encode_parquet(table)?)
}

/// Re-encode `source` into `dest` with constant string columns appended,
/// one per `(name, value)` label. Existing columns pass through untouched.
pub fn write_labeled_copy(source: &Path, dest: &Path, labels: &[(&str, &str)]) -> Result<()> {
    let batch = read_batch(source)?;
    let rows = batch.num_rows();
    let mut fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .filter(|f| !labels.iter().any(|(name, _)| f.name().as_str() == *name))
        .map(|f| f.as_ref().clone())
        .collect();
    let mut columns: Vec<ArrayRef> = batch
        .schema()
        .fields()
        .iter()
        .zip(batch.columns())
        .filter(|(f, _)| !labels.iter().any(|(name, _)| f.name().as_str() == *name))
        .map(|(_, c)| c.clone())
        .collect();
    for (name, value) in labels {
        fields.push(Field::new(*name, DataType::Utf8, false));
        columns.push(Arc::new(StringArray::from(vec![*value; rows])) as ArrayRef);
    }
    let labeled = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
    storage::write_atomic(dest, &encode_batch(&labeled)?)
}
