//! Recipe corpus loading.
//!
//! The loader turns a tabular recipe source into a [`CorpusSnapshot`]: an
//! ordered list of records whose ingredient text is ready to embed. Row order
//! is fixed here; the vector index built from a snapshot uses the same order.

use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};
use parquet::schema::types::Type;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::{CorpusConfig, CorpusFormat};
use crate::error::{RecommenderError, Result};

/// A single recipe as embedded and indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeRecord {
    /// Source id, or the source row index when the source has none.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Lowercased, space-joined ingredient text.
    pub text: String,
}

/// The ordered set of recipes backing a vector index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusSnapshot {
    records: Vec<RecipeRecord>,
    fingerprint: String,
}

impl CorpusSnapshot {
    /// Wrap records, computing their content fingerprint.
    pub fn new(records: Vec<RecipeRecord>) -> Self {
        let fingerprint = corpus_fingerprint(&records);
        Self {
            records,
            fingerprint,
        }
    }

    /// SHA-256 hex over every record, in order.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Records in index order.
    pub fn records(&self) -> &[RecipeRecord] {
        &self.records
    }

    /// Record at an index position.
    pub fn get(&self, row: usize) -> Option<&RecipeRecord> {
        self.records.get(row)
    }

    /// Number of recipes.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record ids in index order.
    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }

    /// Ingredient texts in index order.
    pub fn texts(&self) -> Vec<String> {
        self.records.iter().map(|r| r.text.clone()).collect()
    }
}

/// Content hash of an ordered record list.
pub fn corpus_fingerprint(records: &[RecipeRecord]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((records.len() as u64).to_le_bytes());
    for record in records {
        hasher.update(record.id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(record.name.as_bytes());
        hasher.update([0x1f]);
        hasher.update(record.text.as_bytes());
        hasher.update([0x1e]);
    }
    format!("{:x}", hasher.finalize())
}

/// Ingredient cell as found in the source.
#[derive(Debug, Clone, PartialEq)]
enum Ingredients {
    List(Vec<String>),
    Text(String),
}

impl Ingredients {
    fn normalize(&self) -> String {
        match self {
            Self::List(tokens) => tokens
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase(),
            Self::Text(text) => text.trim().to_lowercase(),
        }
    }
}

/// One source row before normalization.
#[derive(Debug)]
struct RawRow {
    /// Position in the source table.
    row: usize,
    id: Option<String>,
    name: Option<String>,
    ingredients: Option<Ingredients>,
}

/// Source column names, detached from the loader for blocking readers.
#[derive(Debug, Clone)]
struct Columns {
    name: String,
    ingredients: String,
    id: Option<String>,
}

/// Loads and normalizes the recipe source.
pub struct CorpusLoader {
    config: CorpusConfig,
}

impl CorpusLoader {
    /// Create a loader for the configured source.
    pub fn new(config: CorpusConfig) -> Self {
        Self { config }
    }

    /// The loader's configuration.
    pub fn config(&self) -> &CorpusConfig {
        &self.config
    }

    /// Read, normalize and sample the configured source.
    pub async fn load(&self) -> Result<CorpusSnapshot> {
        let path = &self.config.path;
        let format = self.config.resolved_format()?;

        info!("Loading recipe corpus from {}", path.display());

        if format == CorpusFormat::Parquet {
            let columns = self.columns();
            let owned_path = path.clone();
            let rows = tokio::task::spawn_blocking(move || read_parquet(&owned_path, &columns))
                .await
                .map_err(|e| RecommenderError::CorpusLoad(format!("parquet reader: {e}")))??;
            return self.finish(rows, path);
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| RecommenderError::CorpusLoad(format!("{}: {e}", path.display())))?;

        self.load_str(&content, format, path)
    }

    /// Normalize an in-memory text source.
    ///
    /// Parquet is binary and only readable through [`CorpusLoader::load`].
    pub fn load_str(
        &self,
        content: &str,
        format: CorpusFormat,
        origin: &Path,
    ) -> Result<CorpusSnapshot> {
        let rows = match format {
            CorpusFormat::Json => self.parse_json(content)?,
            CorpusFormat::JsonLines => self.parse_json_lines(content)?,
            CorpusFormat::Csv => self.parse_csv(content)?,
            CorpusFormat::Parquet => {
                return Err(RecommenderError::CorpusLoad(format!(
                    "{} is parquet and must be read from a file",
                    origin.display()
                )));
            }
        };

        self.finish(rows, origin)
    }

    fn columns(&self) -> Columns {
        Columns {
            name: self.config.name_column.clone(),
            ingredients: self.config.ingredients_column.clone(),
            id: self.config.id_column.clone(),
        }
    }

    /// Normalize, sample and fingerprint parsed rows.
    fn finish(&self, rows: Vec<RawRow>, origin: &Path) -> Result<CorpusSnapshot> {
        let source_rows = rows.len();
        let records = self.normalize_rows(rows);
        let skipped = source_rows - records.len();
        if skipped > 0 {
            warn!(
                "Skipped {skipped} of {source_rows} rows without a usable {} or {}",
                self.config.name_column, self.config.ingredients_column
            );
        }

        let records = sample_records(records, self.config.max_recipes, self.config.sample_seed);
        if records.is_empty() {
            return Err(RecommenderError::CorpusLoad(format!(
                "{} has no usable recipes",
                origin.display()
            )));
        }

        let snapshot = CorpusSnapshot::new(records);
        info!(
            "Loaded {} recipes (fingerprint {})",
            snapshot.len(),
            &snapshot.fingerprint()[..12]
        );
        Ok(snapshot)
    }

    fn normalize_rows(&self, rows: Vec<RawRow>) -> Vec<RecipeRecord> {
        rows.into_iter()
            .filter_map(|raw| {
                let row = raw.row;
                let name = raw.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
                let text = raw
                    .ingredients
                    .map(|i| i.normalize())
                    .filter(|t| !t.is_empty());

                match (name, text) {
                    (Some(name), Some(text)) => Some(RecipeRecord {
                        id: raw.id.unwrap_or_else(|| row.to_string()),
                        name,
                        text,
                    }),
                    _ => {
                        debug!("Skipping source row {row}");
                        None
                    }
                }
            })
            .collect()
    }

    fn parse_json(&self, content: &str) -> Result<Vec<RawRow>> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| RecommenderError::CorpusLoad(format!("invalid JSON: {e}")))?;

        let Value::Array(items) = value else {
            return Err(RecommenderError::CorpusLoad(
                "JSON corpus must be an array of objects".to_string(),
            ));
        };

        items
            .iter()
            .enumerate()
            .map(|(row, item)| self.json_row(item, row))
            .collect()
    }

    fn parse_json_lines(&self, content: &str) -> Result<Vec<RawRow>> {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(line_no, line)| {
                let value: Value = serde_json::from_str(line).map_err(|e| {
                    RecommenderError::CorpusLoad(format!("line {}: {e}", line_no + 1))
                })?;
                self.json_row(&value, line_no)
            })
            .collect()
    }

    fn json_row(&self, item: &Value, row: usize) -> Result<RawRow> {
        let Value::Object(fields) = item else {
            return Err(RecommenderError::CorpusLoad(format!(
                "row {row} is not an object"
            )));
        };

        let ingredients = match fields.get(&self.config.ingredients_column) {
            Some(Value::Array(items)) => Some(Ingredients::List(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            )),
            Some(Value::String(text)) => Some(Ingredients::Text(text.clone())),
            _ => None,
        };

        Ok(RawRow {
            row,
            id: self
                .config
                .id_column
                .as_ref()
                .and_then(|column| fields.get(column))
                .and_then(scalar_to_string),
            name: fields
                .get(&self.config.name_column)
                .and_then(scalar_to_string),
            ingredients,
        })
    }

    fn parse_csv(&self, content: &str) -> Result<Vec<RawRow>> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(false)
            .from_reader(content.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| RecommenderError::CorpusLoad(format!("invalid CSV header: {e}")))?
            .clone();

        let column = |name: &str| headers.iter().position(|h| h.trim() == name);
        let name_idx = column(&self.config.name_column).ok_or_else(|| {
            RecommenderError::CorpusLoad(format!("missing column {}", self.config.name_column))
        })?;
        let ingredients_idx = column(&self.config.ingredients_column).ok_or_else(|| {
            RecommenderError::CorpusLoad(format!(
                "missing column {}",
                self.config.ingredients_column
            ))
        })?;
        let id_idx = self.config.id_column.as_deref().and_then(column);

        let mut rows = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record
                .map_err(|e| RecommenderError::CorpusLoad(format!("CSV row {row}: {e}")))?;
            let cell = |idx: usize| record.get(idx).filter(|c| !c.trim().is_empty());

            rows.push(RawRow {
                row,
                id: id_idx.and_then(cell).map(|c| c.trim().to_string()),
                name: cell(name_idx).map(str::to_string),
                ingredients: cell(ingredients_idx).map(parse_ingredient_cell),
            });
        }

        Ok(rows)
    }
}

/// Read the configured columns of a Parquet file.
///
/// Ingredient cells may be a list of strings or a single string. Other
/// columns are not decoded.
fn read_parquet(path: &Path, columns: &Columns) -> Result<Vec<RawRow>> {
    let parquet_error = |e: parquet::errors::ParquetError| {
        RecommenderError::CorpusLoad(format!("{}: {e}", path.display()))
    };

    let file = std::fs::File::open(path)
        .map_err(|e| RecommenderError::CorpusLoad(format!("{}: {e}", path.display())))?;
    let reader = SerializedFileReader::new(file).map_err(parquet_error)?;

    let root = reader.metadata().file_metadata().schema();
    let has_column = |name: &str| root.get_fields().iter().any(|f| f.name() == name);
    for required in [&columns.name, &columns.ingredients] {
        if !has_column(required) {
            return Err(RecommenderError::CorpusLoad(format!("missing column {required}")));
        }
    }
    let id_column = columns.id.as_deref().filter(|id| has_column(id));

    let wanted = [Some(columns.name.as_str()), Some(columns.ingredients.as_str()), id_column];
    let projection = Type::group_type_builder(root.name())
        .with_fields(
            root.get_fields()
                .iter()
                .filter(|f| wanted.contains(&Some(f.name())))
                .cloned()
                .collect(),
        )
        .build()
        .map_err(parquet_error)?;

    let rows = reader.get_row_iter(Some(projection)).map_err(parquet_error)?;

    let mut raw_rows = Vec::new();
    for (row, record) in rows.enumerate() {
        let record = record.map_err(parquet_error)?;
        raw_rows.push(parquet_row(&record, row, columns, id_column));
    }

    debug!("Read {} rows from {}", raw_rows.len(), path.display());
    Ok(raw_rows)
}

fn parquet_row(record: &Row, row: usize, columns: &Columns, id_column: Option<&str>) -> RawRow {
    let mut raw = RawRow {
        row,
        id: None,
        name: None,
        ingredients: None,
    };

    for (column, field) in record.get_column_iter() {
        if Some(column.as_str()) == id_column {
            raw.id = field_to_string(field).map(|id| id.trim().to_string());
        } else if *column == columns.name {
            raw.name = field_to_string(field);
        } else if *column == columns.ingredients {
            raw.ingredients = match field {
                Field::ListInternal(list) => Some(Ingredients::List(
                    list.elements().iter().filter_map(field_to_string).collect(),
                )),
                Field::Str(text) => Some(parse_ingredient_cell(text)),
                _ => None,
            };
        }
    }

    raw
}

fn field_to_string(field: &Field) -> Option<String> {
    match field {
        Field::Str(s) => Some(s.clone()),
        Field::Byte(n) => Some(n.to_string()),
        Field::Short(n) => Some(n.to_string()),
        Field::Int(n) => Some(n.to_string()),
        Field::Long(n) => Some(n.to_string()),
        Field::UByte(n) => Some(n.to_string()),
        Field::UShort(n) => Some(n.to_string()),
        Field::UInt(n) => Some(n.to_string()),
        Field::ULong(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A CSV cell holding a JSON string array is a list, anything else is text.
fn parse_ingredient_cell(cell: &str) -> Ingredients {
    let trimmed = cell.trim();
    if trimmed.starts_with('[')
        && let Ok(tokens) = serde_json::from_str::<Vec<String>>(trimmed)
    {
        return Ingredients::List(tokens);
    }
    Ingredients::Text(cell.to_string())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Keep at most `max` records, chosen reproducibly from `seed`.
///
/// Chosen records keep their source order.
fn sample_records(records: Vec<RecipeRecord>, max: Option<usize>, seed: u64) -> Vec<RecipeRecord> {
    let Some(max) = max.filter(|&max| records.len() > max) else {
        return records;
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = rand::seq::index::sample(&mut rng, records.len(), max).into_vec();
    picked.sort_unstable();

    info!(
        "Sampled {max} of {} recipes with seed {seed}",
        records.len()
    );

    let mut picked = picked.into_iter().peekable();
    records
        .into_iter()
        .enumerate()
        .filter_map(|(row, record)| {
            if picked.peek() == Some(&row) {
                picked.next();
                Some(record)
            } else {
                None
            }
        })
        .collect()
}
