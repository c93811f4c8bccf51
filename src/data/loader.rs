//! Row loaders backing the [`CachedDataStore`](super::CachedDataStore).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::Row;

/// Source of test-data rows.
#[async_trait]
pub trait RowLoader: Send + Sync {
    /// Loads every field of one test case.
    ///
    /// Unknown test cases yield an empty row rather than an error.
    async fn load_row(&self, test_case_id: &str) -> Result<Row>;

    /// Every test case id the source knows, sorted.
    ///
    /// Loaders that cannot enumerate their source return an empty list.
    async fn test_case_ids(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Invalidates any state the loader keeps about its source.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Header of the id column in tabular data, matched case-insensitively.
pub const TEST_CASE_ID_COLUMN: &str = "TestCaseId";

/// Loader over a fixed in-memory table.
#[derive(Debug, Clone, Default)]
pub struct MemoryRowLoader {
    rows: HashMap<String, Row>,
}

impl MemoryRowLoader {
    pub fn new(rows: HashMap<String, Row>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl RowLoader for MemoryRowLoader {
    async fn load_row(&self, test_case_id: &str) -> Result<Row> {
        Ok(self.rows.get(test_case_id).cloned().unwrap_or_default())
    }

    async fn test_case_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.rows.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Loader reading a test-data file, picked by extension.
///
/// | Extension | Layout |
/// |-----------|--------|
/// | `.csv` | Header row with a `TestCaseId` column, one row per test case |
/// | `.toml` | One table of fields per test case id |
/// | anything else | JSON object of test case ids to objects of fields |
///
/// ```json
/// { "LOGIN_001": { "username": "standard_user", "password": "secret_sauce" } }
/// ```
///
/// ```text
/// TestCaseId,username,password
/// LOGIN_001,standard_user,secret_sauce
/// ```
///
/// In JSON and TOML, numbers and booleans are converted to strings and
/// nested tables and arrays are rejected. In CSV, empty or missing cells
/// read as `""` and rows with an empty id are skipped. The file is parsed
/// on first use and again after [`refresh`](RowLoader::refresh).
pub struct FileRowLoader {
    path: PathBuf,
    table: Mutex<Option<HashMap<String, Row>>>,
}

impl FileRowLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table: Mutex::new(None),
        }
    }

    async fn ensure_loaded<'a>(
        &self,
        table: &'a mut Option<HashMap<String, Row>>,
    ) -> Result<&'a HashMap<String, Row>> {
        if table.is_none() {
            let content = tokio::fs::read_to_string(&self.path)
                .await
                .with_context(|| format!("Failed to read test data: {}", self.path.display()))?;
            let rows = parse_rows(&self.path, &content)
                .with_context(|| format!("Failed to parse test data: {}", self.path.display()))?;
            *table = Some(rows);
        }
        table
            .as_ref()
            .context("test data table missing after load")
    }
}

#[async_trait]
impl RowLoader for FileRowLoader {
    async fn load_row(&self, test_case_id: &str) -> Result<Row> {
        let mut table = self.table.lock().await;
        let rows = self.ensure_loaded(&mut table).await?;
        Ok(rows.get(test_case_id).cloned().unwrap_or_default())
    }

    async fn test_case_ids(&self) -> Result<Vec<String>> {
        let mut table = self.table.lock().await;
        let rows = self.ensure_loaded(&mut table).await?;
        let mut ids: Vec<String> = rows.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn refresh(&self) -> Result<()> {
        *self.table.lock().await = None;
        Ok(())
    }
}

fn parse_rows(path: &Path, content: &str) -> Result<HashMap<String, Row>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let value: serde_json::Value = match extension.as_str() {
        "csv" => return parse_table(content),
        "toml" => {
            let table: toml::Table = toml::from_str(content)?;
            serde_json::to_value(table)?
        }
        _ => serde_json::from_str(content)?,
    };

    let serde_json::Value::Object(cases) = value else {
        bail!("expected a table of test cases at the top level");
    };

    let mut rows = HashMap::with_capacity(cases.len());
    for (test_case_id, fields) in cases {
        let serde_json::Value::Object(fields) = fields else {
            bail!("test case {} must be a table of fields", test_case_id);
        };
        let mut row = Row::with_capacity(fields.len());
        for (key, value) in fields {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null => String::new(),
                _ => bail!("field {}.{} must be a scalar", test_case_id, key),
            };
            row.insert(key, text);
        }
        rows.insert(test_case_id, row);
    }
    Ok(rows)
}

fn parse_table(content: &str) -> Result<HashMap<String, Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(content.as_bytes());

    let headers = reader.headers()?.clone();
    let id_column = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(TEST_CASE_ID_COLUMN))
        .with_context(|| format!("{} column not found in header row", TEST_CASE_ID_COLUMN))?;

    let mut rows = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let test_case_id = record.get(id_column).unwrap_or_default().trim();
        if test_case_id.is_empty() {
            continue;
        }

        let row: Row = headers
            .iter()
            .enumerate()
            .filter(|(i, header)| *i != id_column && !header.is_empty())
            .map(|(i, header)| {
                let cell = record.get(i).unwrap_or_default();
                (header.to_string(), cell.to_string())
            })
            .collect();
        rows.insert(test_case_id.to_string(), row);
    }
    Ok(rows)
}
