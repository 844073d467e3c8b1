use crate::config::Config;
use crate::error::Error;
use calamine::{open_workbook_auto, Data, Reader};
use rust_xlsxwriter::Workbook;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const APP_ID: &str = "app_id";
const SECRET: &str = "secret";
const REFRESH_TOKEN: &str = "refresh_token";

/// One credential set of the store, addressed by its 1-based row position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub row_index: usize,
    pub app_id: u64,
    pub secret: String,
    pub refresh_token: String,
}

pub trait CredentialStore: Send + Sync + 'static {
    /// Loads the credential set stored at `row_index` (1-based).
    ///
    /// # Returns
    /// The [`CredentialRecord`], or [`Error::ReadCredential`] when the store is
    /// unreadable, the row does not exist or a required field is absent.
    fn read_credential(&self, row_index: usize) -> Result<CredentialRecord, Error>;

    /// Overwrites the refresh token of `row_index`, leaving every other row and
    /// column untouched.
    fn update_credential(&self, row_index: usize, refresh_token: &str) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreFormat {
    Xlsx,
    Csv,
}

impl StoreFormat {
    fn of(path: &Path) -> Self {
        let is_workbook = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xlsx"));

        if is_workbook {
            StoreFormat::Xlsx
        } else {
            StoreFormat::Csv
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Text(String),
    Number(f64),
}

impl Cell {
    fn text(&self) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => (*n as i64).to_string(),
            Cell::Number(n) => n.to_string(),
        }
    }
}

impl From<&Data> for Cell {
    fn from(data: &Data) -> Self {
        match data {
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Float(f) => Cell::Number(*f),
            Data::String(s) => Cell::Text(s.clone()),
            Data::Empty => Cell::Text(String::new()),
            other => Cell::Text(other.to_string()),
        }
    }
}

/// Credential store kept as a spreadsheet (`.xlsx`) or CSV file with at least
/// the columns `app_id`, `secret` and `refresh_token`.
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    file_path: PathBuf,
    format: StoreFormat,
}

struct Table {
    headers: Vec<String>,
    records: Vec<Vec<Cell>>,
}

impl Table {
    fn column(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}').trim() == name)
    }

    fn row(&self, row_index: usize) -> Result<&Vec<Cell>, String> {
        row_index
            .checked_sub(1)
            .and_then(|idx| self.records.get(idx))
            .ok_or_else(|| {
                format!(
                    "row is out of range, the store holds {} row(s)",
                    self.records.len()
                )
            })
    }
}

impl FileCredentialStore {
    pub fn new(config: &Config) -> Self {
        Self::from_path(&config.credential_file)
    }

    pub fn from_path(file_path: &Path) -> Self {
        FileCredentialStore {
            file_path: file_path.to_path_buf(),
            format: StoreFormat::of(file_path),
        }
    }

    fn load(&self) -> Result<Table, String> {
        match self.format {
            StoreFormat::Xlsx => self.load_xlsx(),
            StoreFormat::Csv => self.load_csv(),
        }
    }

    fn load_csv(&self) -> Result<Table, String> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.file_path)
            .map_err(|e| format!("cannot open {}: {e}", self.file_path.display()))?;

        let headers = rdr
            .headers()
            .map_err(|e| format!("invalid credential headers: {e}"))?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();

        let records = rdr
            .records()
            .map(|record| {
                record.map(|r| {
                    r.iter()
                        .map(|v| Cell::Text(v.to_string()))
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid credential row: {e}"))?;

        Ok(Table { headers, records })
    }

    fn load_xlsx(&self) -> Result<Table, String> {
        let mut workbook = open_workbook_auto(&self.file_path)
            .map_err(|e| format!("cannot open {}: {e}", self.file_path.display()))?;

        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| "workbook has no sheets".to_string())?
            .map_err(|e| format!("cannot read the first sheet: {e}"))?;

        let mut rows = range.rows();
        let headers = rows
            .next()
            .ok_or_else(|| "sheet has no header row".to_string())?
            .iter()
            .map(|data| Cell::from(data).text())
            .collect::<Vec<_>>();
        let records = rows
            .map(|row| row.iter().map(Cell::from).collect::<Vec<_>>())
            .collect::<Vec<_>>();

        Ok(Table { headers, records })
    }

    fn save(&self, table: &Table) -> Result<(), String> {
        let dir = match self.file_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        // Written next to the store and renamed over it, so readers never see a partial file.
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| e.to_string())?;
        match self.format {
            StoreFormat::Xlsx => {
                let buffer = xlsx_bytes(table).map_err(|e| e.to_string())?;
                tmp.write_all(&buffer).map_err(|e| e.to_string())?;
            }
            StoreFormat::Csv => {
                let mut writer = csv::Writer::from_writer(&mut tmp);
                writer
                    .write_record(&table.headers)
                    .map_err(|e| e.to_string())?;
                for record in &table.records {
                    writer
                        .write_record(record.iter().map(Cell::text))
                        .map_err(|e| e.to_string())?;
                }
                writer.flush().map_err(|e| e.to_string())?;
            }
        }
        tmp.flush().map_err(|e| e.to_string())?;

        tmp.persist(&self.file_path)
            .map_err(|e| e.error.to_string())?;
        Ok(())
    }
}

fn xlsx_bytes(table: &Table) -> Result<Vec<u8>, rust_xlsxwriter::XlsxError> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();

    for (col, header) in table.headers.iter().enumerate() {
        sheet.write_string(0, col as u16, header)?;
    }
    for (row, record) in table.records.iter().enumerate() {
        let row = row as u32 + 1;
        for (col, cell) in record.iter().enumerate() {
            match cell {
                Cell::Number(n) => {
                    sheet.write_number(row, col as u16, *n)?;
                }
                Cell::Text(s) if s.is_empty() => {}
                Cell::Text(s) => {
                    sheet.write_string(row, col as u16, s)?;
                }
            }
        }
    }

    workbook.save_to_buffer()
}

impl CredentialStore for FileCredentialStore {
    fn read_credential(&self, row_index: usize) -> Result<CredentialRecord, Error> {
        let read_error = |reason: String| Error::ReadCredential { row_index, reason };

        let table = self.load().map_err(read_error)?;
        let record = table.row(row_index).map_err(read_error)?;

        let field = |name: &str| -> Result<String, Error> {
            table
                .column(name)
                .and_then(|idx| record.get(idx))
                .map(|value| value.text().trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| read_error(format!("field '{name}' is missing")))
        };

        let app_id_raw = field(APP_ID)?;
        let app_id = app_id_raw
            .parse::<u64>()
            .map_err(|_| read_error(format!("app_id '{app_id_raw}' is not an integer")))?;

        Ok(CredentialRecord {
            row_index,
            app_id,
            secret: field(SECRET)?,
            refresh_token: field(REFRESH_TOKEN)?,
        })
    }

    fn update_credential(&self, row_index: usize, refresh_token: &str) -> Result<(), Error> {
        let write_error = |reason: String| Error::WriteCredential { row_index, reason };

        let mut table = self.load().map_err(write_error)?;
        let column = table
            .column(REFRESH_TOKEN)
            .ok_or_else(|| write_error(format!("column '{REFRESH_TOKEN}' is missing")))?;
        table.row(row_index).map_err(write_error)?;

        let record = &mut table.records[row_index - 1];
        if record.len() <= column {
            record.resize(column + 1, Cell::Text(String::new()));
        }
        record[column] = Cell::Text(refresh_token.to_string());

        self.save(&table).map_err(write_error)
    }
}
