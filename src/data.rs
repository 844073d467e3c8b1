use crate::api_client::{AdvertiserRef, ReportRow};
use crate::config::OutputFormat;
use crate::error::Error;
use chrono::{Local, NaiveDate, NaiveDateTime};
use datafusion::arrow::array::{Array, ArrayRef, AsArray, RecordBatch, StringBuilder};
use datafusion::arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema};
use datafusion::arrow::util::display::array_value_to_string;
use datafusion::common::config::CsvOptions;
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::logical_expr::{ident, try_cast};
use datafusion::prelude::{DataFrame, SessionContext};
use log::{info, warn};
use rust_xlsxwriter::Workbook;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const REPORT_FILE_PREFIX: &str = "rednote_ad_report";
const ADVERTISER_FILE_PREFIX: &str = "rednote_advertisers";
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// How a report column is typed in the published file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Float,
    Integer,
}

/// A report column: its API field name, the header it is published under and
/// the type it is coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportColumn {
    pub field: &'static str,
    pub display: &'static str,
    pub kind: ColumnKind,
    pub exported: bool,
}

const fn column(
    field: &'static str,
    display: &'static str,
    kind: ColumnKind,
    exported: bool,
) -> ReportColumn {
    ReportColumn {
        field,
        display,
        kind,
        exported,
    }
}

/// Translation table in export order. `spu_pic` is carried through the
/// transform but never written out.
pub const COLUMN_TRANSLATION: [ReportColumn; 12] = [
    column("time", "时间", ColumnKind::Text, true),
    column("account_id", "账户主id", ColumnKind::Text, true),
    column("account_name", "账户主name", ColumnKind::Text, true),
    column("spu_id", "宝贝ID", ColumnKind::Text, true),
    column("spu_name", "商品名称", ColumnKind::Text, true),
    column("fee", "消费", ColumnKind::Float, true),
    column("impression", "曝光量", ColumnKind::Integer, true),
    column("click", "点击量", ColumnKind::Integer, true),
    column("ctr", "点击率", ColumnKind::Text, true),
    column("acp", "平均点击单价", ColumnKind::Float, true),
    column("cpm", "千次曝光成本", ColumnKind::Float, true),
    column("spu_pic", "图片链接", ColumnKind::Text, false),
];

/// A report row tagged with the advertiser account it was fetched for.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountReportRow {
    pub account_id: String,
    pub account_name: String,
    pub row: ReportRow,
}

impl AccountReportRow {
    fn value(&self, field: &str) -> Option<&str> {
        match field {
            "account_id" => Some(&self.account_id),
            "account_name" => Some(&self.account_name),
            "time" => Some(&self.row.time),
            "spu_id" => Some(&self.row.spu_id),
            "spu_name" => self.row.spu_name.as_deref(),
            "fee" => self.row.fee.as_deref(),
            "impression" => self.row.impression.as_deref(),
            "click" => self.row.click.as_deref(),
            "ctr" => self.row.ctr.as_deref(),
            "acp" => self.row.acp.as_deref(),
            "cpm" => self.row.cpm.as_deref(),
            "spu_pic" => self.row.spu_pic.as_deref(),
            _ => None,
        }
    }
}

/// Creates the schema of the untransformed report: every column is text,
/// keyed by its API field name.
pub fn raw_report_schema() -> Arc<Schema> {
    Arc::new(Schema::new(
        COLUMN_TRANSLATION
            .iter()
            .map(|c| {
                let required =
                    matches!(c.field, "time" | "account_id" | "account_name" | "spu_id");
                Field::new(c.field, DataType::Utf8, !required)
            })
            .collect::<Vec<_>>(),
    ))
}

/// Parses the report's date field into canonical `YYYY-MM-DD` form.
pub fn normalize_date(raw: &str) -> Result<String, Error> {
    let raw = raw.trim();

    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
                .ok()
                .map(|dt| dt.date())
        })
        .map(|date| date.format("%Y-%m-%d").to_string())
        .ok_or_else(|| Error::InvalidDate {
            date: raw.to_string(),
        })
}

fn rows_to_batch(rows: &[AccountReportRow]) -> Result<RecordBatch, Error> {
    let schema = raw_report_schema();
    let dates = rows
        .iter()
        .map(|r| normalize_date(&r.row.time))
        .collect::<Result<Vec<_>, _>>()?;

    let columns = COLUMN_TRANSLATION
        .iter()
        .map(|c| {
            let mut builder = StringBuilder::with_capacity(rows.len(), rows.len() * 16);
            for (row, date) in rows.iter().zip(&dates) {
                if c.field == "time" {
                    builder.append_value(date);
                } else {
                    builder.append_option(row.value(c.field));
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        })
        .collect::<Vec<_>>();

    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Turns fetched rows into the published report.
///
/// Columns are renamed per [`COLUMN_TRANSLATION`], dates are normalised, money
/// columns are cast to Float64 and count columns to Int64. Values that do not
/// parse as numbers become null instead of failing the transform.
///
/// # Arguments
/// * `rows` - Rows of every advertiser, in fetch order
/// * `ctx` - A reference to the [`SessionContext`] for DataFrame operations
///
/// # Returns
/// A Result containing either the transformed [`DataFrame`] or an [`Error`]
pub fn transform(rows: &[AccountReportRow], ctx: &SessionContext) -> Result<DataFrame, Error> {
    let df = ctx.read_batch(rows_to_batch(rows)?)?;

    let projection = COLUMN_TRANSLATION
        .iter()
        .map(|c| {
            let expr = match c.kind {
                ColumnKind::Text => ident(c.field),
                ColumnKind::Float => try_cast(ident(c.field), DataType::Float64),
                // "1000.0" is a valid count, so go through Float64 first.
                ColumnKind::Integer => try_cast(
                    try_cast(ident(c.field), DataType::Float64),
                    DataType::Int64,
                ),
            };
            expr.alias(c.display)
        })
        .collect::<Vec<_>>();

    Ok(df.select(projection)?)
}

/// Writes the eleven exported columns, in fixed order, to a spreadsheet file.
///
/// # Arguments
/// * `df` - The transformed report
/// * `file_path` - Explicit destination; a timestamped name under `output_dir` is used when absent
/// * `output_dir` - Directory for generated file names
/// * `format` - Xlsx, CSV or Parquet
///
/// # Returns
/// The path written, or [`Error::Schema`] when an exported column is missing from `df`
pub async fn export(
    df: DataFrame,
    file_path: Option<&Path>,
    output_dir: &Path,
    format: OutputFormat,
) -> Result<PathBuf, Error> {
    let exported = COLUMN_TRANSLATION
        .iter()
        .filter(|c| c.exported)
        .map(|c| c.display)
        .collect::<Vec<_>>();

    for name in &exported {
        if !df.schema().fields().iter().any(|f| f.name().as_str() == *name) {
            return Err(Error::Schema {
                column: name.to_string(),
            });
        }
    }

    let df = df.select(exported.into_iter().map(ident).collect::<Vec<_>>())?;

    let path = match file_path {
        Some(path) => path.to_path_buf(),
        None => timestamped_path(output_dir, REPORT_FILE_PREFIX, format),
    };
    write_table(df, &path, format).await?;

    info!("report saved to {}", path.display());
    Ok(path)
}

/// Saves an advertiser list under a timestamped name. Nothing is written for
/// an empty list.
pub async fn export_advertisers(
    advertisers: &[AdvertiserRef],
    ctx: &SessionContext,
    output_dir: &Path,
    format: OutputFormat,
) -> Result<Option<PathBuf>, Error> {
    if advertisers.is_empty() {
        warn!("no advertisers to save");
        return Ok(None);
    }

    let schema = Arc::new(Schema::new(vec![
        Field::new("advertiser_id", DataType::Utf8, false),
        Field::new("advertiser_name", DataType::Utf8, true),
    ]));

    let mut id_builder = StringBuilder::new();
    let mut name_builder = StringBuilder::new();
    for advertiser in advertisers {
        id_builder.append_value(&advertiser.advertiser_id);
        name_builder.append_option(advertiser.advertiser_name.as_deref());
    }

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(id_builder.finish()),
            Arc::new(name_builder.finish()),
        ],
    )?;

    let path = timestamped_path(output_dir, ADVERTISER_FILE_PREFIX, format);
    write_table(ctx.read_batch(batch)?, &path, format).await?;

    info!("advertisers saved to {}", path.display());
    Ok(Some(path))
}

fn timestamped_path(output_dir: &Path, prefix: &str, format: OutputFormat) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    output_dir.join(format!("{prefix}_{timestamp}.{}", format.extension()))
}

async fn write_table(df: DataFrame, path: &Path, format: OutputFormat) -> Result<(), Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let target = path.to_string_lossy();
    let options = DataFrameWriteOptions::new().with_single_file_output(true);

    match format {
        OutputFormat::Xlsx => write_xlsx(df, path).await?,
        OutputFormat::Csv => {
            let csv_options = CsvOptions::default().with_has_header(true);
            df.write_csv(&target, options, Some(csv_options)).await?;
            prepend_bom(path)?;
        }
        OutputFormat::Parquet => {
            df.write_parquet(&target, options, None).await?;
        }
    }

    Ok(())
}

// Spreadsheet tools only detect UTF-8 CSV (and the Chinese headers) by its BOM.
fn prepend_bom(path: &Path) -> Result<(), Error> {
    let body = fs::read(path)?;
    let mut bytes = Vec::with_capacity(UTF8_BOM.len() + body.len());
    bytes.extend_from_slice(UTF8_BOM);
    bytes.extend_from_slice(&body);
    fs::write(path, bytes)?;
    Ok(())
}

/// Writes `df` to the first sheet of a new workbook, header first. Numbers stay
/// numeric cells and nulls are left blank.
async fn write_xlsx(df: DataFrame, path: &Path) -> Result<(), Error> {
    let headers = df
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect::<Vec<_>>();
    let batches = df.collect().await?;

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();

    for (col, header) in headers.iter().enumerate() {
        sheet.write_string(0, col as u16, header)?;
    }

    let mut row = 1u32;
    for batch in &batches {
        for idx in 0..batch.num_rows() {
            for (col, array) in batch.columns().iter().enumerate() {
                if array.is_null(idx) {
                    continue;
                }
                let col = col as u16;
                match array.data_type() {
                    DataType::Float64 => {
                        sheet.write_number(
                            row,
                            col,
                            array.as_primitive::<Float64Type>().value(idx),
                        )?;
                    }
                    DataType::Int64 => {
                        sheet.write_number(
                            row,
                            col,
                            array.as_primitive::<Int64Type>().value(idx) as f64,
                        )?;
                    }
                    _ => {
                        sheet.write_string(row, col, array_value_to_string(array, idx)?)?;
                    }
                }
            }
            row += 1;
        }
    }

    workbook.save(path)?;
    Ok(())
}
