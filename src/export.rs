use anyhow::Context;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::json;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::calc::{
    self, GradeBook, StudentRow, TeacherRow, Trimester,
};

pub const WORKBOOK_FORMAT_V1: &str = "gradebook-workbook-v1";

const MANIFEST_ENTRY: &str = "manifest.json";

/// One spreadsheet cell value. Ungraded entries export as a blank cell, the
/// same way the grading UI shows an empty input.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Blank,
}

impl CellValue {
    pub fn text(s: impl Into<String>) -> CellValue {
        CellValue::Text(s.into())
    }

    fn display(&self) -> String {
        match self {
            CellValue::Number(n) => format!("{}", n),
            CellValue::Text(t) => t.clone(),
            CellValue::Blank => String::new(),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Number(n) => serializer.serialize_f64(*n),
            CellValue::Text(t) => serializer.serialize_str(t),
            CellValue::Blank => serializer.serialize_str(""),
        }
    }
}

/// An ordered label -> value pair. Rows keep their cells in column order so
/// the serialized model and the CSV sheets agree on layout.
#[derive(Debug, Clone)]
pub struct ExportCell {
    pub label: String,
    pub value: CellValue,
}

impl ExportCell {
    fn new(label: impl Into<String>, value: CellValue) -> ExportCell {
        ExportCell {
            label: label.into(),
            value,
        }
    }
}

impl Serialize for ExportCell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("label", &self.label)?;
        map.serialize_entry("value", &self.value)?;
        map.end()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSheet {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ExportCell>>,
}

/// Flat grades sheet: one row per (student, teacher) for the requested
/// trimester, with one column per assignment plus the weighted trimester
/// average. The average column reuses the engine, so export and display can
/// never drift apart.
pub fn grades_sheet(
    book: &GradeBook,
    teacher_filter: Option<&str>,
    trimester: Trimester,
) -> ExportSheet {
    let mut columns = vec![
        "Student ID".to_string(),
        "Student".to_string(),
        "Grade Level".to_string(),
        "Teacher".to_string(),
        "Subject".to_string(),
        "Trimester".to_string(),
    ];
    for a in &book.assignments {
        columns.push(format!("{} ({})", a.name, a.kind));
    }
    columns.push("Average".to_string());

    let teachers: Vec<&TeacherRow> = book
        .teachers
        .iter()
        .filter(|t| teacher_filter.map(|id| t.id == id).unwrap_or(true))
        .collect();

    let mut rows = Vec::new();
    for student in &book.students {
        for teacher in &teachers {
            rows.push(grades_row(book, student, teacher, trimester));
        }
    }

    ExportSheet {
        name: "Grades".to_string(),
        columns,
        rows,
    }
}

fn grades_row(
    book: &GradeBook,
    student: &StudentRow,
    teacher: &TeacherRow,
    trimester: Trimester,
) -> Vec<ExportCell> {
    let mut cells = vec![
        ExportCell::new("Student ID", CellValue::text(&student.id)),
        ExportCell::new("Student", CellValue::text(&student.name)),
        ExportCell::new("Grade Level", CellValue::text(&student.grade_label)),
        ExportCell::new("Teacher", CellValue::text(&teacher.name)),
        ExportCell::new("Subject", CellValue::text(&teacher.subject)),
        ExportCell::new("Trimester", CellValue::text(trimester.as_str())),
    ];

    for a in &book.assignments {
        let value = book
            .value_of(&student.id, &a.id, &teacher.id, trimester)
            .map(CellValue::Number)
            .unwrap_or(CellValue::Blank);
        cells.push(ExportCell::new(format!("{} ({})", a.name, a.kind), value));
    }

    cells.push(ExportCell::new(
        "Average",
        CellValue::Number(calc::trimester_average(
            book,
            &student.id,
            &teacher.id,
            trimester,
        )),
    ));
    cells
}

/// Averages sheet: one row per student with the three trimester averages,
/// the truncated final average, and the pass/fail label, all for one teacher.
pub fn averages_sheet(book: &GradeBook, teacher_id: &str) -> ExportSheet {
    let columns = vec![
        "Student ID".to_string(),
        "Student".to_string(),
        "Grade Level".to_string(),
        "1T Average".to_string(),
        "2T Average".to_string(),
        "3T Average".to_string(),
        "Final Average".to_string(),
        "Status".to_string(),
    ];

    let rows = book
        .students
        .iter()
        .map(|student| {
            let summary = calc::student_averages(book, student, teacher_id);
            vec![
                ExportCell::new("Student ID", CellValue::text(&student.id)),
                ExportCell::new("Student", CellValue::text(&student.name)),
                ExportCell::new("Grade Level", CellValue::text(&student.grade_label)),
                ExportCell::new("1T Average", CellValue::Number(summary.t1)),
                ExportCell::new("2T Average", CellValue::Number(summary.t2)),
                ExportCell::new("3T Average", CellValue::Number(summary.t3)),
                ExportCell::new("Final Average", CellValue::Number(summary.final_average)),
                ExportCell::new(
                    "Status",
                    CellValue::text(if summary.passed { "Approved" } else { "Failed" }),
                ),
            ]
        })
        .collect();

    ExportSheet {
        name: "Averages".to_string(),
        columns,
        rows,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkbookSummary {
    pub format: String,
    pub sheet_count: usize,
    pub row_counts: Vec<usize>,
}

/// Serializes the sheets into a zip workbook: `manifest.json` plus one CSV
/// file per sheet under `sheets/`. The container mirrors the workspace bundle
/// format; any spreadsheet tool that reads CSV can open the sheets.
pub fn write_workbook(out_path: &Path, sheets: &[ExportSheet]) -> anyhow::Result<WorkbookSummary> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": WORKBOOK_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": chrono::Utc::now().to_rfc3339(),
        "sheets": sheets
            .iter()
            .map(|s| json!({
                "name": s.name,
                "file": sheet_entry_name(&s.name),
                "rows": s.rows.len(),
            }))
            .collect::<Vec<_>>(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    let mut row_counts = Vec::with_capacity(sheets.len());
    for sheet in sheets {
        let entry = sheet_entry_name(&sheet.name);
        zip.start_file(&entry, opts)
            .with_context(|| format!("failed to start sheet entry {}", entry))?;
        zip.write_all(sheet_to_csv(sheet).as_bytes())
            .with_context(|| format!("failed to write sheet entry {}", entry))?;
        row_counts.push(sheet.rows.len());
    }

    zip.finish().context("failed to finalize workbook")?;

    Ok(WorkbookSummary {
        format: WORKBOOK_FORMAT_V1.to_string(),
        sheet_count: sheets.len(),
        row_counts,
    })
}

fn sheet_entry_name(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("sheets/{}.csv", slug)
}

fn sheet_to_csv(sheet: &ExportSheet) -> String {
    let mut out = String::new();
    push_csv_line(&mut out, sheet.columns.iter().map(|c| c.as_str()));
    for row in &sheet.rows {
        let values: Vec<String> = row.iter().map(|c| c.value.display()).collect();
        push_csv_line(&mut out, values.iter().map(|v| v.as_str()));
    }
    out
}

fn push_csv_line<'a, I: Iterator<Item = &'a str>>(out: &mut String, fields: I) {
    let mut first = true;
    for field in fields {
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(&csv_escape(field));
    }
    out.push('\n');
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
