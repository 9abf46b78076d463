//! PDF parsing capability
//!
//! Extracts text (and optionally document metadata) from PDF files with
//! poppler's `pdftotext` and `pdfinfo`. Page selection is a single range
//! rather than arbitrary page lists.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::job::capability::{run_checked, CapabilityError, JobCapability, JobContext};
use crate::job::{truncate_text, JobSpec, TEXT_PREVIEW_LIMIT};

/// Accepted `page_range` forms: "all", "N" or "N-M" (1-indexed).
static PAGE_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(all|\d+(-\d+)?)$").unwrap());

/// The `pdf_parse` job type.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfParseCapability;

impl PdfParseCapability {
    /// Creates the capability.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Runs `pdftotext` over the selected range and returns the
    /// extracted text.
    fn extract_text(
        &self,
        input: &Path,
        output: &Path,
        range: Option<(u32, u32)>,
        layout: bool,
    ) -> Result<String, CapabilityError> {
        let mut command = Command::new("pdftotext");
        if let Some((first, last)) = range {
            command
                .args(["-f", &first.to_string()])
                .args(["-l", &last.to_string()]);
        }
        if layout {
            command.arg("-layout");
        }
        command.arg(input).arg(output);

        run_checked(&mut command, "pdftotext")?;
        Ok(fs::read_to_string(output)?)
    }

    /// Runs `pdfinfo` and parses its key/value output.
    fn extract_metadata(&self, input: &Path) -> Result<Map<String, Value>, CapabilityError> {
        let mut command = Command::new("pdfinfo");
        command.arg(input);
        let output = run_checked(&mut command, "pdfinfo")?;
        Ok(parse_pdfinfo(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl JobCapability for PdfParseCapability {
    fn name(&self) -> &str {
        "pdf_parse"
    }

    fn validate(&self, spec: &JobSpec) -> Result<(), CapabilityError> {
        let input_file = spec
            .parameters
            .get("input_file")
            .and_then(Value::as_str)
            .filter(|path| !path.is_empty())
            .ok_or_else(|| CapabilityError::MissingParameter {
                name: "input_file".to_string(),
            })?;

        if !input_file.to_ascii_lowercase().ends_with(".pdf") {
            return Err(CapabilityError::InvalidParameter {
                name: "input_file".to_string(),
                reason: "input file must be a PDF document".to_string(),
            });
        }

        let page_range = spec
            .parameters
            .get("page_range")
            .and_then(Value::as_str)
            .unwrap_or("all");
        parse_page_range(page_range)?;

        Ok(())
    }

    fn execute(&self, ctx: &JobContext) -> Result<Value, CapabilityError> {
        let started = Instant::now();
        info!(job_id = %ctx.spec().job_id, "processing PDF parsing job");

        let input = std::path::PathBuf::from(ctx.required_str("input_file")?);
        let page_range = ctx.param_str("page_range").unwrap_or("all").to_string();
        let layout = ctx.param_bool("layout", false);
        let want_metadata = ctx.param_bool("metadata", false);

        let range = parse_page_range(&page_range)?;
        let output_file = ctx.output_dir().join("extracted_text.txt");

        let text = self.extract_text(&input, &output_file, range, layout)?;
        ctx.report_progress(50);
        debug!(characters = text.chars().count(), "extracted text from PDF");

        let mut result = json!({
            "output_file": output_file.display().to_string(),
            "text_content": truncate_text(&text, TEXT_PREVIEW_LIMIT),
            "page_range": page_range,
            "characters_extracted": text.chars().count(),
            "processing_time_seconds": started.elapsed().as_secs_f64(),
        });

        if want_metadata {
            let metadata = self.extract_metadata(&input)?;
            let metadata_file = ctx.output_dir().join("metadata.json");
            fs::write(&metadata_file, serde_json::to_vec_pretty(&metadata)?)?;
            result["metadata"] = Value::Object(metadata);
            result["metadata_file"] = json!(metadata_file.display().to_string());
        }

        Ok(result)
    }
}

/// Parses a page range string; `None` means the whole document.
fn parse_page_range(page_range: &str) -> Result<Option<(u32, u32)>, CapabilityError> {
    let invalid = |reason: String| CapabilityError::InvalidParameter {
        name: "page_range".to_string(),
        reason,
    };

    if !PAGE_RANGE.is_match(page_range) {
        return Err(invalid(format!(
            "expected \"all\", \"N\" or \"N-M\", got '{page_range}'"
        )));
    }
    if page_range == "all" {
        return Ok(None);
    }

    let (first, last) = match page_range.split_once('-') {
        Some((first, last)) => (
            first.parse::<u32>().map_err(|e| invalid(e.to_string()))?,
            last.parse::<u32>().map_err(|e| invalid(e.to_string()))?,
        ),
        None => {
            let page = page_range
                .parse::<u32>()
                .map_err(|e| invalid(e.to_string()))?;
            (page, page)
        }
    };

    if first == 0 {
        return Err(invalid("pages are numbered from 1".to_string()));
    }
    if first > last {
        return Err(invalid(format!("range {first}-{last} is reversed")));
    }
    Ok(Some((first, last)))
}

/// Parses `pdfinfo` output lines of the form `Key: value`.
fn parse_pdfinfo(output: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_lowercase().replace(' ', "_");
            let value = value.trim();
            if !key.is_empty() && !value.is_empty() {
                metadata.insert(key, Value::String(value.to_string()));
            }
        }
    }
    if let Some(pages) = metadata
        .get("pages")
        .and_then(Value::as_str)
        .and_then(|p| p.parse::<u64>().ok())
    {
        metadata.insert("page_count".to_string(), json!(pages));
    }
    metadata
}
