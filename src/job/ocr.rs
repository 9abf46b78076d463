//! OCR capability
//!
//! Extracts text from images and PDFs with the tesseract engine. PDF
//! inputs are rasterized page by page with poppler's `pdftoppm`, each
//! page is fed to `tesseract` in TSV mode, and the recognized words are
//! reassembled with per-page confidence tracking.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::job::capability::{run_checked, CapabilityError, JobCapability, JobContext};
use crate::job::{truncate_text, JobSpec, TEXT_PREVIEW_LIMIT};

const DEFAULT_LANGUAGE: &str = "eng";
const DEFAULT_FORMAT: &str = "txt";
const DEFAULT_DPI: u64 = 300;
const DEFAULT_PSM: u64 = 3;
const DEFAULT_OEM: u64 = 3;

/// Languages the bundled tesseract data is known to cover. Anything
/// else is attempted anyway with a warning.
const KNOWN_LANGUAGES: &[&str] = &[
    "eng", "fra", "deu", "spa", "ita", "por", "chi_sim", "chi_tra", "jpn", "kor",
];

/// Formats accepted for `output_format`. Only `txt` and `json` have
/// dedicated writers; the rest fall back to plain text.
const OUTPUT_FORMATS: &[&str] = &["txt", "json", "docx", "pdf", "csv"];

/// Recognized text and quality figures for one page.
struct PageText {
    text: String,
    confidence: f64,
    word_count: usize,
}

/// Aggregate counters across all pages of one job.
#[derive(Default)]
struct OcrRun {
    pages_processed: usize,
    characters_recognized: usize,
    confidence_score: f64,
    page_details: Vec<Value>,
}

/// The `ocr` job type.
#[derive(Debug, Default, Clone, Copy)]
pub struct OcrCapability;

impl OcrCapability {
    /// Creates the capability.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Rasterizes a PDF into `pages_dir` as `page-NNN.jpg` images.
    fn extract_pages(
        &self,
        pdf: &Path,
        pages_dir: &Path,
        dpi: u64,
    ) -> Result<(), CapabilityError> {
        info!(input = %pdf.display(), dpi, "extracting pages from PDF");

        let mut command = Command::new("pdftoppm");
        command
            .arg("-jpeg")
            .args(["-r", &dpi.to_string()])
            .arg(pdf)
            .arg(pages_dir.join("page"));
        run_checked(&mut command, "pdftoppm")?;

        let pages = list_pages(pages_dir)?;
        if pages.is_empty() {
            return Err(CapabilityError::ToolFailed {
                tool: "pdftoppm".to_string(),
                code: 0,
                stderr: "no page images produced".to_string(),
            });
        }

        debug!(pages = pages.len(), "extracted pages from PDF");
        Ok(())
    }

    /// Runs tesseract on one page image and parses its TSV output.
    fn ocr_page(
        &self,
        image: &Path,
        language: &str,
        psm: u64,
        oem: u64,
        extra: &[String],
    ) -> Result<PageText, CapabilityError> {
        let mut command = Command::new("tesseract");
        command
            .arg(image)
            .arg("stdout")
            .args(["-l", language])
            .args(["--psm", &psm.to_string()])
            .args(["--oem", &oem.to_string()])
            .args(extra)
            .arg("tsv");

        let output = run_checked(&mut command, "tesseract")?;
        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Writes the combined text to the job's output directory and
    /// returns the file path.
    fn save_output(
        &self,
        ctx: &JobContext,
        text: &str,
        format: &str,
        run: &OcrRun,
    ) -> Result<PathBuf, CapabilityError> {
        let output_path = if format == "json" {
            let path = ctx.output_dir().join("ocr_output.json");
            let data = json!({
                "job_id": ctx.spec().job_id,
                "text": text,
                "pages": run.page_details,
                "confidence": run.confidence_score,
                "pages_processed": run.pages_processed,
                "characters_recognized": run.characters_recognized,
            });
            fs::write(&path, serde_json::to_vec_pretty(&data)?)?;
            path
        } else {
            // docx, pdf and csv writers are not implemented yet; they
            // fall back to plain text alongside "txt" itself.
            let path = ctx.output_dir().join("ocr_output.txt");
            fs::write(&path, text)?;
            path
        };

        info!(output = %output_path.display(), "saved OCR output");
        Ok(output_path)
    }
}

impl JobCapability for OcrCapability {
    fn name(&self) -> &str {
        "ocr"
    }

    fn validate(&self, spec: &JobSpec) -> Result<(), CapabilityError> {
        let has_input = spec
            .parameters
            .get("input_file")
            .and_then(Value::as_str)
            .is_some_and(|path| !path.is_empty());
        if !has_input {
            return Err(CapabilityError::MissingParameter {
                name: "input_file".to_string(),
            });
        }

        let language = spec
            .parameters
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_LANGUAGE);
        if !KNOWN_LANGUAGES.contains(&language) {
            warn!(language, "language may not be supported by the OCR engine");
        }

        let format = spec
            .parameters
            .get("output_format")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_FORMAT);
        if !OUTPUT_FORMATS.contains(&format) {
            return Err(CapabilityError::InvalidParameter {
                name: "output_format".to_string(),
                reason: format!("unsupported format '{format}'"),
            });
        }

        parse_extra_args(spec.parameters.get("advanced_options").and_then(Value::as_object))?;

        Ok(())
    }

    fn execute(&self, ctx: &JobContext) -> Result<Value, CapabilityError> {
        let started = Instant::now();
        let job_id = &ctx.spec().job_id;
        info!(%job_id, "processing OCR job");

        let input_file = PathBuf::from(ctx.required_str("input_file")?);
        let language = ctx.param_str("language").unwrap_or(DEFAULT_LANGUAGE);
        let output_format = ctx.param_str("output_format").unwrap_or(DEFAULT_FORMAT);
        let dpi = ctx.param_u64("dpi", DEFAULT_DPI);
        let advanced = ctx.param_object("advanced_options");
        let psm = advanced
            .and_then(|options| options.get("psm"))
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_PSM);
        let oem = advanced
            .and_then(|options| options.get("oem"))
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_OEM);
        let extra_args = parse_extra_args(advanced)?;

        let pages_dir = ctx.workspace().root().join("pages");
        fs::create_dir_all(&pages_dir)?;

        let is_pdf = input_file
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if is_pdf {
            self.extract_pages(&input_file, &pages_dir, dpi)?;
        } else {
            fs::copy(&input_file, pages_dir.join("page-001.jpg"))?;
        }

        let page_files = list_pages(&pages_dir)?;
        let total_pages = page_files.len();
        info!(pages = total_pages, "running OCR over pages");

        let mut all_text = String::new();
        let mut page_confidences = Vec::new();
        let mut run = OcrRun::default();

        for (index, page_file) in page_files.iter().enumerate() {
            let page_number = index + 1;
            ctx.report_progress(progress_percent(index, total_pages));

            match self.ocr_page(page_file, language, psm, oem, &extra_args) {
                Ok(page) => {
                    append_page(&mut all_text, page_number, &page.text);
                    run.characters_recognized += page.text.chars().count();
                    page_confidences.push(page.confidence);
                    run.page_details.push(json!({
                        "page_number": page_number,
                        "confidence_score": page.confidence,
                        "word_count": page.word_count,
                    }));
                    run.pages_processed += 1;
                }
                Err(err) => {
                    error!(page = page_number, error = %err, "OCR failed for page");
                    run.page_details.push(json!({
                        "page_number": page_number,
                        "error": err.to_string(),
                    }));
                }
            }
        }

        run.confidence_score = average(&page_confidences);
        let output_file = self.save_output(ctx, &all_text, output_format, &run)?;

        Ok(json!({
            "output_file": output_file.display().to_string(),
            "text_content": truncate_text(&all_text, TEXT_PREVIEW_LIMIT),
            "pages_processed": run.pages_processed,
            "characters_recognized": run.characters_recognized,
            "confidence_score": run.confidence_score,
            "processing_time_seconds": started.elapsed().as_secs_f64(),
            "page_details": run.page_details,
        }))
    }
}

/// Splits `advanced_options.extra_args` into argv tokens for the OCR
/// engine. Absent means no extra arguments.
fn parse_extra_args(
    advanced: Option<&serde_json::Map<String, Value>>,
) -> Result<Vec<String>, CapabilityError> {
    let Some(extra) = advanced.and_then(|options| options.get("extra_args")) else {
        return Ok(Vec::new());
    };
    let Some(extra) = extra.as_str() else {
        return Err(CapabilityError::InvalidParameter {
            name: "advanced_options.extra_args".to_string(),
            reason: "must be a string".to_string(),
        });
    };
    shell_words::split(extra).map_err(|err| CapabilityError::InvalidParameter {
        name: "advanced_options.extra_args".to_string(),
        reason: err.to_string(),
    })
}

/// Lists `page-*` images in rasterization order.
fn list_pages(pages_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut pages = Vec::new();
    for entry in fs::read_dir(pages_dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("page-") {
            pages.push(entry.path());
        }
    }
    pages.sort();
    Ok(pages)
}

/// Parses tesseract TSV output into joined text plus confidence figures.
///
/// Structural rows carry confidence -1 and empty text; word confidences
/// of 0 are kept out of the average but their text still counts.
fn parse_tsv(tsv: &str) -> PageText {
    let mut words: Vec<&str> = Vec::new();
    let mut confidences = Vec::new();

    for line in tsv.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }
        if let Ok(conf) = fields[10].parse::<f64>() {
            if conf > 0.0 {
                confidences.push(conf);
            }
        }
        let word = fields[11].trim();
        if !word.is_empty() {
            words.push(word);
        }
    }

    PageText {
        text: words.join(" "),
        confidence: average(&confidences),
        word_count: words.len(),
    }
}

/// Appends one page's text with a `----- Page N -----` separator.
fn append_page(all_text: &mut String, page_number: usize, text: &str) {
    if all_text.is_empty() {
        all_text.push_str(&format!("----- Page {page_number} -----\n\n"));
    } else {
        all_text.push_str(&format!("\n\n----- Page {page_number} -----\n\n"));
    }
    all_text.push_str(text);
}

#[allow(clippy::cast_precision_loss)]
fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[allow(clippy::cast_possible_truncation)]
fn progress_percent(index: usize, total: usize) -> u8 {
    if total == 0 {
        0
    } else {
        ((index * 100) / total) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobWorkspace;
    use serde_json::json;
    use tempfile::TempDir;

    fn spec_with(params: &[(&str, Value)]) -> JobSpec {
        let mut spec = JobSpec::new("j-ocr", "ocr");
        for (name, value) in params {
            spec = spec.with_parameter(*name, value.clone());
        }
        spec
    }

    #[test]
    fn test_validate_requires_input_file() {
        let capability = OcrCapability::new();
        let err = capability.validate(&spec_with(&[])).unwrap_err();
        assert!(matches!(err, CapabilityError::MissingParameter { name } if name == "input_file"));
    }

    #[test]
    fn test_validate_rejects_unknown_format() {
        let capability = OcrCapability::new();
        let spec = spec_with(&[
            ("input_file", json!("/data/scan.pdf")),
            ("output_format", json!("xlsx")),
        ]);
        let err = capability.validate(&spec).unwrap_err();
        assert!(
            matches!(err, CapabilityError::InvalidParameter { name, .. } if name == "output_format")
        );
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let capability = OcrCapability::new();
        let spec = spec_with(&[("input_file", json!("/data/scan.pdf"))]);
        capability.validate(&spec).unwrap();
    }

    #[test]
    fn test_validate_tolerates_unlisted_language() {
        // Unknown languages only warn; the engine decides at runtime.
        let capability = OcrCapability::new();
        let spec = spec_with(&[
            ("input_file", json!("/data/scan.png")),
            ("language", json!("tlh")),
        ]);
        capability.validate(&spec).unwrap();
    }

    #[test]
    fn test_parse_tsv_words_and_confidence() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   1\t1\t0\t0\t0\t0\t0\t0\t640\t480\t-1\t\n\
                   5\t1\t1\t1\t1\t1\t10\t10\t50\t20\t96.5\tHello\n\
                   5\t1\t1\t1\t1\t2\t70\t10\t50\t20\t91.5\tworld\n\
                   5\t1\t1\t1\t1\t3\t130\t10\t50\t20\t0\tz\n";

        let page = parse_tsv(tsv);
        assert_eq!(page.text, "Hello world z");
        assert_eq!(page.word_count, 3);
        // The zero-confidence word is excluded from the average.
        assert!((page.confidence - 94.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_tsv_empty_page() {
        let page = parse_tsv("level\tpage_num\n");
        assert_eq!(page.text, "");
        assert_eq!(page.word_count, 0);
        assert!((page.confidence - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_page_separators() {
        let mut text = String::new();
        append_page(&mut text, 1, "first page");
        append_page(&mut text, 2, "second page");
        assert_eq!(
            text,
            "----- Page 1 -----\n\nfirst page\n\n----- Page 2 -----\n\nsecond page"
        );
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 4), 0);
        assert_eq!(progress_percent(1, 4), 25);
        assert_eq!(progress_percent(3, 4), 75);
        assert_eq!(progress_percent(0, 0), 0);
    }

    #[test]
    fn test_save_output_txt_and_json() {
        let temp = TempDir::new().unwrap();
        let capability = OcrCapability::new();
        let run = OcrRun {
            pages_processed: 1,
            characters_recognized: 5,
            confidence_score: 90.0,
            page_details: vec![json!({"page_number": 1, "confidence_score": 90.0, "word_count": 1})],
        };

        let spec = spec_with(&[("input_file", json!("/data/scan.pdf"))]);
        let workspace = JobWorkspace::create(temp.path(), "j-ocr").unwrap();
        let ctx = JobContext::new(spec, workspace);

        let txt_path = capability.save_output(&ctx, "hello", "txt", &run).unwrap();
        assert_eq!(fs::read_to_string(&txt_path).unwrap(), "hello");

        let json_path = capability.save_output(&ctx, "hello", "json", &run).unwrap();
        let data: Value = serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(data["job_id"], "j-ocr");
        assert_eq!(data["text"], "hello");
        assert_eq!(data["pages_processed"], 1);

        // Unimplemented formats fall back to plain text.
        let fallback = capability.save_output(&ctx, "hello", "docx", &run).unwrap();
        assert!(fallback.to_string_lossy().ends_with("ocr_output.txt"));
    }

    #[test]
    fn test_parse_extra_args() {
        assert!(parse_extra_args(None).unwrap().is_empty());

        let options = json!({"extra_args": "-c tessedit_char_whitelist=0123456789"});
        let args = parse_extra_args(options.as_object()).unwrap();
        assert_eq!(args, vec!["-c", "tessedit_char_whitelist=0123456789"]);

        let quoted = json!({"extra_args": "--user-words 'my words.txt'"});
        let args = parse_extra_args(quoted.as_object()).unwrap();
        assert_eq!(args, vec!["--user-words", "my words.txt"]);
    }

    #[test]
    fn test_validate_rejects_bad_extra_args() {
        let capability = OcrCapability::new();

        let spec = spec_with(&[
            ("input_file", json!("/data/scan.pdf")),
            ("advanced_options", json!({"extra_args": "--oops 'unbalanced"})),
        ]);
        assert!(matches!(
            capability.validate(&spec),
            Err(CapabilityError::InvalidParameter { name, .. }) if name == "advanced_options.extra_args"
        ));

        let spec = spec_with(&[
            ("input_file", json!("/data/scan.pdf")),
            ("advanced_options", json!({"extra_args": 7})),
        ]);
        assert!(matches!(
            capability.validate(&spec),
            Err(CapabilityError::InvalidParameter { name, .. }) if name == "advanced_options.extra_args"
        ));
    }
}
