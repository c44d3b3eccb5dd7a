//! Optical character recognition for pages without usable digital text.
//!
//! [`TesseractOcr`] shells out to `tesseract`, rendering PDF pages to PNG
//! with `pdftoppm` first. Each page runs under its own timeout and child
//! processes are killed when the timeout drops them.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::OcrConfig;
use crate::extract::{ExtractionError, MIME_PDF};

/// One page to recognize. For PDFs `bytes` is the whole document and
/// `page_number` selects the page; for images it is the image itself.
#[derive(Debug, Clone, Copy)]
pub struct OcrInput<'a> {
    pub bytes: &'a [u8],
    pub mime_type: &'a str,
    pub page_number: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrText {
    pub text: String,
    /// Mean word confidence in `[0, 1]`, when the engine reports one.
    pub confidence: Option<f32>,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn recognize(&self, input: OcrInput<'_>) -> Result<OcrText, ExtractionError>;
}

/// Engine used when OCR is turned off. Every page fails, which the adapter
/// records as a skipped page.
pub struct DisabledOcr;

#[async_trait]
impl OcrEngine for DisabledOcr {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn recognize(&self, _input: OcrInput<'_>) -> Result<OcrText, ExtractionError> {
        Err(ExtractionError::Ocr("OCR is disabled".to_string()))
    }
}

pub struct TesseractOcr {
    command: String,
    rasterizer: String,
    langs: String,
    dpi: u32,
    timeout: Duration,
}

impl TesseractOcr {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            command: config.command.clone(),
            rasterizer: config.rasterizer_command.clone(),
            langs: config.langs.clone(),
            dpi: config.dpi,
            timeout: config.page_timeout(),
        }
    }

    async fn run(&self, input: OcrInput<'_>, work: &Path) -> Result<OcrText, ExtractionError> {
        let image = if input.mime_type == MIME_PDF {
            let pdf = work.join("doc.pdf");
            tokio::fs::write(&pdf, input.bytes)
                .await
                .map_err(|e| ExtractionError::Ocr(e.to_string()))?;
            let page = input.page_number.to_string();
            let dpi = self.dpi.to_string();
            let prefix = work.join("page");
            run_tool(
                Command::new(&self.rasterizer)
                    .args(["-f", page.as_str(), "-l", page.as_str(), "-r", dpi.as_str()])
                    .args(["-png", "-singlefile"])
                    .arg(&pdf)
                    .arg(&prefix),
            )
            .await?;
            prefix.with_extension("png")
        } else {
            let image = work.join("page.img");
            tokio::fs::write(&image, input.bytes)
                .await
                .map_err(|e| ExtractionError::Ocr(e.to_string()))?;
            image
        };

        let tsv = run_tool(
            Command::new(&self.command)
                .arg(&image)
                .arg("stdout")
                .args(["-l", self.langs.as_str(), "tsv"]),
        )
        .await?;
        Ok(parse_tsv(&tsv))
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, input: OcrInput<'_>) -> Result<OcrText, ExtractionError> {
        let work = ScratchDir::create()?;
        match tokio::time::timeout(self.timeout, self.run(input, work.path())).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout(self.timeout.as_secs())),
        }
    }
}

async fn run_tool(cmd: &mut Command) -> Result<String, ExtractionError> {
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ExtractionError::Ocr(format!("failed to spawn OCR tool: {}", e)))?;
    if !output.status.success() {
        return Err(ExtractionError::Ocr(format!(
            "OCR tool exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Turn tesseract TSV output into line-preserving text and a mean word
/// confidence. Rows with `conf < 0` are layout rows, not words.
pub fn parse_tsv(tsv: &str) -> OcrText {
    let mut lines: Vec<String> = Vec::new();
    let mut current_line: Option<(String, String, String)> = None;
    let mut confidences: Vec<f32> = Vec::new();

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        let conf: f32 = cols[10].trim().parse().unwrap_or(-1.0);
        let word = cols[11].trim();
        if conf < 0.0 || word.is_empty() {
            continue;
        }
        confidences.push(conf / 100.0);

        let line_id = (cols[2].to_string(), cols[3].to_string(), cols[4].to_string());
        if current_line.as_ref() == Some(&line_id) {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(word);
            }
        } else {
            lines.push(word.to_string());
            current_line = Some(line_id);
        }
    }

    let confidence = if confidences.is_empty() {
        None
    } else {
        Some((confidences.iter().sum::<f32>() / confidences.len() as f32).clamp(0.0, 1.0))
    };
    OcrText {
        text: lines.join("\n"),
        confidence,
    }
}

/// Per-call working directory, removed on drop.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn create() -> Result<Self, ExtractionError> {
        let path = std::env::temp_dir().join(format!("gw-ocr-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).map_err(|e| ExtractionError::Ocr(e.to_string()))?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

pub fn build_engine(config: &OcrConfig) -> std::sync::Arc<dyn OcrEngine> {
    match config.engine.as_str() {
        "tesseract" => std::sync::Arc::new(TesseractOcr::new(config)),
        _ => std::sync::Arc::new(DisabledOcr),
    }
}
