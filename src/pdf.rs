use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::PdfConfig;
use crate::error::{Result, SandboxError};
use crate::executor::{ExecuteOptions, ExecutionResult, Executor, FileRef};
use crate::queue::ExecutionQueue;

/// Extraction program run inside the sandbox. It reads the first `*.pdf` in
/// its working directory and prints one JSON object; failures go to stderr as
/// `{"error": ...}` with exit code 1.
const EXTRACT_SCRIPT: &str = r#"
import json
import sys
from pathlib import Path

def fail(message):
    print(json.dumps({"error": message}), file=sys.stderr)
    sys.exit(1)

try:
    import pdfplumber
    BACKEND = "pdfplumber"
except ImportError:
    try:
        from pypdf import PdfReader
        BACKEND = "pypdf"
    except ImportError:
        fail("No PDF library available. Install pdfplumber or pypdf.")

candidates = sorted(p for p in Path.cwd().iterdir() if p.is_file() and p.suffix.lower() == ".pdf")
if not candidates:
    fail("No PDF file found in working directory")

pdf_path = candidates[0]
parts = []

try:
    if BACKEND == "pdfplumber":
        with pdfplumber.open(pdf_path) as pdf:
            page_count = len(pdf.pages)
            info = pdf.metadata or {}
            metadata = {
                "total_pages": page_count,
                "title": info.get("Title", ""),
                "author": info.get("Author", ""),
                "subject": info.get("Subject", ""),
            }
            for i, page in enumerate(pdf.pages):
                page_text = page.extract_text()
                if page_text:
                    parts.append(f"--- Page {i + 1} ---\n{page_text}")
    else:
        reader = PdfReader(str(pdf_path))
        page_count = len(reader.pages)
        info = reader.metadata or {}
        metadata = {
            "total_pages": page_count,
            "title": info.get("/Title", ""),
            "author": info.get("/Author", ""),
        }
        for i, page in enumerate(reader.pages):
            page_text = page.extract_text()
            if page_text:
                parts.append(f"--- Page {i + 1} ---\n{page_text}")

    text = "\n\n".join(parts)
    print(json.dumps({
        "text": text,
        "pageCount": page_count,
        "metadata": metadata,
        "charCount": len(text),
    }, default=str))
except Exception as e:
    fail(f"Error extracting PDF: {e}")
"#;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PdfText {
    pub text: String,
    pub page_count: u32,
    pub metadata: Map<String, Value>,
    pub char_count: usize,
}

#[derive(Deserialize)]
struct ScriptError {
    error: String,
}

/// True when either the recorded name or the stored path ends in `.pdf`.
pub fn is_pdf(filename: &str, stored_path: &Path) -> bool {
    let has_pdf_suffix = |s: &str| s.to_ascii_lowercase().ends_with(".pdf");
    has_pdf_suffix(filename) || has_pdf_suffix(&stored_path.to_string_lossy())
}

/// Text extraction for uploaded PDFs, run as an ordinary sandboxed execution
/// through the shared queue.
pub struct PdfExtractor {
    executor: Arc<Executor>,
    queue: Arc<ExecutionQueue>,
    config: PdfConfig,
}

impl PdfExtractor {
    pub fn new(executor: Arc<Executor>, queue: Arc<ExecutionQueue>, config: PdfConfig) -> Self {
        Self {
            executor,
            queue,
            config,
        }
    }

    pub async fn extract(
        &self,
        user_id: &str,
        session_id: &str,
        file_id: &str,
        filename: &str,
    ) -> Result<PdfText> {
        log::info!("Extracting PDF text from {file_id} ({filename}) in session {session_id}");

        let options = ExecuteOptions {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            lang: "py".to_string(),
            code: EXTRACT_SCRIPT.to_string(),
            files: vec![FileRef {
                id: file_id.to_string(),
                name: Some(filename.to_string()),
                session_id: Some(session_id.to_string()),
            }],
            timeout: Some(Duration::from_millis(self.config.timeout_ms)),
            memory_mb: Some(self.config.memory_mb),
            ..Default::default()
        };

        let executor = self.executor.clone();
        let result = self
            .queue
            .enqueue(async move { executor.execute(options).await })
            .await?;

        let text = parse_output(&result)?;
        log::info!(
            "PDF extraction of {file_id} done: {} pages, {} chars",
            text.page_count,
            text.char_count
        );
        Ok(text)
    }
}

fn parse_output(result: &ExecutionResult) -> Result<PdfText> {
    if result.exit_code != 0 {
        let raw = if result.stderr.trim().is_empty() {
            result.stdout.trim()
        } else {
            result.stderr.trim()
        };
        let message = match serde_json::from_str::<ScriptError>(raw) {
            Ok(e) => e.error,
            Err(_) if raw.is_empty() => "Unknown error".to_string(),
            Err(_) => raw.to_string(),
        };
        log::error!("PDF extraction failed: {message}");
        return Err(SandboxError::PdfExtraction(message));
    }

    let output = result.stdout.trim();
    if let Ok(e) = serde_json::from_str::<ScriptError>(output) {
        return Err(SandboxError::PdfExtraction(e.error));
    }
    match serde_json::from_str::<PdfText>(output) {
        Ok(text) => Ok(text),
        Err(e) => {
            let preview: String = output.chars().take(200).collect();
            log::warn!("Failed to parse extraction output ({e}), using raw text: {preview}");
            Ok(PdfText {
                text: output.to_string(),
                page_count: 0,
                metadata: Map::new(),
                char_count: output.chars().count(),
            })
        }
    }
}
