//! Best-effort plain text extraction from stored documents.
//!
//! Dispatch is by file suffix. Every failure (unsupported type, missing
//! tool, timeout, corrupt file) degrades to an empty string with a log line.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

/// Upper bound for any external extraction command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const IMAGE_SUFFIXES: &[&str] = &["png", "jpg", "jpeg", "tiff", "bmp"];

static PARAGRAPH_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</w:p>|<w:br\s*/>").expect("valid regex"));
static XML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

/// Text extraction seam used by the classifier.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract text from `path`. Never fails; returns "" when nothing can be read.
    async fn extract_text(&self, path: &Path) -> String;
}

/// Extractor for PDF, Word, image and plain text files.
pub struct DocumentTextExtractor {
    command_timeout: Duration,
}

impl DocumentTextExtractor {
    pub fn new() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn extract_pdf(&self, path: &Path) -> Result<String, String> {
        let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|e| format!("pdf extraction task failed: {e}"))?
            .map_err(|e| format!("pdf extraction failed: {e}"))
    }

    async fn extract_docx(&self, path: &Path) -> Result<String, String> {
        let stdout = self
            .run_command(
                "unzip",
                &[OsStr::new("-p"), path.as_os_str(), OsStr::new("word/document.xml")],
            )
            .await?;
        Ok(docx_xml_to_text(&String::from_utf8_lossy(&stdout)))
    }

    async fn extract_image(&self, path: &Path) -> Result<String, String> {
        let stdout = self
            .run_command("tesseract", &[path.as_os_str(), OsStr::new("stdout")])
            .await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    /// Run an external tool and return its stdout, bounded by the timeout.
    async fn run_command(
        &self,
        program: &str,
        args: &[&OsStr],
    ) -> Result<Vec<u8>, String> {
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| format!("{program} timed out after {:?}", self.command_timeout))?
            .map_err(|e| format!("{program} could not be started: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("{program} exited with {}: {}", output.status, stderr.trim()));
        }
        Ok(output.stdout)
    }
}

impl Default for DocumentTextExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextExtractor for DocumentTextExtractor {
    async fn extract_text(&self, path: &Path) -> String {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                tracing::warn!(path = %path.display(), "Not a regular file, skipping extraction");
                return String::new();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot access file for extraction");
                return String::new();
            }
        }

        let suffix = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let result = match suffix.as_str() {
            "pdf" => self.extract_pdf(path).await,
            "docx" | "doc" => self.extract_docx(path).await,
            s if IMAGE_SUFFIXES.contains(&s) => self.extract_image(path).await,
            "txt" => tokio::fs::read(path)
                .await
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .map_err(|e| e.to_string()),
            _ => {
                tracing::warn!(path = %path.display(), suffix = %suffix, "Unsupported file type");
                return String::new();
            }
        };

        match result {
            Ok(text) => {
                tracing::debug!(path = %path.display(), chars = text.chars().count(), "Text extracted");
                text
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Text extraction failed");
                String::new()
            }
        }
    }
}

/// Flatten `word/document.xml` into plain text, one line per paragraph.
fn docx_xml_to_text(xml: &str) -> String {
    let with_breaks = PARAGRAPH_END.replace_all(xml, "\n");
    let stripped = XML_TAG.replace_all(&with_breaks, "");
    stripped
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_is_cut_off() {
        let extractor = DocumentTextExtractor::with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();

        let err = extractor
            .run_command("sleep", &[OsStr::new("5")])
            .await
            .unwrap_err();

        assert!(err.contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn docx_xml_is_flattened() {
        let xml = r#"<w:document><w:body><w:p><w:r><w:t>Invoice #42</w:t></w:r></w:p><w:p><w:r><w:t>Total: 10 &amp; 5</w:t></w:r></w:p></w:body></w:document>"#;
        assert_eq!(docx_xml_to_text(xml), "Invoice #42\nTotal: 10 & 5");
    }

    #[tokio::test]
    async fn plain_text_is_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.TXT");
        std::fs::write(&path, "Invoice number 1001").unwrap();

        let text = DocumentTextExtractor::new().extract_text(&path).await;
        assert_eq!(text, "Invoice number 1001");
    }

    #[tokio::test]
    async fn unsupported_suffix_yields_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.xyz");
        std::fs::write(&path, "whatever").unwrap();

        assert!(DocumentTextExtractor::new().extract_text(&path).await.is_empty());
    }

    #[tokio::test]
    async fn missing_file_and_directories_yield_empty() {
        let dir = TempDir::new().unwrap();
        let extractor = DocumentTextExtractor::new();

        assert!(extractor.extract_text(&dir.path().join("nope.txt")).await.is_empty());
        assert!(extractor.extract_text(dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_pdf_yields_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"definitely not a pdf").unwrap();

        assert!(DocumentTextExtractor::new().extract_text(&path).await.is_empty());
    }
}
