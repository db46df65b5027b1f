//! Document classification via the LLM.

use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::parser::parse_classification;
use super::types::ClassificationResult;
use crate::error::PipelineError;
use crate::extract::TextExtractor;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

/// Extracted text shorter than this (after trimming) is not worth a model call.
const MIN_TEXT_CHARS: usize = 10;

/// Longer text is cut to this many characters before prompting.
const MAX_TEXT_CHARS: usize = 10_000;

const TRUNCATION_MARKER: &str = "\n... (truncated)";

const MAX_RESPONSE_TOKENS: u32 = 1024;

const SYSTEM_PROMPT: &str = r#"You are an expert document classifier specialized in identifying invoices.

Your task is to analyze the provided document text and determine if it is an invoice or not.

An invoice typically contains:
- Invoice number or ID
- Date of issuance
- Seller/vendor information (name, address, contact)
- Buyer/customer information
- Line items with descriptions and prices
- Subtotal, taxes, and total amount
- Payment terms or due date

Respond with a JSON object containing:
- document_type: "invoice" or "non_invoice"
- confidence: a float between 0.0 and 1.0
- reasoning: a brief explanation of your classification
- metadata: any relevant extracted information (invoice_number, date, total_amount, etc.)

Be thorough but concise in your reasoning."#;

/// Classification seam used by the pipeline.
#[async_trait]
pub trait DocumentClassifier: Send + Sync {
    /// Classify the document stored at `file_path`. `file_name` is the name the
    /// document arrived with, which may differ from the stored file's name.
    async fn classify(
        &self,
        file_path: &Path,
        file_name: &str,
    ) -> Result<ClassificationResult, PipelineError>;
}

/// Classifier backed by a text extractor and an LLM.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
    extractor: Arc<dyn TextExtractor>,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, extractor: Arc<dyn TextExtractor>) -> Self {
        Self { llm, extractor }
    }

    /// Classify a document. Every failure degrades to an `Unknown` result.
    pub async fn classify_document(&self, file_path: &Path, file_name: &str) -> ClassificationResult {
        tracing::info!(path = %file_path.display(), "Classifying document");

        let text = self.extractor.extract_text(file_path).await;
        if text.trim().chars().count() < MIN_TEXT_CHARS {
            tracing::warn!(path = %file_path.display(), "Insufficient text extracted");
            return ClassificationResult::unknown("Insufficient text extracted from document");
        }

        let request = CompletionRequest::new(build_messages(file_name, &truncate_text(&text)))
            .with_temperature(0.0)
            .with_max_tokens(MAX_RESPONSE_TOKENS);

        let response = match self.llm.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(path = %file_path.display(), error = %e, "Model call failed");
                return ClassificationResult::unknown(format!("Error during classification: {e}"));
            }
        };

        let result = parse_classification(&response.content);
        tracing::info!(
            path = %file_path.display(),
            document_type = %result.document_type(),
            confidence = result.confidence(),
            model = self.llm.model_name(),
            "Classification complete"
        );
        result
    }
}

#[async_trait]
impl DocumentClassifier for LlmClassifier {
    async fn classify(
        &self,
        file_path: &Path,
        file_name: &str,
    ) -> Result<ClassificationResult, PipelineError> {
        Ok(self.classify_document(file_path, file_name).await)
    }
}

/// Cut to [`MAX_TEXT_CHARS`] characters and append the marker when cut.
fn truncate_text(text: &str) -> Cow<'_, str> {
    match text.char_indices().nth(MAX_TEXT_CHARS) {
        Some((byte_idx, _)) => Cow::Owned(format!("{}{TRUNCATION_MARKER}", &text[..byte_idx])),
        None => Cow::Borrowed(text),
    }
}

fn build_messages(filename: &str, text: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Please classify the following document:\n\n\
             Filename: {filename}\n\n\
             Document Text:\n{text}\n\n\
             Provide your classification in JSON format."
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::LlmError;
    use crate::llm::CompletionResponse;
    use crate::pipeline::types::DocumentType;

    struct FixedText(String);

    #[async_trait]
    impl TextExtractor for FixedText {
        async fn extract_text(&self, _path: &Path) -> String {
            self.0.clone()
        }
    }

    /// Records prompts and replies with a canned response or error.
    struct MockLlm {
        response: Result<String, String>,
        calls: AtomicUsize,
        last_prompt: Mutex<Option<String>>,
    }

    impl MockLlm {
        fn replying(response: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(response.to_string()),
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(None),
            })
        }

        fn failing(reason: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Err(reason.to_string()),
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = request.messages.last().map(|m| m.content.clone());
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                }),
                Err(reason) => Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: reason.clone(),
                }),
            }
        }
    }

    fn classifier(llm: Arc<MockLlm>, text: &str) -> LlmClassifier {
        LlmClassifier::new(llm, Arc::new(FixedText(text.to_string())))
    }

    #[tokio::test]
    async fn short_text_skips_the_model() {
        let llm = MockLlm::replying(r#"{"document_type":"invoice","confidence":1.0}"#);
        let result = classifier(llm.clone(), "  12345  ")
            .classify_document(Path::new("/tmp/scan.png"), "scan.png")
            .await;

        assert_eq!(result.document_type(), DocumentType::Unknown);
        assert_eq!(result.confidence(), 0.0);
        assert!(result.reasoning().to_lowercase().contains("insufficient text"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prompt_carries_filename_and_text() {
        let llm = MockLlm::replying(r#"{"document_type":"invoice","confidence":0.95,"reasoning":"has totals"}"#);
        let result = classifier(llm.clone(), "Invoice INV-7 Total due: 120 EUR")
            .classify_document(Path::new("/storage/temp/invoice123_1.pdf"), "invoice123.pdf")
            .await;

        assert_eq!(result.document_type(), DocumentType::Invoice);
        assert_eq!(result.confidence(), 0.95);
        let prompt = llm.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("Filename: invoice123.pdf\n"));
        assert!(!prompt.contains("invoice123_1.pdf"));
        assert!(prompt.contains("Invoice INV-7 Total due: 120 EUR"));
        assert!(!prompt.contains("(truncated)"));
    }

    #[tokio::test]
    async fn long_text_is_truncated() {
        let llm = MockLlm::replying(r#"{"document_type":"non_invoice","confidence":0.6}"#);
        let text = "é".repeat(MAX_TEXT_CHARS + 500);
        classifier(llm.clone(), &text)
            .classify_document(Path::new("/tmp/long.txt"), "long.txt")
            .await;

        let prompt = llm.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains(&format!("{}{}", "é".repeat(MAX_TEXT_CHARS), TRUNCATION_MARKER)));
        assert!(!prompt.contains(&"é".repeat(MAX_TEXT_CHARS + 1)));
    }

    #[tokio::test]
    async fn model_error_degrades_to_unknown() {
        let llm = MockLlm::failing("connection reset");
        let result = classifier(llm.clone(), "Invoice number 99, amount due 10 USD")
            .classify(Path::new("/tmp/a.pdf"), "a.pdf")
            .await
            .unwrap();

        assert_eq!(result.document_type(), DocumentType::Unknown);
        assert_eq!(result.confidence(), 0.0);
        assert!(result.reasoning().starts_with("Error during classification:"));
        assert!(result.reasoning().contains("connection reset"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn truncate_leaves_short_text_alone() {
        assert!(matches!(truncate_text("short"), Cow::Borrowed("short")));
    }
}
