//! PDF render abstraction
//!
//! Produces the signable PDF artifact for a drafted document. Rendering
//! is deterministic for identical inputs: artifacts are written under a
//! content-addressed name, so re-rendering the same draft yields the
//! same blob reference. Render failures are content problems and are
//! never retried.

use crate::config::RenderConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document as PdfDocument, Object, Stream};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Body lines per page at 11pt with 14pt leading
const LINES_PER_PAGE: usize = 42;

/// Wrap width in characters for the body font
const WRAP_WIDTH: usize = 88;

/// Trait for PDF production
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render content into a PDF artifact and return its blob reference
    async fn render(&self, title: &str, content: &str, template_id: &str) -> Result<String>;
}

/// Renderer writing lopdf-built artifacts to a local blob directory
pub struct PdfRenderer {
    artifact_dir: PathBuf,
    page_width: i64,
    page_height: i64,
}

impl PdfRenderer {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            artifact_dir: PathBuf::from(&config.artifact_dir),
            page_width: config.page_width as i64,
            page_height: config.page_height as i64,
        }
    }

    /// Build the PDF bytes for a title and pre-wrapped body lines
    fn build_pdf(&self, title: &str, lines: &[String]) -> std::result::Result<Vec<u8>, lopdf::Error> {
        let mut doc = PdfDocument::with_version("1.5");
        let pages_id = doc.new_object_id();

        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut page_ids: Vec<Object> = Vec::new();
        let pages = if lines.is_empty() {
            vec![&lines[..]]
        } else {
            lines.chunks(LINES_PER_PAGE).collect()
        };

        for (page_no, page_lines) in pages.iter().enumerate() {
            let mut ops = Vec::new();

            // Title header on the first page only
            if page_no == 0 {
                ops.extend([
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 18.into()]),
                    Operation::new(
                        "Td",
                        vec![72.into(), (self.page_height - 72).into()],
                    ),
                    Operation::new("Tj", vec![Object::string_literal(sanitize(title))]),
                    Operation::new("ET", vec![]),
                ]);
            }

            let body_top = if page_no == 0 {
                self.page_height - 108
            } else {
                self.page_height - 72
            };

            ops.extend([
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 11.into()]),
                Operation::new("TL", vec![14.into()]),
                Operation::new("Td", vec![72.into(), body_top.into()]),
            ]);
            for line in page_lines.iter() {
                ops.push(Operation::new("'", vec![Object::string_literal(sanitize(line))]));
            }
            ops.push(Operation::new("ET", vec![]));

            let content = Content { operations: ops };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "MediaBox" => vec![
                    0.into(),
                    0.into(),
                    self.page_width.into(),
                    self.page_height.into(),
                ],
                "Resources" => resources_id,
            });
            page_ids.push(page_id.into());
        }

        let page_count = page_ids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => page_ids,
                "Count" => page_count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.compress();

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes)?;
        Ok(bytes)
    }
}

#[async_trait]
impl Renderer for PdfRenderer {
    async fn render(&self, title: &str, content: &str, template_id: &str) -> Result<String> {
        if content.trim().is_empty() {
            return Err(AppError::Render {
                template_id: template_id.to_string(),
                message: "Empty document content".to_string(),
            });
        }

        let lines = wrap_text(content, WRAP_WIDTH);
        let bytes = self
            .build_pdf(title, &lines)
            .map_err(|e| AppError::Render {
                template_id: template_id.to_string(),
                message: format!("PDF build failed: {}", e),
            })?;

        // Content-addressed artifact name keeps rendering deterministic
        let mut hasher = Sha256::new();
        hasher.update(template_id.as_bytes());
        hasher.update(content.as_bytes());
        let digest = hex::encode(hasher.finalize());
        let file_name = format!("{}.pdf", &digest[..32]);

        tokio::fs::create_dir_all(&self.artifact_dir).await?;
        let path = self.artifact_dir.join(&file_name);
        tokio::fs::write(&path, &bytes).await?;

        tracing::debug!(
            blob_ref = %path.display(),
            bytes = bytes.len(),
            "Rendered document artifact"
        );

        Ok(path.to_string_lossy().into_owned())
    }
}

/// Replace characters outside the base font's reach
fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if (c as u32) < 256 { c } else { '?' })
        .collect()
}

/// Greedy word wrap preserving explicit line breaks
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for raw in text.lines() {
        if raw.len() <= width {
            lines.push(raw.to_string());
            continue;
        }
        let mut current = String::new();
        for word in raw.split_whitespace() {
            if !current.is_empty() && current.len() + 1 + word.len() > width {
                lines.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            lines.push(current);
        }
    }
    lines
}

/// Mock renderer for testing
pub struct MockRenderer {
    failing: bool,
    calls: AtomicU32,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self {
            failing: false,
            calls: AtomicU32::new(0),
        }
    }

    /// Fail every render with a non-retryable error
    pub fn failing() -> Self {
        Self {
            failing: true,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn render(&self, _title: &str, content: &str, template_id: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(AppError::Render {
                template_id: template_id.to_string(),
                message: "mock render failure".to_string(),
            });
        }
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Ok(format!("blob:mock/{}", &hex::encode(hasher.finalize())[..16]))
    }
}

/// Create a renderer based on configuration
pub fn create_renderer(config: &RenderConfig) -> Arc<dyn Renderer> {
    Arc::new(PdfRenderer::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;

    fn test_renderer() -> PdfRenderer {
        let dir = std::env::temp_dir()
            .join("careforge-render-tests")
            .join(uuid::Uuid::new_v4().to_string());
        PdfRenderer::new(&RenderConfig {
            artifact_dir: dir.to_string_lossy().into_owned(),
            ..RenderConfig::default()
        })
    }

    #[tokio::test]
    async fn test_render_writes_pdf_artifact() {
        let renderer = test_renderer();
        let blob_ref = renderer
            .render("Patient Consent", "Name: Jane Doe\nScope: all records", "patient_consent")
            .await
            .unwrap();

        let bytes = tokio::fs::read(&blob_ref).await.unwrap();
        assert!(bytes.starts_with(b"%PDF-"));
    }

    #[tokio::test]
    async fn test_render_is_deterministic() {
        let renderer = test_renderer();
        let a = renderer
            .render("Title", "same content", "patient_consent")
            .await
            .unwrap();
        let b = renderer
            .render("Title", "same content", "patient_consent")
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_empty_content_is_a_render_error() {
        let renderer = test_renderer();
        let err = renderer
            .render("Title", "   ", "patient_consent")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Render { .. }));
    }

    #[tokio::test]
    async fn test_long_content_paginates() {
        let renderer = test_renderer();
        let content = (0..200)
            .map(|i| format!("Line {} of the agreement body", i))
            .collect::<Vec<_>>()
            .join("\n");
        let blob_ref = renderer
            .render("Long Document", &content, "medical_record")
            .await
            .unwrap();
        let bytes = tokio::fs::read(&blob_ref).await.unwrap();
        assert!(bytes.starts_with(b"%PDF-"));
    }

    #[test]
    fn test_wrap_text_respects_width() {
        let text = "one two three four five six seven eight nine ten";
        let lines = wrap_text(text, 12);
        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| l.len() <= 12));
    }

    #[test]
    fn test_wrap_text_preserves_line_breaks() {
        let lines = wrap_text("first\nsecond", 80);
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);
    }
}
