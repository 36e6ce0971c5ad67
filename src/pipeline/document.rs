//! Document-to-text boundary. Only plain text formats are read here;
//! richer formats belong to external converters implementing `DocumentReader`.

use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt document: {0}")]
    CorruptDocument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait DocumentReader: Send + Sync {
    fn read_text(&self, path: &Path) -> Result<String, DocumentError>;
}

/// Reads `.txt` and `.md` files as UTF-8.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextReader;

const PLAIN_TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text"];

impl DocumentReader for PlainTextReader {
    fn read_text(&self, path: &Path) -> Result<String, DocumentError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !PLAIN_TEXT_EXTENSIONS.contains(&extension.as_str()) {
            return Err(DocumentError::UnsupportedFormat(if extension.is_empty() {
                "no extension".into()
            } else {
                extension
            }));
        }

        let bytes = std::fs::read(path)?;
        let text = String::from_utf8(bytes).map_err(|e| {
            DocumentError::CorruptDocument(format!(
                "{} is not valid UTF-8 (byte {})",
                path.display(),
                e.utf8_error().valid_up_to()
            ))
        })?;
        // Strip a UTF-8 byte-order mark.
        Ok(text.strip_prefix('\u{FEFF}').map(str::to_string).unwrap_or(text))
    }
}
