//! Documentation sections accumulated during a run.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::ToolError;

/// One titled section of the generated documentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSection {
    pub title: String,
    pub body: String,
    /// Position in insertion order, starting at 0.
    pub order: usize,
}

/// What a successful write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionWrite {
    Appended { order: usize },
    /// A section with the same title existed; its body was replaced and it
    /// kept its position.
    Replaced { order: usize },
}

/// Ordered set of sections with unique titles, bounded in count and size.
#[derive(Debug, Clone)]
pub struct DocumentSections {
    sections: Vec<DocumentSection>,
    max_sections: usize,
    max_section_bytes: usize,
}

impl DocumentSections {
    pub fn new(max_sections: usize, max_section_bytes: usize) -> Self {
        Self {
            sections: Vec::new(),
            max_sections,
            max_section_bytes,
        }
    }

    /// Append a section, or replace the body of the one with the same title.
    pub fn write(&mut self, title: &str, body: &str) -> Result<SectionWrite, ToolError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: "write_section".to_string(),
                message: "title must not be empty".to_string(),
            });
        }
        if body.len() > self.max_section_bytes {
            return Err(ToolError::SectionTooLarge {
                title: title.to_string(),
                size: body.len(),
                max: self.max_section_bytes,
            });
        }

        if let Some(existing) = self.sections.iter_mut().find(|s| s.title == title) {
            warn!(title, order = existing.order, "section rewritten, last write wins");
            existing.body = body.to_string();
            return Ok(SectionWrite::Replaced {
                order: existing.order,
            });
        }

        if self.sections.len() >= self.max_sections {
            return Err(ToolError::SectionLimit {
                max: self.max_sections,
            });
        }
        let order = self.sections.len();
        self.sections.push(DocumentSection {
            title: title.to_string(),
            body: body.to_string(),
            order,
        });
        Ok(SectionWrite::Appended { order })
    }

    pub fn as_slice(&self) -> &[DocumentSection] {
        &self.sections
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn into_vec(self) -> Vec<DocumentSection> {
        self.sections
    }
}
