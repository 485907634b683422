//! The documentation artifact and its on-disk form.
//!
//! ```text
//! <run_dir>/
//!   sections/01-overview.md
//!   sections/02-architecture.md
//!   documentation.md
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ledger::CostTotals;
use crate::tools::DocumentSection;

pub const SECTIONS_DIR: &str = "sections";
pub const DOCUMENTATION_FILE: &str = "documentation.md";

/// Result of a documentation run, complete or partial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentationArtifact {
    pub task_id: String,
    pub model: String,
    /// Sections in insertion order.
    pub sections: Vec<DocumentSection>,
    /// False when the run ended without a final answer.
    pub complete: bool,
    /// Summary passed with the final answer, if any.
    pub summary: Option<String>,
    /// Model turns taken.
    pub steps: u32,
    pub totals: CostTotals,
    pub run_dir: PathBuf,
}

impl DocumentationArtifact {
    pub fn titles(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.title.as_str()).collect()
    }

    /// All sections rendered as one Markdown document.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.complete {
            out.push_str(&format!(
                "> Partial documentation: the run for task `{}` stopped before it finished.\n\n",
                self.task_id
            ));
        }
        if let Some(summary) = self.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            out.push_str(summary.trim());
            out.push_str("\n\n");
        }
        for section in &self.sections {
            out.push_str(&render_section(section));
            out.push('\n');
        }
        out
    }

    /// Write each section and the combined document into the run directory.
    pub async fn persist(&self) -> std::io::Result<Vec<PathBuf>> {
        let dir = section_dir(&self.run_dir);
        tokio::fs::create_dir_all(&dir).await?;
        let mut written = Vec::with_capacity(self.sections.len() + 1);
        for section in &self.sections {
            let path = dir.join(section_file_name(section));
            tokio::fs::write(&path, render_section(section)).await?;
            written.push(path);
        }
        let combined = self.run_dir.join(DOCUMENTATION_FILE);
        tokio::fs::write(&combined, self.render()).await?;
        written.push(combined);
        Ok(written)
    }

    /// Path of the combined document.
    pub fn documentation_path(&self) -> PathBuf {
        self.run_dir.join(DOCUMENTATION_FILE)
    }
}

fn render_section(section: &DocumentSection) -> String {
    format!("# {}\n\n{}\n", section.title, section.body.trim_end())
}

/// `NN-slug.md`, numbered from 01 in insertion order.
pub fn section_file_name(section: &DocumentSection) -> String {
    format!("{:02}-{}.md", section.order + 1, slug(&section.title))
}

fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut dash = false;
    for c in title.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "section".to_string()
    } else {
        trimmed.chars().take(60).collect()
    }
}

pub(crate) fn section_dir(run_dir: &Path) -> PathBuf {
    run_dir.join(SECTIONS_DIR)
}
