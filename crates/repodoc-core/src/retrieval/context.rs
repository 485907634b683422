//! Context packing for retrieval answers.
//!
//! Retrieved chunks are packed in rank order into a fixed character budget.
//! A chunk that does not fit is dropped; later, smaller chunks may still fit.

use super::index::ScoredChunk;

/// One packed chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextItem {
    pub source: String,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub score: f32,
}

impl ContextItem {
    pub fn from_scored(hit: &ScoredChunk<'_>) -> Self {
        let chunk = &hit.entry.chunk;
        Self {
            source: chunk.source.clone(),
            start: chunk.start,
            end: chunk.end,
            text: chunk.text.clone(),
            score: hit.score,
        }
    }

    fn render(&self) -> String {
        format!("[{}]\n{}", self.source, self.text.trim())
    }
}

const SEPARATOR: &str = "\n\n---\n\n";

/// A character-bounded block of retrieved context.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    budget: usize,
    used: usize,
    items: Vec<ContextItem>,
    dropped: usize,
}

impl ContextWindow {
    pub fn new(budget_chars: usize) -> Self {
        Self {
            budget: budget_chars,
            used: 0,
            items: Vec::new(),
            dropped: 0,
        }
    }

    /// Characters still free.
    pub fn available(&self) -> usize {
        self.budget.saturating_sub(self.used)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Chunks that did not fit.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Add `item` if it fits. Returns whether it was added.
    pub fn add(&mut self, item: ContextItem) -> bool {
        let separator = if self.items.is_empty() { 0 } else { SEPARATOR.len() };
        let cost = item.render().chars().count() + separator;
        if cost <= self.available() {
            self.used += cost;
            self.items.push(item);
            true
        } else {
            self.dropped += 1;
            false
        }
    }

    /// Pack `hits` in the order given. Returns how many were packed.
    pub fn pack(&mut self, hits: &[ScoredChunk<'_>]) -> usize {
        let mut packed = 0;
        for hit in hits {
            if self.add(ContextItem::from_scored(hit)) {
                packed += 1;
            }
        }
        packed
    }

    pub fn items(&self) -> &[ContextItem] {
        &self.items
    }

    /// The packed chunks as one text block, in packing order.
    pub fn assemble(&self) -> String {
        self.items
            .iter()
            .map(ContextItem::render)
            .collect::<Vec<_>>()
            .join(SEPARATOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn item(source: &str, text: &str) -> ContextItem {
        ContextItem {
            source: source.to_string(),
            start: 0,
            end: text.chars().count(),
            text: text.to_string(),
            score: 1.0,
        }
    }

    #[test]
    fn test_empty_window() {
        let window = ContextWindow::new(100);
        assert_eq!(window.available(), 100);
        assert_eq!(window.assemble(), "");
    }

    #[test]
    fn test_assemble_keeps_order() {
        let mut window = ContextWindow::new(1000);
        assert!(window.add(item("b.md", "second rank first")));
        assert!(window.add(item("a.md", "then this")));
        assert_eq!(
            window.assemble(),
            "[b.md]\nsecond rank first\n\n---\n\n[a.md]\nthen this"
        );
        assert_eq!(window.used(), window.assemble().chars().count());
    }

    #[test]
    fn test_oversized_item_is_dropped_but_smaller_fit() {
        let mut window = ContextWindow::new(40);
        assert!(window.add(item("a", "short")));
        assert!(!window.add(item("b", &"x".repeat(100))));
        assert!(window.add(item("c", "tiny")));
        assert_eq!(window.dropped(), 1);
        assert_eq!(window.items().len(), 2);
        assert!(window.used() <= 40);
    }
}
