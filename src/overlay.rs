//! Results shown on top of the canvas. Items are only appended, so the index is the id.

use egui::{Pos2, Vec2};

pub const OVERLAY_ID_PREFIX: &str = "latex-";

#[derive(Clone, Debug, PartialEq)]
pub struct OverlayItem {
    pub text: String,  // 带定界符的排版标记
    pub position: Pos2, // 相对画布左上角
}

impl OverlayItem {
    pub const fn default_position() -> Pos2 {
        Pos2::new(10.0, 200.0)
    }

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            position: Self::default_position(),
        }
    }

    pub fn with_position(text: impl Into<String>, position: Pos2) -> Self {
        Self {
            text: text.into(),
            position,
        }
    }
}

pub fn overlay_id(index: usize) -> String {
    format!("{OVERLAY_ID_PREFIX}{index}")
}

/// Inverse of [`overlay_id`]. Anything that is not `latex-<integer>` yields `None`.
pub fn parse_overlay_index(id: &str) -> Option<usize> {
    id.strip_prefix(OVERLAY_ID_PREFIX)?.trim().parse().ok()
}

#[derive(Clone, Debug, Default)]
pub struct OverlayList {
    items: Vec<OverlayItem>,
    revision: u64,
}

impl OverlayList {
    pub fn items(&self) -> &[OverlayItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Changes whenever the list changes. Positions moving does not count.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn positions(&self) -> Vec<Pos2> {
        self.items.iter().map(|item| item.position).collect()
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> + '_ {
        self.items.iter().map(|item| item.text.as_str())
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = OverlayItem>) {
        let before = self.items.len();
        self.items.extend(items);
        if self.items.len() != before {
            self.revision += 1;
        }
    }

    pub fn push(&mut self, item: OverlayItem) {
        self.extend([item]);
    }

    pub fn clear(&mut self) {
        if !self.items.is_empty() {
            self.items.clear();
            self.revision += 1;
        }
    }

    /// Commit a finished drag: move the item named by `id` by `delta`.
    ///
    /// Returns `false` without touching anything if `id` does not name an item.
    pub fn end_drag(&mut self, id: &str, delta: Vec2) -> bool {
        let Some(index) = parse_overlay_index(id) else {
            log::debug!("ignoring drag end for unknown overlay id {id:?}");
            return false;
        };
        match self.items.get_mut(index) {
            Some(item) => {
                item.position += delta;
                true
            }
            None => false,
        }
    }
}
