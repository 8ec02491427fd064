/// Scroll bookkeeping for timelines that grow at the top
use serde::{Deserialize, Serialize};

/// Snapshot of the scroll container taken before older messages are prepended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollAnchor {
    scroll_height: f64,
    scroll_top: f64,
}

impl ScrollAnchor {
    pub fn capture(scroll_height: f64, scroll_top: f64) -> Self {
        Self {
            scroll_height,
            scroll_top,
        }
    }

    /// Scroll offset that keeps the previously visible content in place once the
    /// container has grown to `new_scroll_height`.
    pub fn restore(&self, new_scroll_height: f64) -> f64 {
        let delta = (new_scroll_height - self.scroll_height).max(0.0);
        self.scroll_top + delta
    }
}

/// Older history is requested once the first item is visible, unless a request
/// is already in flight or the store has nothing older.
pub fn should_load_older(first_visible_index: usize, has_more: bool, loading: bool) -> bool {
    first_visible_index == 0 && has_more && !loading
}
