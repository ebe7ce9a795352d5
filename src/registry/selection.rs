//! User-driven path selection
//!
//! A widget asks for a picker with [`SelectionState::request`], the picker
//! reports the chosen path with [`SelectionState::select`], and the widget
//! consumes it exactly once with [`SelectionState::take`].

#[derive(Debug, Default, Clone)]
pub struct SelectionState {
    /// Path the open picker started from, if a picker is open
    requested: Option<String>,
    /// Chosen path not yet consumed
    pending: Option<String>,
    /// Most recent selection, kept for the next picker
    last_selected: Option<String>,
}

impl SelectionState {
    pub fn request(&mut self, current: &str) {
        self.requested = Some(current.to_string());
        self.pending = None;
    }

    pub fn select(&mut self, path: &str) {
        self.requested = None;
        self.pending = Some(path.to_string());
        self.last_selected = Some(path.to_string());
    }

    pub fn cancel(&mut self) {
        self.requested = None;
    }

    pub fn take(&mut self) -> Option<String> {
        self.pending.take()
    }

    pub fn requested(&self) -> Option<&str> {
        self.requested.as_deref()
    }

    pub fn last_selected(&self) -> Option<&str> {
        self.last_selected.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_consumed_once() {
        let mut sel = SelectionState::default();
        sel.request("/files/tmp/a.csv");
        assert_eq!(sel.requested(), Some("/files/tmp/a.csv"));
        assert_eq!(sel.take(), None);

        sel.select("/topics/odom");
        assert!(sel.requested().is_none());
        assert_eq!(sel.take().as_deref(), Some("/topics/odom"));
        assert_eq!(sel.take(), None);
        assert_eq!(sel.last_selected(), Some("/topics/odom"));
    }

    #[test]
    fn test_new_request_drops_unconsumed_selection() {
        let mut sel = SelectionState::default();
        sel.select("/a/b");
        sel.request("");
        assert_eq!(sel.take(), None);
        sel.cancel();
        assert!(sel.requested().is_none());
    }
}
