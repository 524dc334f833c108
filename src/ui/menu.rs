/// Input from whatever drives the menu (buttons, console).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiIntent {
    ConfirmSelection,
    CancelRegistration,
    /// Move the cursor by this many entries; negative is up.
    Navigate(i32),
}

/// A list of choices with a wrapping cursor.
#[derive(Debug, Clone, Default)]
pub struct FileMenu {
    items: Vec<String>,
    cursor: usize,
}

impl FileMenu {
    pub fn new(items: Vec<String>) -> Self {
        Self { items, cursor: 0 }
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn navigate(&mut self, delta: i32) {
        if self.items.is_empty() {
            return;
        }
        let len = self.items.len() as i64;
        self.cursor = (self.cursor as i64 + delta as i64).rem_euclid(len) as usize;
    }

    /// Moves the cursor straight to `index`, ignoring out-of-range values.
    pub fn select(&mut self, index: usize) -> bool {
        if index < self.items.len() {
            self.cursor = index;
            true
        } else {
            false
        }
    }

    pub fn selected(&self) -> Option<&str> {
        self.items.get(self.cursor).map(String::as_str)
    }

    /// At most `rows` entries around the cursor, keeping one entry of context
    /// above it when there is one. Each entry is paired with whether it is
    /// the selected one.
    pub fn window(&self, rows: usize) -> Vec<(bool, &str)> {
        let start = self.cursor.saturating_sub(1);
        self.items
            .iter()
            .enumerate()
            .skip(start)
            .take(rows)
            .map(|(index, item)| (index == self.cursor, item.as_str()))
            .collect()
    }
}
