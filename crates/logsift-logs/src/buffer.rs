use std::collections::VecDeque;

/// Fixed-capacity ring of recent lines, used for leading context
#[derive(Clone, Debug)]
pub struct LineRing {
    /// Internal storage
    lines: VecDeque<String>,

    /// Maximum capacity
    capacity: usize,
}

impl LineRing {
    /// Create a new ring with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a line, evicting the oldest if at capacity
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Buffered lines, oldest first
    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}
