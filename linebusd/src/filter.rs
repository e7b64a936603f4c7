//! filter.rs — shared prefix filters for subscriptions
//!
//! Identical prefixes from different clients share one refcounted
//! record, so a broadcast matches each distinct prefix against the line
//! once, no matter how many clients subscribed to it. The `matched`
//! slot is scratch state valid for the duration of one broadcast.

#[derive(Debug)]
struct Filter {
    prefix: String,
    refcount: usize,
    matched: bool,
}

/// Interning table of subscription prefixes. Handles are indices and
/// stay stable; emptied slots are reused.
#[derive(Debug, Default)]
pub struct FilterTable {
    slots: Vec<Option<Filter>>,
}

impl FilterTable {
    pub fn new() -> Self {
        FilterTable::default()
    }

    /// Add a reference to `prefix`, interning it on first use.
    pub fn subscribe(&mut self, prefix: &str) -> usize {
        if let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|f| f.prefix == prefix))
        {
            self.slots[idx].as_mut().unwrap().refcount += 1;
            return idx;
        }
        let filter = Filter { prefix: prefix.to_string(), refcount: 1, matched: false };
        if let Some(idx) = self.slots.iter().position(Option::is_none) {
            self.slots[idx] = Some(filter);
            idx
        } else {
            self.slots.push(Some(filter));
            self.slots.len() - 1
        }
    }

    /// Drop one reference; the record is freed when the last holder goes.
    pub fn release(&mut self, idx: usize) {
        if let Some(f) = self.slots.get_mut(idx).and_then(Option::as_mut) {
            f.refcount -= 1;
            if f.refcount == 0 {
                self.slots[idx] = None;
            }
        }
    }

    /// Evaluate every live prefix against `line` once.
    pub fn mark(&mut self, line: &str) {
        for f in self.slots.iter_mut().flatten() {
            f.matched = line.starts_with(&f.prefix);
        }
    }

    /// Did any of the given handles match the most recent `mark`?
    pub fn hit(&self, handles: &[usize]) -> bool {
        handles
            .iter()
            .any(|&i| self.slots[i].as_ref().is_some_and(|f| f.matched))
    }

    pub fn prefix(&self, idx: usize) -> Option<&str> {
        self.slots
            .get(idx)
            .and_then(Option::as_ref)
            .map(|f| f.prefix.as_str())
    }
}
