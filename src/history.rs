//! In-memory navigation stack layered over the browser's session history.
//!
//! The browser only tells us "a popstate happened, here is the URL". To play
//! the right animation we need to know whether that was a step back or a step
//! forward, so we keep our own bounded record of visited locations and a
//! cursor into it.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::Serialize;
use url::Url;

use crate::route::PageKind;
use crate::utils::url_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Back,
    Forward,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationRecord {
    pub url: Url,
    pub kind: PageKind,
    pub scroll_offset: f64,
    pub timestamp: SystemTime,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NavigationRecord {
    pub fn new(url: Url, kind: PageKind) -> Self {
        Self {
            url,
            kind,
            scroll_offset: 0.0,
            timestamp: SystemTime::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_scroll(mut self, offset: f64) -> Self {
        self.scroll_offset = offset;
        self
    }

    fn is(&self, url: &Url) -> bool {
        url_key(&self.url) == url_key(url)
    }
}

/// Bounded stack of visited locations with a cursor.
///
/// Stepping back and forward only moves the cursor, the records past it stay
/// around until the next [`push`](Self::push) overwrites them.
#[derive(Debug)]
pub struct NavigationHistory {
    capacity: usize,
    records: Vec<NavigationRecord>,
    cursor: Option<usize>,
}

impl NavigationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Vec::with_capacity(capacity.max(1)),
            cursor: None,
        }
    }

    /// Records a new location after the cursor. Any forward tail is dropped,
    /// and when the stack is full the oldest record goes.
    pub fn push(&mut self, record: NavigationRecord) {
        let write = self.cursor.map_or(0, |cursor| cursor + 1);
        self.records.truncate(write);
        self.records.push(record);

        if self.records.len() > self.capacity {
            self.records.remove(0);
        }

        self.cursor = Some(self.records.len() - 1);
        tracing::trace!(
            "history push, {} records, cursor at {:?}",
            self.records.len(),
            self.cursor
        );
    }

    /// Steps the cursor back, returning the record it lands on.
    pub fn pop(&mut self) -> Option<&NavigationRecord> {
        match self.cursor {
            Some(cursor) if cursor > 0 => {
                self.cursor = Some(cursor - 1);
                self.records.get(cursor - 1)
            }
            _ => None,
        }
    }

    /// Steps the cursor forward over a record kept from before a
    /// [`pop`](Self::pop), returning the record it lands on.
    pub fn forward(&mut self) -> Option<&NavigationRecord> {
        let next = self.cursor?.checked_add(1)?;
        if next < self.records.len() {
            self.cursor = Some(next);
            self.records.get(next)
        } else {
            None
        }
    }

    /// Which way a popstate to `target` goes. Only the immediate neighbours of
    /// the cursor are considered, anything else is treated as forward.
    pub fn direction(&self, target: &Url) -> Direction {
        let Some(cursor) = self.cursor else {
            return Direction::Forward;
        };

        if cursor > 0 && self.records[cursor - 1].is(target) {
            return Direction::Back;
        }

        if self
            .records
            .get(cursor + 1)
            .is_some_and(|record| record.is(target))
        {
            return Direction::Forward;
        }

        Direction::Forward
    }

    /// Moves the cursor onto `target`, returning the record landed on.
    ///
    /// The neighbour in `direction` is tried first. A jump over several
    /// entries lands on the closest other record for `target`.
    pub fn step(&mut self, direction: Direction, target: &Url) -> Option<&NavigationRecord> {
        let cursor = self.cursor?;
        let neighbour = match direction {
            Direction::Back => cursor.checked_sub(1),
            Direction::Forward => Some(cursor + 1),
        };

        let index = neighbour
            .filter(|&index| self.records.get(index).is_some_and(|record| record.is(target)))
            .or_else(|| self.find(cursor, target))?;

        self.cursor = Some(index);
        self.records.get(index)
    }

    fn find(&self, cursor: usize, target: &Url) -> Option<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(index, record)| *index != cursor && record.is(target))
            .min_by_key(|(index, _)| index.abs_diff(cursor))
            .map(|(index, _)| index)
    }

    pub fn current(&self) -> Option<&NavigationRecord> {
        self.records.get(self.cursor?)
    }

    /// Stores the scroll offset of the page being left on its record.
    pub fn update_scroll(&mut self, offset: f64) {
        if let Some(record) = self.cursor.and_then(|cursor| self.records.get_mut(cursor)) {
            record.scroll_offset = offset;
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn records(&self) -> &[NavigationRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("https://b.example/").unwrap().join(path).unwrap()
    }

    fn record(path: &str) -> NavigationRecord {
        NavigationRecord::new(url(path), PageKind::List)
    }

    #[test]
    fn test_push_and_direction() {
        let mut history = NavigationHistory::new(10);
        history.push(record("/a"));
        history.push(record("/b"));
        history.push(record("/c"));

        assert_eq!(history.direction(&url("/b")), Direction::Back);
        assert_eq!(history.direction(&url("/a")), Direction::Forward);
        assert_eq!(history.direction(&url("/zzz")), Direction::Forward);
    }

    #[test]
    fn test_pop_and_forward() {
        let mut history = NavigationHistory::new(10);
        history.push(record("/a"));
        history.push(record("/b"));

        assert_eq!(history.pop().unwrap().url, url("/a"));
        assert!(history.pop().is_none());
        assert_eq!(history.direction(&url("/b")), Direction::Forward);

        assert_eq!(history.forward().unwrap().url, url("/b"));
        assert!(history.forward().is_none());
    }

    #[test]
    fn test_push_truncates_forward_tail() {
        let mut history = NavigationHistory::new(10);
        history.push(record("/a"));
        history.push(record("/b"));
        history.push(record("/c"));
        history.pop();
        history.pop();

        history.push(record("/d"));

        let urls: Vec<_> = history.records().iter().map(|r| r.url.path()).collect();
        assert_eq!(urls, vec!["/a", "/d"]);
        assert_eq!(history.cursor(), Some(1));
        assert!(history.forward().is_none());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut history = NavigationHistory::new(3);
        for path in ["/a", "/b", "/c", "/d", "/e"] {
            history.push(record(path));
        }

        let urls: Vec<_> = history.records().iter().map(|r| r.url.path()).collect();
        assert_eq!(urls, vec!["/c", "/d", "/e"]);
        assert_eq!(history.cursor(), Some(2));
        assert_eq!(history.direction(&url("/d")), Direction::Back);
    }

    #[test]
    fn test_direction_ignores_fragment() {
        let mut history = NavigationHistory::new(3);
        history.push(record("/a/"));
        history.push(record("/b"));
        assert_eq!(history.direction(&url("/a#top")), Direction::Back);
    }

    #[test]
    fn test_step_to_unknown_target() {
        let mut history = NavigationHistory::new(5);
        history.push(record("/a"));
        history.push(record("/b"));

        assert!(history.step(Direction::Back, &url("/x")).is_none());
        assert_eq!(history.cursor(), Some(1));

        assert_eq!(history.step(Direction::Back, &url("/a")).unwrap().url, url("/a"));
        assert_eq!(history.cursor(), Some(0));
    }

    #[test]
    fn test_step_over_several_entries() {
        let mut history = NavigationHistory::new(5);
        history.push(record("/a"));
        history.push(record("/b"));
        history.push(record("/c"));

        // not a neighbour, so the heuristic says forward
        assert_eq!(history.direction(&url("/a")), Direction::Forward);
        assert_eq!(history.step(Direction::Forward, &url("/a")).unwrap().url, url("/a"));
        assert_eq!(history.cursor(), Some(0));

        history.update_scroll(120.0);
        assert_eq!(history.records()[0].scroll_offset, 120.0);
        assert_eq!(history.records()[2].scroll_offset, 0.0);

        history.push(record("/d"));
        let urls: Vec<_> = history.records().iter().map(|r| r.url.path()).collect();
        assert_eq!(urls, vec!["/a", "/d"]);
    }

    #[test]
    fn test_update_scroll() {
        let mut history = NavigationHistory::new(5);
        history.update_scroll(10.0);
        history.push(record("/a"));
        history.update_scroll(420.0);
        assert_eq!(history.current().unwrap().scroll_offset, 420.0);
    }
}
