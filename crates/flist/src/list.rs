//! Segmented file lists.
//!
//! Incremental recursion transmits the tree one directory at a time; each
//! batch becomes a [`Segment`] owning a contiguous slice of the session's
//! global index space. Entries are stored once behind `Arc` and addressed
//! by index; segments never hold back-pointers. [`SharedFilelist`] is the
//! lock-guarded variant the generator and receiver threads share.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::entry::FileInfo;

/// One contiguous batch of file-list entries.
#[derive(Debug)]
pub struct Segment {
    dir_index: Option<usize>,
    start: usize,
    files: Vec<Arc<FileInfo>>,
}

impl Segment {
    /// Index of the directory this segment expands, `None` for the root
    /// segment.
    #[must_use]
    pub const fn dir_index(&self) -> Option<usize> {
        self.dir_index
    }

    /// First index owned by the segment.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// One past the last index owned by the segment.
    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.files.len()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when the segment holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Looks an entry up by its global index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<FileInfo>> {
        index
            .checked_sub(self.start)
            .and_then(|offset| self.files.get(offset))
    }

    /// Entries in index order.
    pub fn files(&self) -> impl ExactSizeIterator<Item = &Arc<FileInfo>> {
        self.files.iter()
    }

    /// (index, entry) pairs in index order.
    pub fn indexed(&self) -> impl Iterator<Item = (usize, &Arc<FileInfo>)> {
        self.files
            .iter()
            .enumerate()
            .map(|(offset, file)| (self.start + offset, file))
    }
}

/// Ordered collection of segments with monotone index assignment.
#[derive(Debug, Default)]
pub struct Filelist {
    segments: VecDeque<Segment>,
    next_index: usize,
}

impl Filelist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment, sorting `files` into the wire order and assigning
    /// them the next run of indices. Returns the segment's index range.
    pub fn add_segment(
        &mut self,
        dir_index: Option<usize>,
        mut files: Vec<Arc<FileInfo>>,
    ) -> (usize, usize) {
        files.sort_unstable_by(|a, b| a.cmp(b));

        let start = self.next_index;
        self.next_index += files.len();
        self.segments.push_back(Segment {
            dir_index,
            start,
            files,
        });
        (start, self.next_index)
    }

    /// Looks an entry up by global index across all live segments.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<FileInfo>> {
        self.segments
            .iter()
            .find(|segment| index >= segment.start() && index < segment.end())
            .and_then(|segment| segment.get(index))
    }

    /// The oldest live segment.
    #[must_use]
    pub fn first_segment(&self) -> Option<&Segment> {
        self.segments.front()
    }

    /// Drops the oldest segment once every file in it has been handled.
    pub fn pop_first_segment(&mut self) -> Option<Segment> {
        self.segments.pop_front()
    }

    /// Number of live segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Next index that [`add_segment`](Self::add_segment) will assign.
    #[must_use]
    pub const fn next_index(&self) -> usize {
        self.next_index
    }

    /// Live segments in arrival order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }
}

/// Thread-safe file list shared between the generator and receiver.
#[derive(Debug, Default, Clone)]
pub struct SharedFilelist {
    inner: Arc<Mutex<Filelist>>,
}

impl SharedFilelist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment; see [`Filelist::add_segment`].
    pub fn add_segment(
        &self,
        dir_index: Option<usize>,
        files: Vec<Arc<FileInfo>>,
    ) -> (usize, usize) {
        self.lock().add_segment(dir_index, files)
    }

    /// Clones the entry at `index` out of the list.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Arc<FileInfo>> {
        self.lock().get(index).cloned()
    }

    /// Drops the oldest segment.
    pub fn pop_first_segment(&self) -> Option<Segment> {
        self.lock().pop_first_segment()
    }

    /// Runs `f` under the list lock for compound operations.
    pub fn with_list<T>(&self, f: impl FnOnce(&mut Filelist) -> T) -> T {
        f(&mut self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Filelist> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::{FileAttrs, S_IFDIR, S_IFREG};
    use crate::principal::{Group, User};

    fn file(name: &str, dir: bool) -> Arc<FileInfo> {
        let mode = if dir { S_IFDIR | 0o755 } else { S_IFREG | 0o644 };
        let attrs = FileAttrs::new(mode, 0, 0, User::root(), Group::root());
        Arc::new(FileInfo::new(None, name.as_bytes().to_vec(), attrs, None).expect("valid entry"))
    }

    #[test]
    fn indices_are_monotone_across_segments() {
        let mut list = Filelist::new();
        let (start_a, end_a) = list.add_segment(None, vec![file(".", true), file("a", false)]);
        let (start_b, end_b) = list.add_segment(Some(0), vec![file("sub/x", false)]);

        assert_eq!((start_a, end_a), (0, 2));
        assert_eq!((start_b, end_b), (2, 3));
        assert_eq!(list.next_index(), 3);
    }

    #[test]
    fn segments_sort_their_entries() {
        let mut list = Filelist::new();
        list.add_segment(None, vec![file("b", false), file(".", true), file("a", true)]);

        let segment = list.first_segment().expect("segment present");
        let names: Vec<&[u8]> = segment.files().map(|f| f.name()).collect();
        assert_eq!(names, [b".".as_slice(), b"a/".as_slice(), b"b".as_slice()]);
    }

    #[test]
    fn lookup_spans_segments() {
        let mut list = Filelist::new();
        list.add_segment(None, vec![file(".", true), file("d", true)]);
        list.add_segment(Some(1), vec![file("d/inner", false)]);

        assert_eq!(list.get(2).expect("entry").name(), b"d/inner");
        assert!(list.get(3).is_none());
    }

    #[test]
    fn popping_a_segment_retires_its_indices() {
        let mut list = Filelist::new();
        list.add_segment(None, vec![file(".", true)]);
        list.add_segment(Some(0), vec![file("x", false)]);

        let popped = list.pop_first_segment().expect("segment present");
        assert_eq!(popped.start(), 0);
        assert!(list.get(0).is_none());
        assert!(list.get(1).is_some());
        assert_eq!(list.next_index(), 2);
    }

    #[test]
    fn shared_list_hands_out_clones() {
        let shared = SharedFilelist::new();
        shared.add_segment(None, vec![file(".", true), file("f", false)]);

        let from_a = shared.get(1).expect("entry");
        from_a.set_transferred();
        let from_b = shared.get(1).expect("entry");
        assert!(from_b.is_transferred());
    }
}
