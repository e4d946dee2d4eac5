use crate::id::Id;

/// A run of consecutive characters sharing one identifier base.
///
/// The run owns its slice of the document text. The offset word embedded in
/// `base` is the offset of the run's first character; the characters that
/// follow take consecutive offsets. `eob` mirrors the end-of-block flag on
/// the run's last character: it is true only while the run is the rightmost
/// live piece of its block, and a split or a tail deletion clears it.
#[derive(Debug, Clone)]
struct Run {
    base: Id,
    eob: bool,
    text: String,
    chars: usize,
}

impl Run {
    fn new(base: Id, eob: bool, text: &str) -> Run {
        Run {
            base,
            eob,
            chars: text.chars().count(),
            text: text.to_owned(),
        }
    }

    /// Effective identifier of the character `k` places into the run.
    fn id_at(&self, k: usize) -> Id {
        self.base.with_offset(self.base.offset() + k as u16)
    }

    fn first_id(&self) -> Id {
        self.base.clone()
    }

    fn last_id(&self) -> Id {
        self.id_at(self.chars - 1)
    }

    /// Byte index of the `k`-th character.
    fn byte_at(&self, k: usize) -> usize {
        self.text
            .char_indices()
            .nth(k)
            .map(|(b, _)| b)
            .unwrap_or(self.text.len())
    }

    /// For an identifier sorting strictly inside this run's interval but
    /// with a foreign base: the count of characters whose effective ids
    /// precede it.
    fn interior_offset(&self, id: &Id) -> usize {
        let (mut lo, mut hi) = (0, self.chars);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.id_at(mid) < *id {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

/// The document replica's body: a piece table whose pieces are identifier
/// runs. Positions are character positions.
#[derive(Debug, Clone, Default)]
pub struct BlockStore {
    runs: Vec<Run>,
    chars: usize,
}

impl BlockStore {
    pub fn new() -> BlockStore {
        BlockStore::default()
    }

    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn content(&self) -> String {
        let mut out = String::new();
        for run in &self.runs {
            out.push_str(&run.text);
        }
        out
    }

    /// Index and starting position of the run containing `pos`; one past
    /// the last run when `pos == len`.
    fn locate(&self, pos: usize) -> (usize, usize) {
        let mut start = 0;
        for (i, run) in self.runs.iter().enumerate() {
            if pos < start + run.chars {
                return (i, start);
            }
            start += run.chars;
        }
        (self.runs.len(), self.chars)
    }

    /// Effective identifier of the character at `pos`, or the empty
    /// identifier for any position at or past the end.
    pub fn id_at(&self, pos: usize) -> Id {
        if pos >= self.chars {
            return Id::empty();
        }
        let (idx, start) = self.locate(pos);
        self.runs[idx].id_at(pos - start)
    }

    /// True when the character at `pos` is the last of its run and still
    /// carries the end-of-block flag.
    pub fn eob_at(&self, pos: usize) -> bool {
        if pos >= self.chars {
            return false;
        }
        let (idx, start) = self.locate(pos);
        let run = &self.runs[idx];
        run.eob && pos - start == run.chars - 1
    }

    /// Characters from `pos` to the end of the run containing it.
    pub fn run_remainder(&self, pos: usize) -> usize {
        let (idx, start) = self.locate(pos);
        if idx == self.runs.len() {
            return 0;
        }
        start + self.runs[idx].chars - pos
    }

    /// Locates `id` starting from the runs bracketing `hint` and widening
    /// outward. When the character is present, returns its position
    /// (`before` true) or the position just past it (`before` false). When
    /// absent, returns the position where a character with this identifier
    /// would be inserted to keep the identifier sequence sorted.
    pub fn find_id(&self, id: &Id, hint: usize, before: bool) -> usize {
        if id.is_empty() {
            return self.chars;
        }
        if self.runs.is_empty() {
            return 0;
        }
        let (mut idx, mut start) = self.locate(hint.min(self.chars));
        if idx == self.runs.len() {
            idx -= 1;
            start -= self.runs[idx].chars;
        }
        loop {
            let run = &self.runs[idx];
            if run.base.base_eq(id) {
                let off0 = run.base.offset();
                let off = id.offset();
                if off >= off0 && ((off - off0) as usize) < run.chars {
                    let pos = start + (off - off0) as usize;
                    return if before { pos } else { pos + 1 };
                }
                // base-equal but outside this run's window: fall through to
                // the ordered widening below
            }
            if *id < run.first_id() {
                if idx == 0 {
                    return 0;
                }
                let prev = &self.runs[idx - 1];
                let prev_start = start - prev.chars;
                if *id > prev.last_id() {
                    return start;
                }
                idx -= 1;
                start = prev_start;
            } else if *id > run.last_id() {
                if idx + 1 == self.runs.len() {
                    return self.chars;
                }
                start += run.chars;
                idx += 1;
            } else {
                // strictly inside the run's interval with a foreign base:
                // the would-be split point
                return start + run.interior_offset(id);
            }
        }
    }

    /// Splits the run containing `pos` so that `pos` becomes a run
    /// boundary. The right piece is re-based to its first character's
    /// effective identifier and inherits the end-of-block flag; the left
    /// piece's flag is cleared. No-op at existing boundaries.
    pub fn split_at(&mut self, pos: usize) {
        if pos == 0 || pos >= self.chars {
            return;
        }
        let (idx, start) = self.locate(pos);
        if pos == start {
            return;
        }
        let k = pos - start;
        let run = &mut self.runs[idx];
        let byte = run.byte_at(k);
        let right_text = run.text.split_off(byte);
        let right = Run {
            base: run.id_at(k),
            eob: run.eob,
            chars: run.chars - k,
            text: right_text,
        };
        run.eob = false;
        run.chars = k;
        self.runs.insert(idx + 1, right);
    }

    /// Inserts `text` at `pos` as a fresh run annotated `(base, eob)`,
    /// splitting any run that straddles `pos`.
    pub fn insert_run(&mut self, pos: usize, text: &str, base: Id, eob: bool) {
        self.split_at(pos);
        let (idx, _) = self.locate(pos);
        let run = Run::new(base, eob, text);
        self.chars += run.chars;
        self.runs.insert(idx, run);
    }

    /// Appends `text` to the run whose last character sits at `pos - 1`,
    /// extending its block with consecutive offsets.
    pub fn append_to_run_ending_at(&mut self, pos: usize, text: &str) {
        let (idx, start) = self.locate(pos - 1);
        let run = &mut self.runs[idx];
        debug_assert_eq!(start + run.chars, pos, "append point must be a run end");
        run.text.push_str(text);
        let added = text.chars().count();
        run.chars += added;
        self.chars += added;
    }

    /// Removes `[beg, end)` and returns the `(length, identifier)` pairs
    /// that covered it, one per removed run, each identifier carrying the
    /// offset of the first removed character.
    pub fn remove_spans(&mut self, beg: usize, end: usize) -> Vec<(usize, Id)> {
        if beg >= end {
            return Vec::new();
        }
        self.split_at(beg);
        self.split_at(end);
        let (first, _) = self.locate(beg);
        let mut last = first;
        let mut covered = 0;
        let mut spans = Vec::new();
        while covered < end - beg {
            let run = &self.runs[last];
            spans.push((run.chars, run.first_id()));
            covered += run.chars;
            last += 1;
        }
        self.runs.drain(first..last);
        self.chars -= end - beg;
        spans
    }

    /// The run list in sync-snapshot form: `(length, base, eob)` triples.
    pub fn dump_runs(&self) -> Vec<(usize, Id, bool)> {
        self.runs
            .iter()
            .map(|run| (run.chars, run.base.clone(), run.eob))
            .collect()
    }

    /// Rebuilds a store from snapshot content and its run list. Returns
    /// `None` when the run lengths do not cover the content exactly.
    pub fn load(content: &str, runs: &[(usize, Id, bool)]) -> Option<BlockStore> {
        let mut store = BlockStore::new();
        let mut rest = content;
        for (len, base, eob) in runs {
            if *len == 0 || base.is_empty() {
                return None;
            }
            let byte = rest
                .char_indices()
                .nth(*len)
                .map(|(b, _)| b)
                .unwrap_or(rest.len());
            let (piece, tail) = rest.split_at(byte);
            if piece.chars().count() != *len {
                return None;
            }
            rest = tail;
            store.chars += *len;
            store.runs.push(Run::new(base.clone(), *eob, piece));
        }
        if !rest.is_empty() {
            return None;
        }
        Some(store)
    }

    /// Every character's effective identifier, in document order.
    #[cfg(test)]
    pub fn effective_ids(&self) -> Vec<Id> {
        let mut out = Vec::with_capacity(self.chars);
        for run in &self.runs {
            for k in 0..run.chars {
                out.push(run.id_at(k));
            }
        }
        out
    }

    /// Panics unless the resting invariants hold: strictly increasing
    /// effective identifiers, and offsets that fit every run.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        let ids = self.effective_ids();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "ids out of order: {:?} {:?}", pair[0], pair[1]);
        }
        for run in &self.runs {
            assert!(run.chars > 0, "empty run");
            assert!(
                (run.base.offset() as usize) + run.chars - 1 <= u16::MAX as usize,
                "run overflows its offset space"
            );
            assert_eq!(run.text.chars().count(), run.chars);
        }
        assert_eq!(self.chars, self.runs.iter().map(|r| r.chars).sum::<usize>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(words: &[u16]) -> Id {
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_be_bytes());
        }
        Id::from_bytes(bytes).unwrap()
    }

    fn hello_store() -> BlockStore {
        let mut store = BlockStore::new();
        store.insert_run(0, "HELLO", id(&[100, 1, 0]), true);
        store
    }

    #[test]
    fn id_at_walks_offsets() {
        let store = hello_store();
        assert_eq!(store.id_at(0), id(&[100, 1, 0]));
        assert_eq!(store.id_at(4), id(&[100, 1, 4]));
        assert!(store.id_at(5).is_empty());
        store.assert_invariants();
    }

    #[test]
    fn find_resolves_every_position() {
        let mut store = hello_store();
        store.insert_run(2, "xy", id(&[100, 1, 1, 7, 2, 0]), true);
        store.assert_invariants();
        for pos in 0..store.len() {
            let target = store.id_at(pos);
            // any hint must work
            for hint in [0, pos, store.len()] {
                assert_eq!(store.find_id(&target, hint, true), pos);
                assert_eq!(store.find_id(&target, hint, false), pos + 1);
            }
        }
        assert_eq!(store.find_id(&Id::empty(), 0, true), store.len());
    }

    #[test]
    fn find_missing_returns_insertion_point() {
        let store = hello_store();
        // sorts after the whole block
        assert_eq!(store.find_id(&id(&[200, 2, 0]), 0, false), 5);
        // sorts before it
        assert_eq!(store.find_id(&id(&[50, 2, 0]), 5, false), 0);
        // interior: between offsets 2 and 3
        assert_eq!(store.find_id(&id(&[100, 1, 2, 9, 2, 0]), 0, false), 3);
    }

    #[test]
    fn split_rebases_and_clears_eob() {
        let mut store = hello_store();
        store.split_at(3);
        let runs = store.dump_runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], (3, id(&[100, 1, 0]), false));
        assert_eq!(runs[1], (2, id(&[100, 1, 3]), true));
        assert_eq!(store.content(), "HELLO");
        store.assert_invariants();
        // boundary splits are no-ops
        store.split_at(3);
        assert_eq!(store.dump_runs().len(), 2);
    }

    #[test]
    fn append_extends_block() {
        let mut store = hello_store();
        store.append_to_run_ending_at(5, "!!");
        assert_eq!(store.content(), "HELLO!!");
        assert_eq!(store.id_at(6), id(&[100, 1, 6]));
        assert_eq!(store.dump_runs().len(), 1);
        store.assert_invariants();
    }

    #[test]
    fn remove_spans_reports_coverage() {
        let mut store = hello_store();
        let spans = store.remove_spans(1, 4);
        assert_eq!(store.content(), "HO");
        assert_eq!(spans, vec![(3, id(&[100, 1, 1]))]);
        // left piece lost its flag with the split, right piece kept it
        let runs = store.dump_runs();
        assert_eq!(runs[0], (1, id(&[100, 1, 0]), false));
        assert_eq!(runs[1], (1, id(&[100, 1, 4]), true));
        store.assert_invariants();
    }

    #[test]
    fn remove_across_runs_yields_one_span_per_run() {
        let mut store = hello_store();
        store.split_at(2);
        let spans = store.remove_spans(1, 4);
        assert_eq!(
            spans,
            vec![(1, id(&[100, 1, 1])), (2, id(&[100, 1, 2]))]
        );
        assert_eq!(store.content(), "HO");
        store.assert_invariants();
    }

    #[test]
    fn dump_load_roundtrip() {
        let mut store = hello_store();
        store.insert_run(5, " world", id(&[150, 2, 0]), true);
        store.split_at(2);
        let dumped = store.dump_runs();
        let loaded = BlockStore::load(&store.content(), &dumped).unwrap();
        assert_eq!(loaded.content(), store.content());
        assert_eq!(loaded.dump_runs(), dumped);
        loaded.assert_invariants();
    }

    #[test]
    fn load_rejects_short_or_long_content() {
        let runs = vec![(5usize, id(&[100, 1, 0]), true)];
        assert!(BlockStore::load("HELL", &runs).is_none());
        assert!(BlockStore::load("HELLO!", &runs).is_none());
        assert!(BlockStore::load("HELLO", &runs).is_some());
    }
}
