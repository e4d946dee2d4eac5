use std::collections::BTreeMap;

use rand::Rng;

use crate::block::BlockStore;
use crate::error::{ProtocolSnafu, Result};
use crate::id::{Id, MAX_DIGIT};
use crate::message::Message;
use crate::sexp::Value;

/// A remote participant's cursor: point and optional mark, kept as
/// identifiers plus the sender's position hints and resolved on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorState {
    pub point: Id,
    pub point_hint: usize,
    pub mark: Option<Id>,
    pub mark_hint: usize,
}

/// Identity of a replicated overlay: the creating site and its clock value
/// at creation. Immutable for the overlay's whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OverlayKey {
    pub site: u16,
    pub clock: u32,
}

/// A replicated annotation over a range of characters. The endpoint
/// identifiers reference neighboring characters according to the advance
/// flags: an advancing endpoint rides the character at the boundary, a
/// non-advancing one rides the character just outside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub species: String,
    pub front_advance: bool,
    pub rear_advance: bool,
    pub start: Id,
    pub start_hint: usize,
    pub end: Id,
    pub end_hint: usize,
    pub props: Vec<(String, Value)>,
}

/// One shared buffer's replica: the identifier-annotated text plus the
/// replicated cursor and overlay tables.
///
/// Local edits mutate the store and derive the operations to publish;
/// remote operations are applied through the identifier search. Either way
/// the effective identifier sequence stays strictly sorted, which is what
/// makes concurrent histories converge.
#[derive(Debug)]
pub struct Document {
    name: String,
    site: u16,
    mode: Option<String>,
    store: BlockStore,
    cursors: BTreeMap<u16, CursorState>,
    overlays: BTreeMap<OverlayKey, Overlay>,
    published_cursor: Option<(Id, Option<Id>)>,
}

impl Document {
    pub fn new(name: impl Into<String>, site: u16) -> Document {
        Document {
            name: name.into(),
            site,
            mode: None,
            store: BlockStore::new(),
            cursors: BTreeMap::new(),
            overlays: BTreeMap::new(),
            published_cursor: None,
        }
    }

    /// Rebuilds a replica from a sync snapshot.
    pub fn from_sync(
        name: impl Into<String>,
        site: u16,
        mode: Option<String>,
        content: &str,
        runs: &[(usize, Id, bool)],
    ) -> Result<Document> {
        let store = BlockStore::load(content, runs).ok_or_else(|| {
            ProtocolSnafu {
                detail: "sync runs do not cover the content",
            }
            .build()
        })?;
        Ok(Document {
            name: name.into(),
            site,
            mode,
            store,
            cursors: BTreeMap::new(),
            overlays: BTreeMap::new(),
            published_cursor: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_mode(&mut self, mode: Option<String>) {
        self.mode = mode;
    }

    pub fn content(&self) -> String {
        self.store.content()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// The full-document snapshot sent to a newly admitted peer.
    pub fn sync_message(&self) -> Message {
        Message::Sync {
            buffer: self.name.clone(),
            mode: self.mode.clone(),
            content: self.store.content(),
            runs: self.store.dump_runs(),
        }
    }

    // ------------------------------------------------------------------
    // local edit derivation

    /// Derives the operations for text the host inserted at `[beg, beg+n)`
    /// and mirrors them in the replica. Extends the local block to the left
    /// when it still ends here, then lays down fresh blocks, each capped by
    /// the offset space.
    pub fn local_insert<R: Rng>(&mut self, beg: usize, text: &str, rng: &mut R) -> Vec<Message> {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }
        let end = beg + chars.len();

        // an insertion inside a block must not leave the right part
        // mergeable: detach it first
        if beg > 0 && beg < self.store.len() {
            let left = self.store.id_at(beg - 1);
            let right = self.store.id_at(beg);
            if left.base_eq(&right) {
                self.store.split_at(beg);
            }
        }

        let mut msgs = Vec::new();
        let mut cur = beg;
        let mut low: Option<Id> = None;

        if beg > 0 {
            let left = self.store.id_at(beg - 1);
            if left.site() == self.site && self.store.eob_at(beg - 1) {
                let loff = left.offset();
                let room = (MAX_DIGIT - loff).saturating_sub(1) as usize;
                let take = room.min(end - beg);
                if take > 0 {
                    let chunk: String = chars[..take].iter().collect();
                    self.store.append_to_run_ending_at(beg, &chunk);
                    msgs.push(Message::Insert {
                        buffer: self.name.clone(),
                        id: left.with_offset(loff + 1),
                        hint: beg,
                        content: chunk,
                    });
                    cur = beg + take;
                }
            }
            low = Some(self.store.id_at(cur - 1));
        }

        while cur < end {
            let block_end = end.min(cur + MAX_DIGIT as usize);
            let right = self.store.id_at(cur);
            let high = if right.is_empty() { None } else { Some(right) };
            let new_id = Id::between(low.as_ref(), high.as_ref(), self.site, rng);
            let chunk: String = chars[cur - beg..block_end - beg].iter().collect();
            self.store.insert_run(cur, &chunk, new_id.clone(), true);
            msgs.push(Message::Insert {
                buffer: self.name.clone(),
                id: new_id.clone(),
                hint: cur,
                content: chunk,
            });
            // the densest spot the new block could ever grow to bounds the
            // next one from below
            low = Some(new_id.with_offset(MAX_DIGIT - 1));
            cur = block_end;
        }
        msgs
    }

    /// Derives the operation for text the host deleted at `beg` and
    /// mirrors it: one message carrying the run-length cover of the removed
    /// region.
    pub fn local_delete(&mut self, beg: usize, preimage: &str) -> Message {
        let n = preimage.chars().count();
        let spans = self.store.remove_spans(beg, beg + n);
        Message::Delete {
            buffer: self.name.clone(),
            hint: beg,
            spans,
        }
    }

    // ------------------------------------------------------------------
    // remote application

    /// Applies a peer's insert. Returns the position where the content
    /// landed.
    pub fn apply_insert(&mut self, id: &Id, hint: usize, content: &str) -> usize {
        let beg = self.store.find_id(id, hint, false);
        let merge = beg > 0 && {
            let left = self.store.id_at(beg - 1);
            left.base_eq(id)
                && left.offset().checked_add(1) == Some(id.offset())
                && self.store.eob_at(beg - 1)
        };
        if merge {
            self.store.append_to_run_ending_at(beg, content);
        } else {
            self.store.insert_run(beg, content, id.clone(), true);
        }
        beg
    }

    /// Applies a peer's delete. Each span names the identifier of its first
    /// character; a span may cover several local runs when intervening
    /// inserts split the block on this side. Returns the removed
    /// `(position, length)` stretches in application order.
    pub fn apply_delete(&mut self, hint: usize, spans: &[(usize, Id)]) -> Vec<(usize, usize)> {
        let mut removed = Vec::new();
        for (len, base) in spans {
            let mut remaining = *len;
            let mut target = base.clone();
            while remaining > 0 {
                let pos = self.store.find_id(&target, hint, true);
                if pos >= self.store.len() || self.store.id_at(pos) != target {
                    break;
                }
                let k = remaining.min(self.store.run_remainder(pos));
                self.store.remove_spans(pos, pos + k);
                removed.push((pos, k));
                remaining -= k;
                match target.offset().checked_add(k as u16) {
                    Some(next) => target = target.with_offset(next),
                    None => break,
                }
            }
        }
        removed
    }

    // ------------------------------------------------------------------
    // cursors

    /// Publishes the local cursor when it moved since the last publish.
    pub fn local_cursor(&mut self, point: usize, mark: Option<usize>) -> Option<Message> {
        let point_id = self.store.id_at(point);
        let mark_id = mark.map(|m| self.store.id_at(m));
        if self
            .published_cursor
            .as_ref()
            .is_some_and(|prev| prev.0 == point_id && prev.1 == mark_id)
        {
            return None;
        }
        self.published_cursor = Some((point_id.clone(), mark_id.clone()));
        // the hub replays every known cursor to newcomers, ours included
        self.cursors.insert(
            self.site,
            CursorState {
                point: point_id.clone(),
                point_hint: point,
                mark: mark_id.clone(),
                mark_hint: mark.unwrap_or(0),
            },
        );
        Some(Message::Cursor {
            buffer: self.name.clone(),
            site: self.site,
            point_hint: point,
            point: Some(point_id),
            mark_hint: mark.unwrap_or(0),
            mark: mark_id,
        })
    }

    /// Records or clears a peer's cursor. A missing point clears it.
    pub fn set_remote_cursor(
        &mut self,
        site: u16,
        point: Option<Id>,
        point_hint: usize,
        mark: Option<Id>,
        mark_hint: usize,
    ) {
        match point {
            Some(point) => {
                self.cursors.insert(
                    site,
                    CursorState {
                        point,
                        point_hint,
                        mark,
                        mark_hint,
                    },
                );
            }
            None => {
                self.cursors.remove(&site);
            }
        }
    }

    /// Resolves a peer's cursor to character positions, if known.
    pub fn resolve_cursor(&self, site: u16) -> Option<(usize, Option<usize>)> {
        let cursor = self.cursors.get(&site)?;
        let point = self.resolve_at(&cursor.point, cursor.point_hint);
        let mark = cursor
            .mark
            .as_ref()
            .map(|m| self.resolve_at(m, cursor.mark_hint));
        Some((point, mark))
    }

    /// Cursor messages replayed to a newly admitted peer.
    pub fn cursor_replay(&self) -> Vec<Message> {
        self.cursors
            .iter()
            .map(|(site, c)| Message::Cursor {
                buffer: self.name.clone(),
                site: *site,
                point_hint: c.point_hint,
                point: Some(c.point.clone()),
                mark_hint: c.mark_hint,
                mark: c.mark.clone(),
            })
            .collect()
    }

    /// Position of the character carrying `id`; end of document for the
    /// empty identifier.
    fn resolve_at(&self, id: &Id, hint: usize) -> usize {
        if id.is_empty() {
            self.store.len()
        } else {
            self.store.find_id(id, hint, true)
        }
    }

    /// Position just past the character carrying `id`; document start for
    /// the empty identifier.
    fn resolve_after(&self, id: &Id, hint: usize) -> usize {
        if id.is_empty() {
            0
        } else {
            self.store.find_id(id, hint, false)
        }
    }

    // ------------------------------------------------------------------
    // overlays

    fn anchor_ids(
        &self,
        front_advance: bool,
        rear_advance: bool,
        beg: usize,
        end: usize,
    ) -> (Id, Id) {
        let start = if front_advance {
            self.store.id_at(beg)
        } else if beg == 0 {
            Id::empty()
        } else {
            self.store.id_at(beg - 1)
        };
        let finish = if rear_advance {
            self.store.id_at(end)
        } else if end == 0 {
            Id::empty()
        } else {
            self.store.id_at(end - 1)
        };
        (start, finish)
    }

    /// Creates a locally owned overlay over `[beg, end)` and returns the
    /// message announcing it.
    pub fn create_overlay(
        &mut self,
        key: OverlayKey,
        species: impl Into<String>,
        front_advance: bool,
        rear_advance: bool,
        beg: usize,
        end: usize,
    ) -> Message {
        let species = species.into();
        let (start, finish) = self.anchor_ids(front_advance, rear_advance, beg, end);
        self.overlays.insert(
            key,
            Overlay {
                species: species.clone(),
                front_advance,
                rear_advance,
                start: start.clone(),
                start_hint: beg,
                end: finish.clone(),
                end_hint: end,
                props: Vec::new(),
            },
        );
        Message::OverlayAdd {
            buffer: self.name.clone(),
            site: key.site,
            clock: key.clock,
            species,
            front_advance,
            rear_advance,
            start_hint: beg,
            start,
            end_hint: end,
            end: finish,
        }
    }

    /// Re-anchors a locally owned overlay. `None` when the key is unknown.
    pub fn move_overlay(&mut self, key: OverlayKey, beg: usize, end: usize) -> Option<Message> {
        let (front, rear) = {
            let overlay = self.overlays.get(&key)?;
            (overlay.front_advance, overlay.rear_advance)
        };
        let (start, finish) = self.anchor_ids(front, rear, beg, end);
        let overlay = self.overlays.get_mut(&key)?;
        overlay.start = start.clone();
        overlay.start_hint = beg;
        overlay.end = finish.clone();
        overlay.end_hint = end;
        Some(Message::OverlayMove {
            buffer: self.name.clone(),
            site: key.site,
            clock: key.clock,
            start_hint: beg,
            start,
            end_hint: end,
            end: finish,
        })
    }

    /// Sets a property on a locally owned overlay. `None` when unknown.
    pub fn put_overlay_prop(
        &mut self,
        key: OverlayKey,
        prop: impl Into<String>,
        value: Value,
    ) -> Option<Message> {
        let prop = prop.into();
        let overlay = self.overlays.get_mut(&key)?;
        upsert_prop(&mut overlay.props, &prop, value.clone());
        Some(Message::OverlayPut {
            buffer: self.name.clone(),
            site: key.site,
            clock: key.clock,
            prop,
            value,
        })
    }

    /// Drops a locally owned overlay. `None` when unknown.
    pub fn remove_overlay(&mut self, key: OverlayKey) -> Option<Message> {
        self.overlays.remove(&key)?;
        Some(Message::OverlayRemove {
            buffer: self.name.clone(),
            site: key.site,
            clock: key.clock,
        })
    }

    /// Applies a peer's overlay-add. A key already present is left alone;
    /// re-adds are benign.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_overlay_add(
        &mut self,
        key: OverlayKey,
        species: String,
        front_advance: bool,
        rear_advance: bool,
        start: Id,
        start_hint: usize,
        end: Id,
        end_hint: usize,
    ) -> bool {
        if self.overlays.contains_key(&key) {
            return false;
        }
        self.overlays.insert(
            key,
            Overlay {
                species,
                front_advance,
                rear_advance,
                start,
                start_hint,
                end,
                end_hint,
                props: Vec::new(),
            },
        );
        true
    }

    /// Applies a peer's overlay-move; unknown keys are dropped silently.
    pub fn apply_overlay_move(
        &mut self,
        key: OverlayKey,
        start: Id,
        start_hint: usize,
        end: Id,
        end_hint: usize,
    ) -> bool {
        match self.overlays.get_mut(&key) {
            Some(overlay) => {
                overlay.start = start;
                overlay.start_hint = start_hint;
                overlay.end = end;
                overlay.end_hint = end_hint;
                true
            }
            None => false,
        }
    }

    /// Applies a peer's overlay-put; unknown keys are dropped silently.
    pub fn apply_overlay_put(&mut self, key: OverlayKey, prop: String, value: Value) -> bool {
        match self.overlays.get_mut(&key) {
            Some(overlay) => {
                upsert_prop(&mut overlay.props, &prop, value);
                true
            }
            None => false,
        }
    }

    /// Applies a peer's overlay-remove; unknown keys are dropped silently.
    pub fn apply_overlay_remove(&mut self, key: OverlayKey) -> bool {
        self.overlays.remove(&key).is_some()
    }

    pub fn overlay(&self, key: OverlayKey) -> Option<&Overlay> {
        self.overlays.get(&key)
    }

    /// Resolves an overlay to its current character range.
    pub fn resolve_overlay(&self, key: OverlayKey) -> Option<(usize, usize)> {
        let overlay = self.overlays.get(&key)?;
        let start = if overlay.front_advance {
            self.resolve_at(&overlay.start, overlay.start_hint)
        } else {
            self.resolve_after(&overlay.start, overlay.start_hint)
        };
        let end = if overlay.rear_advance {
            self.resolve_at(&overlay.end, overlay.end_hint)
        } else {
            self.resolve_after(&overlay.end, overlay.end_hint)
        };
        Some((start, end.max(start)))
    }

    /// Overlay add and put messages replayed to a newly admitted peer.
    pub fn overlay_replay(&self) -> Vec<Message> {
        let mut msgs = Vec::new();
        for (key, overlay) in &self.overlays {
            msgs.push(Message::OverlayAdd {
                buffer: self.name.clone(),
                site: key.site,
                clock: key.clock,
                species: overlay.species.clone(),
                front_advance: overlay.front_advance,
                rear_advance: overlay.rear_advance,
                start_hint: overlay.start_hint,
                start: overlay.start.clone(),
                end_hint: overlay.end_hint,
                end: overlay.end.clone(),
            });
            for (prop, value) in &overlay.props {
                msgs.push(Message::OverlayPut {
                    buffer: self.name.clone(),
                    site: key.site,
                    clock: key.clock,
                    prop: prop.clone(),
                    value: value.clone(),
                });
            }
        }
        msgs
    }

    #[cfg(test)]
    pub fn assert_invariants(&self) {
        self.store.assert_invariants();
    }

    #[cfg(test)]
    pub fn run_count(&self) -> usize {
        self.store.dump_runs().len()
    }
}

fn upsert_prop(props: &mut Vec<(String, Value)>, prop: &str, value: Value) {
    match props.iter_mut().find(|(name, _)| name == prop) {
        Some(slot) => slot.1 = value,
        None => props.push((prop.to_owned(), value)),
    }
}
