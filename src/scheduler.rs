//! The priority tree: a dependency graph of streams rooted at the
//! connection pseudo-node (id 0), plus the connection- and stream-level
//! flow-control accounting.
//!
//! Grounded on the design note in spec.md section 9 ("use indices into a
//! dense vector plus a free list, not owned pointers") and on the
//! reparenting/exclusive-dependency algorithm in
//! `waieez-solicit::http::flow::prioritymanager`, adapted from a
//! `HashMap`-backed tree to an arena so `iter` stays a flat scan and closed
//! streams can be recycled without touching sibling links one at a time.

use log::trace;
use std::collections::HashMap;

use crate::frame::Priority;
use crate::stream::{CloseReason, Stream};
use crate::types::{StreamId, U31_MAX};

struct Node {
    stream: Stream,
    parent: usize,
    children: Vec<usize>,
    weight: u8,
    /// Outbound credit remaining for this stream (spec.md section 4.3's
    /// "flow").
    flow: i64,
    /// Inbound credit we've advertised to the peer (spec.md section 4.3's
    /// "inflow").
    inflow: i64,
}

/// Sentinel index for "no parent" / the connection root. The root itself is
/// never stored in the arena — only its aggregate flow/inflow are, via
/// `Scheduler::connection_flow`/`connection_inflow`.
const ROOT: usize = usize::MAX;

pub struct Scheduler {
    arena: Vec<Option<Node>>,
    free_list: Vec<usize>,
    index_of: HashMap<StreamId, usize>,
    root_children: Vec<usize>,
    connection_flow: i64,
    connection_inflow: i64,
}

impl Scheduler {
    #[must_use]
    pub fn new(initial_connection_window: i64) -> Self {
        Self {
            arena: Vec::new(),
            free_list: Vec::new(),
            index_of: HashMap::new(),
            root_children: Vec::new(),
            connection_flow: initial_connection_window,
            connection_inflow: initial_connection_window,
        }
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free_list.pop() {
            self.arena[idx] = Some(node);
            idx
        } else {
            self.arena.push(Some(node));
            self.arena.len() - 1
        }
    }

    /// spec.md section 4.3 `add`: inserts a stream into the tree, optionally
    /// under an explicit priority (defaults to a root-level dependency with
    /// RFC 7540's default weight).
    pub fn add(&mut self, stream: Stream, priority: Option<Priority>, initial_window_size: i64) {
        let id = stream.id();
        let priority = priority.unwrap_or_default();
        let node = Node {
            stream,
            parent: ROOT,
            children: Vec::new(),
            weight: priority.weight,
            flow: initial_window_size,
            inflow: initial_window_size,
        };
        let idx = self.alloc(node);
        self.index_of.insert(id, idx);
        self.root_children.push(idx);
        if priority.dependency != 0 {
            if let Some(&parent_idx) = self.index_of.get(&priority.dependency) {
                self.reparent(idx, parent_idx, priority.exclusive);
            }
        }
        trace!("scheduler: added stream {id}");
    }

    #[must_use]
    pub fn get_node(&self, id: StreamId) -> Option<&Stream> {
        self.index_of.get(&id).and_then(|&idx| self.arena[idx].as_ref()).map(|n| &n.stream)
    }

    pub fn get_node_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        let idx = *self.index_of.get(&id)?;
        self.arena[idx].as_mut().map(|n| &mut n.stream)
    }

    /// spec.md section 4.3 `find`: unwraps straight to the stream
    /// descriptor, for call sites that already know the stream exists.
    pub fn find(&mut self, id: StreamId) -> &mut Stream {
        self.get_node_mut(id).expect("find() called for an id not in the scheduler")
    }

    #[must_use]
    pub fn contains(&self, id: StreamId) -> bool {
        self.index_of.contains_key(&id)
    }

    /// spec.md section 4.4.3: rejects self-dependency before `reprioritize_stream`
    /// is even invoked.
    #[must_use]
    pub fn is_self_dependent(priority: &Priority, stream: StreamId) -> bool {
        priority.dependency == stream
    }

    /// spec.md section 4.3 `reprioritize_stream`.
    pub fn reprioritize_stream(&mut self, id: StreamId, priority: Priority) {
        let Some(&idx) = self.index_of.get(&id) else {
            return;
        };
        if let Some(node) = self.arena[idx].as_mut() {
            node.weight = priority.weight;
        }
        if priority.dependency == 0 {
            self.detach(idx);
            self.root_children.push(idx);
            if let Some(node) = self.arena[idx].as_mut() {
                node.parent = ROOT;
            }
            return;
        }
        if let Some(&parent_idx) = self.index_of.get(&priority.dependency) {
            self.reparent(idx, parent_idx, priority.exclusive);
        }
    }

    fn detach(&mut self, idx: usize) {
        let parent = self.arena[idx].as_ref().map(|n| n.parent);
        match parent {
            Some(ROOT) | None => {
                self.root_children.retain(|&c| c != idx);
            }
            Some(parent_idx) => {
                if let Some(parent_node) = self.arena[parent_idx].as_mut() {
                    parent_node.children.retain(|&c| c != idx);
                }
            }
        }
    }

    /// Moves `idx` to depend on `parent_idx`. If `exclusive`, `idx` adopts
    /// all of `parent_idx`'s prior children (RFC 7540 section 5.3.1),
    /// mirroring `prioritymanager::set_as_exclusive`.
    fn reparent(&mut self, idx: usize, parent_idx: usize, exclusive: bool) {
        if idx == parent_idx {
            return;
        }
        self.detach(idx);

        let previous_children = if exclusive {
            self.arena[parent_idx]
                .as_mut()
                .map(|p| std::mem::take(&mut p.children))
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        if let Some(parent_node) = self.arena[parent_idx].as_mut() {
            parent_node.children.push(idx);
        }
        if let Some(node) = self.arena[idx].as_mut() {
            node.parent = parent_idx;
        }

        for child in previous_children {
            if let Some(child_node) = self.arena[child].as_mut() {
                child_node.parent = idx;
            }
            if let Some(node) = self.arena[idx].as_mut() {
                node.children.push(child);
            }
        }
    }

    /// spec.md section 4.3 `add_flow`: returns false iff the new value
    /// would exceed 2^31-1.
    #[must_use]
    pub fn add_flow(&mut self, id: StreamId, delta: i64) -> bool {
        let Some(&idx) = self.index_of.get(&id) else {
            return true;
        };
        let Some(node) = self.arena[idx].as_mut() else {
            return true;
        };
        let new_value = node.flow + delta;
        if new_value > i64::from(U31_MAX.get()) {
            return false;
        }
        node.flow = new_value;
        true
    }

    #[must_use]
    pub fn add_connection_flow(&mut self, delta: i64) -> bool {
        let new_value = self.connection_flow + delta;
        if new_value > i64::from(U31_MAX.get()) {
            return false;
        }
        self.connection_flow = new_value;
        true
    }

    #[must_use]
    pub fn stream_flow(&self, id: StreamId) -> i64 {
        self.index_of
            .get(&id)
            .and_then(|&idx| self.arena[idx].as_ref())
            .map_or(0, |n| n.flow)
    }

    #[must_use]
    pub fn connection_flow(&self) -> i64 {
        self.connection_flow
    }

    /// spec.md section 4.3 `add_inflow`.
    #[must_use]
    pub fn add_inflow(&mut self, id: StreamId, delta: i64) -> bool {
        let Some(&idx) = self.index_of.get(&id) else {
            return true;
        };
        let Some(node) = self.arena[idx].as_mut() else {
            return true;
        };
        let new_value = node.inflow + delta;
        if new_value > i64::from(U31_MAX.get()) {
            return false;
        }
        node.inflow = new_value;
        true
    }

    #[must_use]
    pub fn add_connection_inflow(&mut self, delta: i64) -> bool {
        let new_value = self.connection_inflow + delta;
        if new_value > i64::from(U31_MAX.get()) {
            return false;
        }
        self.connection_inflow = new_value;
        true
    }

    /// spec.md section 4.3 `deduct_inflow`: may go negative on error paths.
    pub fn deduct_inflow(&mut self, id: StreamId, n: i64) {
        if let Some(&idx) = self.index_of.get(&id) {
            if let Some(node) = self.arena[idx].as_mut() {
                node.inflow -= n;
            }
        }
    }

    pub fn deduct_connection_inflow(&mut self, n: i64) {
        self.connection_inflow -= n;
    }

    /// spec.md section 4.3 `allowed_to_receive`.
    #[must_use]
    pub fn allowed_to_receive(&self, id: StreamId, n: i64) -> bool {
        if self.connection_inflow < n {
            return false;
        }
        self.index_of
            .get(&id)
            .and_then(|&idx| self.arena[idx].as_ref())
            .map_or(true, |node| node.inflow >= n)
    }

    /// spec.md section 4.3 `mark_for_removal`: kept as an explicit call so
    /// every close path names its intent, even though eviction eligibility
    /// is now read straight off the stream's own state (`Stream::is_closed`)
    /// rather than a separate flag, so a stream that closes via the normal
    /// mutual-FIN path is just as evictable as one reset through this call.
    pub fn mark_for_removal(&mut self, _id: StreamId, _closed_reason: CloseReason) {}

    /// Evicts closed streams whose id falls below the given watermarks and
    /// which have no pending output, per spec.md section 9's grace-window
    /// note.
    pub fn evict_below_watermarks(&mut self, max_client_id: StreamId, max_pushed_id: StreamId) {
        let mut to_remove = Vec::new();
        for (&id, &idx) in &self.index_of {
            let Some(node) = self.arena[idx].as_ref() else {
                continue;
            };
            if !node.stream.is_closed() {
                continue;
            }
            let below_watermark = if crate::types::is_client_initiated(id) {
                id < max_client_id
            } else {
                id < max_pushed_id
            };
            if below_watermark && !node.stream.requires_output() {
                to_remove.push((id, idx));
            }
        }
        for (id, idx) in to_remove {
            self.detach(idx);
            self.index_of.remove(&id);
            self.arena[idx] = None;
            self.free_list.push(idx);
            trace!("scheduler: evicted stream {id}");
        }
    }

    /// spec.md section 4.3 `flush`: walks the tree in priority order,
    /// writing out each Open stream's pending body, bounded by both the
    /// stream's outbound window and the connection window.
    pub fn flush(
        &mut self,
        max_frame_size: u32,
        max_ids: (StreamId, StreamId),
        mut emit: impl FnMut(crate::frame::Frame),
    ) {
        let order = self.priority_order();
        for idx in order {
            if self.connection_flow <= 0 {
                break;
            }
            let Some(node) = self.arena[idx].as_mut() else {
                continue;
            };
            if !node.stream.requires_output() {
                continue;
            }
            let budget = node.flow.max(0).min(self.connection_flow) as usize;
            let written = node.stream.flush_write_body(max_frame_size as usize, budget, &mut emit);
            node.flow -= written as i64;
            self.connection_flow -= written as i64;
        }
        self.evict_below_watermarks(max_ids.0, max_ids.1);
    }

    /// Depth-first, weight-ordered traversal starting from the root's
    /// children — a round-robin-by-weight walk in the spirit of
    /// `prioritymanager`'s queue, generalized to respect the dependency
    /// tree instead of flattening it.
    fn priority_order(&self) -> Vec<usize> {
        let mut order = Vec::new();
        let mut stack: Vec<usize> = self.root_children.clone();
        stack.sort_by_key(|&idx| std::cmp::Reverse(self.arena[idx].as_ref().map_or(0, |n| n.weight)));
        while let Some(idx) = stack.pop() {
            if self.arena[idx].is_none() {
                continue;
            }
            order.push(idx);
            if let Some(node) = self.arena[idx].as_ref() {
                let mut children = node.children.clone();
                children.sort_by_key(|&c| std::cmp::Reverse(self.arena[c].as_ref().map_or(0, |n| n.weight)));
                stack.extend(children);
            }
        }
        order
    }

    /// Applies `delta` to every live stream's outbound window, per spec.md
    /// section 4.4.5's SETTINGS_INITIAL_WINDOW_SIZE handling. Returns false
    /// if any stream's window would overflow 2^31-1.
    #[must_use]
    pub fn add_flow_to_all(&mut self, delta: i64) -> bool {
        for slot in &mut self.arena {
            if let Some(node) = slot {
                let new_value = node.flow + delta;
                if new_value > i64::from(U31_MAX.get()) {
                    return false;
                }
                node.flow = new_value;
            }
        }
        true
    }

    /// Stream ids of every currently-Open stream whose output is still
    /// required, used by SETTINGS_MAX_FRAME_SIZE handling.
    pub fn open_stream_ids_requiring_output(&self) -> Vec<StreamId> {
        self.arena
            .iter()
            .flatten()
            .filter(|n| n.stream.requires_output())
            .map(|n| n.stream.id())
            .collect()
    }

    /// spec.md section 4.3 `iter`: visits all live streams exactly once, in
    /// unspecified order.
    pub fn iter(&self, mut f: impl FnMut(&Stream)) {
        for node in self.arena.iter().flatten() {
            f(&node.stream);
        }
    }

    pub fn iter_mut(&mut self, mut f: impl FnMut(&mut Stream)) {
        for node in self.arena.iter_mut().flatten() {
            f(&mut node.stream);
        }
    }

    #[must_use]
    pub fn live_stream_count(&self) -> usize {
        self.arena
            .iter()
            .flatten()
            .filter(|n| !n.stream.is_closed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;

    fn stream(id: StreamId) -> Stream {
        Stream::new(id)
    }

    #[test]
    fn add_and_find_round_trips() {
        let mut sched = Scheduler::new(65_535);
        sched.add(stream(1), None, 65_535);
        assert!(sched.contains(1));
        assert_eq!(sched.find(1).id(), 1);
    }

    #[test]
    fn self_dependency_is_detected_before_reprioritize() {
        let priority = Priority { dependency: 7, exclusive: false, weight: 16 };
        assert!(Scheduler::is_self_dependent(&priority, 7));
    }

    #[test]
    fn exclusive_reparent_adopts_siblings() {
        let mut sched = Scheduler::new(65_535);
        sched.add(stream(1), None, 65_535);
        sched.add(stream(3), Some(Priority { dependency: 1, exclusive: false, weight: 16 }), 65_535);
        sched.add(stream(5), Some(Priority { dependency: 1, exclusive: false, weight: 16 }), 65_535);
        sched.reprioritize_stream(7, Priority { dependency: 1, exclusive: true, weight: 16 });
        // 7 doesn't exist yet, so this is a no-op; exercise the real exclusive path instead:
        sched.add(stream(7), None, 65_535);
        sched.reprioritize_stream(7, Priority { dependency: 1, exclusive: true, weight: 16 });
        let idx7 = sched.index_of[&7];
        let idx1 = sched.index_of[&1];
        assert_eq!(sched.arena[idx1].as_ref().unwrap().children, vec![idx7]);
        let children7 = &sched.arena[idx7].as_ref().unwrap().children;
        assert_eq!(children7.len(), 2);
    }

    #[test]
    fn add_flow_rejects_overflow() {
        let mut sched = Scheduler::new(0);
        sched.add(stream(1), None, i64::from(U31_MAX.get()));
        assert!(!sched.add_flow(1, 1));
    }
}
