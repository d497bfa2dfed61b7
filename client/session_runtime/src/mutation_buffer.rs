//! Coalesces tree patches and publishes them on a fixed debounce.
//!
//! The buffer owns the only writable tree. Consumers only ever see the
//! snapshots returned by [`MutationBuffer::poll`], [`MutationBuffer::finish_run`]
//! and [`MutationBuffer::reset`].

use crate::element_tree::ElementTree;
use crate::error::TreeError;
use crate::protocol::Delta;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Window between the first unflushed patch and its publication.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_millis(10);

/// A pending flush. `publish_allowed` is frozen when the flush is scheduled:
/// a stop that lands before the timer fires does not admit later elements,
/// and a flush scheduled while the script was not running stays inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledFlush {
    pub due: Instant,
    pub publish_allowed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MutationBuffer {
    pending: ElementTree,
    dirty: bool,
    scheduled: Option<ScheduledFlush>,
    published: ElementTree,
}

impl MutationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_patch(
        &mut self,
        path: &[u32],
        delta: &Delta,
        run_id: &str,
        now: Instant,
        script_running: bool,
    ) -> Result<(), TreeError> {
        self.pending = self.pending.apply_delta(path, delta, run_id)?;
        self.dirty = true;

        if self.scheduled.is_none() {
            let flush = ScheduledFlush {
                due: now + FLUSH_DEBOUNCE,
                publish_allowed: script_running,
            };
            trace!(?path, publish_allowed = script_running, "scheduled tree flush");
            self.scheduled = Some(flush);
        }

        Ok(())
    }

    pub fn scheduled(&self) -> Option<ScheduledFlush> {
        self.scheduled
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduled.map(|flush| flush.due)
    }

    /// Fires the scheduled flush if it is due. Returns the published
    /// snapshot, or `None` when nothing was due or the flush was inert.
    pub fn poll(&mut self, now: Instant) -> Option<ElementTree> {
        let flush = self.scheduled.filter(|flush| flush.due <= now)?;
        self.scheduled = None;

        if !flush.publish_allowed {
            debug!("tree flush skipped: script was not running when scheduled");
            return None;
        }

        if !self.dirty {
            return None;
        }

        Some(self.publish())
    }

    /// Final flush for a completed run: drops nodes from superseded runs and
    /// publishes regardless of the run flag.
    pub fn finish_run(&mut self, run_id: &str) -> ElementTree {
        self.pending = self.pending.clear_stale_nodes(run_id);
        self.publish()
    }

    /// Publishes the pending tree as is. A fragment run redraws only its own
    /// subtree, so nothing outside it may be pruned.
    pub fn finish_fragment(&mut self) -> ElementTree {
        self.publish()
    }

    /// Adopts a fresh empty tree and publishes it.
    pub fn reset(&mut self) -> ElementTree {
        self.pending = ElementTree::empty();
        self.publish()
    }

    pub fn published(&self) -> &ElementTree {
        &self.published
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Nothing is unflushed afterwards, so any pending schedule is dropped
    /// and the next patch starts a fresh window with its own run flag.
    fn publish(&mut self) -> ElementTree {
        self.dirty = false;
        self.scheduled = None;
        self.published = self.pending.clone();
        self.published.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Element;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn text(body: &str) -> Delta {
        Delta::NewElement(Element::new("text").with_prop("body", json!(body)))
    }

    #[test]
    fn nothing_publishes_before_debounce_window() {
        let t0 = Instant::now();
        let mut buffer = MutationBuffer::new();
        buffer
            .apply_patch(&[0], &text("a"), "r1", t0, true)
            .expect("apply patch");

        assert_eq!(buffer.next_deadline(), Some(t0 + FLUSH_DEBOUNCE));
        assert!(buffer.poll(t0 + Duration::from_millis(9)).is_none());
        assert!(buffer.published().is_empty());

        let published = buffer
            .poll(t0 + FLUSH_DEBOUNCE)
            .expect("flush due at window end");
        assert!(published.get(&[0]).is_some());
        assert_eq!(buffer.next_deadline(), None);
    }

    #[test]
    fn later_patches_do_not_reset_timer() {
        let t0 = Instant::now();
        let mut buffer = MutationBuffer::new();
        buffer.apply_patch(&[0], &text("a"), "r1", t0, true).expect("a");
        buffer
            .apply_patch(&[1], &text("b"), "r1", t0 + Duration::from_millis(8), true)
            .expect("b");

        assert_eq!(buffer.next_deadline(), Some(t0 + FLUSH_DEBOUNCE));
        let published = buffer.poll(t0 + FLUSH_DEBOUNCE).expect("coalesced flush");
        assert_eq!(published.node_count(), 2);
    }

    #[test]
    fn flag_is_frozen_at_schedule_time() {
        let t0 = Instant::now();
        let mut buffer = MutationBuffer::new();
        buffer.apply_patch(&[0], &text("a"), "r1", t0, false).expect("a");
        // The script starts running before the timer fires; the flush stays inert.
        buffer
            .apply_patch(&[1], &text("b"), "r1", t0 + Duration::from_millis(2), true)
            .expect("b");

        assert!(buffer.poll(t0 + FLUSH_DEBOUNCE).is_none());
        assert!(buffer.published().is_empty());
        assert!(buffer.is_dirty());

        // Retained tree goes out with the next legitimate trigger.
        let t1 = t0 + Duration::from_millis(20);
        buffer.apply_patch(&[2], &text("c"), "r1", t1, true).expect("c");
        let published = buffer.poll(t1 + FLUSH_DEBOUNCE).expect("next flush");
        assert_eq!(published.node_count(), 3);
    }

    #[test]
    fn finish_run_prunes_and_publishes_unconditionally() {
        let t0 = Instant::now();
        let mut buffer = MutationBuffer::new();
        buffer.apply_patch(&[0], &text("old"), "A", t0, false).expect("old");
        buffer.apply_patch(&[1], &text("older"), "A", t0, false).expect("older");
        buffer.apply_patch(&[0], &text("new"), "B", t0, false).expect("new");

        let published = buffer.finish_run("B");
        assert_eq!(published.node_count(), 1);
        assert_eq!(buffer.published(), &published);

        // The inert schedule went out with the final publish.
        assert_eq!(buffer.next_deadline(), None);
        assert!(buffer.poll(t0 + FLUSH_DEBOUNCE).is_none());
    }

    #[test]
    fn reset_drops_schedule_of_discarded_tree() {
        let t0 = Instant::now();
        let mut buffer = MutationBuffer::new();
        buffer.apply_patch(&[0], &text("old"), "A", t0, false).expect("old");
        buffer.reset();
        assert_eq!(buffer.scheduled(), None);

        let t1 = t0 + Duration::from_millis(2);
        buffer.apply_patch(&[0], &text("new"), "B", t1, true).expect("new");
        assert_eq!(
            buffer.scheduled(),
            Some(ScheduledFlush {
                due: t1 + FLUSH_DEBOUNCE,
                publish_allowed: true
            })
        );
        assert!(buffer.poll(t0 + FLUSH_DEBOUNCE).is_none());
        let published = buffer.poll(t1 + FLUSH_DEBOUNCE).expect("new window flush");
        assert_eq!(published.node_count(), 1);
    }

    #[test]
    fn finish_fragment_keeps_nodes_from_earlier_runs() {
        let t0 = Instant::now();
        let mut buffer = MutationBuffer::new();
        buffer.apply_patch(&[0], &text("title"), "A", t0, true).expect("title");
        buffer.apply_patch(&[1], &text("body"), "A", t0, true).expect("body");
        buffer.finish_run("A");

        buffer.apply_patch(&[0], &text("title"), "B", t0, true).expect("redraw");
        let published = buffer.finish_fragment();
        assert_eq!(published.node_count(), 2);
        assert_eq!(buffer.next_deadline(), None);
    }

    #[test]
    fn published_snapshot_is_not_affected_by_later_patches() {
        let t0 = Instant::now();
        let mut buffer = MutationBuffer::new();
        buffer.apply_patch(&[0], &text("a"), "r1", t0, true).expect("a");
        let snapshot = buffer.poll(t0 + FLUSH_DEBOUNCE).expect("flush");

        buffer
            .apply_patch(&[0], &text("b"), "r1", t0 + FLUSH_DEBOUNCE, true)
            .expect("b");
        let element = snapshot.get(&[0]).and_then(|n| n.as_element()).expect("a");
        assert_eq!(element.props["body"], "a");
    }

    #[test]
    fn reset_publishes_empty_tree() {
        let t0 = Instant::now();
        let mut buffer = MutationBuffer::new();
        buffer.apply_patch(&[0], &text("a"), "r1", t0, true).expect("a");
        let published = buffer.reset();
        assert!(published.is_empty());
        assert!(!buffer.is_dirty());
    }

    #[test]
    fn rejected_patch_leaves_tree_and_timer_alone() {
        let t0 = Instant::now();
        let mut buffer = MutationBuffer::new();
        let err = buffer.apply_patch(&[3], &text("a"), "r1", t0, true);
        assert!(err.is_err());
        assert_eq!(buffer.next_deadline(), None);
        assert!(!buffer.is_dirty());
    }

    proptest! {
        #[test]
        fn prop_coalescing_matches_direct_application(
            ops in proptest::collection::vec((0u32..3, "[a-z]{1,3}"), 0..20)
        ) {
            let t0 = Instant::now();
            let mut buffer = MutationBuffer::new();
            let mut direct = ElementTree::empty();

            for (index, body) in &ops {
                let delta = text(body);
                let buffered = buffer.apply_patch(&[*index], &delta, "r1", t0, true);
                match direct.apply_delta(&[*index], &delta, "r1") {
                    Ok(next) => {
                        prop_assert!(buffered.is_ok());
                        direct = next;
                    }
                    Err(_) => prop_assert!(buffered.is_err()),
                }
            }

            let flushed = buffer.poll(t0 + FLUSH_DEBOUNCE).unwrap_or_else(|| buffer.published().clone());
            prop_assert_eq!(flushed, direct);
        }
    }
}
