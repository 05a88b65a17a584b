//! Deferred CFG edits.
//!
//! Passes that rewrite while iterating record their edits against
//! instruction identities and apply them in one `flush`, so instruction
//! positions stay valid for the whole scan. Replacing or removing a result
//! producer consumes its `MoveResult*` as well; inserts after a producer
//! land after the `MoveResult*`.

use rustc_hash::FxHashMap;

use crate::cfg::{BlockItem, ControlFlowGraph};
use crate::ir::entities::InsnUid;
use crate::ir::insn::Insn;

enum Primary {
    Replace(Vec<Insn>),
    Remove,
}

#[derive(Default)]
struct Entry {
    before: Vec<Insn>,
    after: Vec<Insn>,
    primary: Option<Primary>,
}

/// A buffer of pending edits keyed by instruction identity.
#[derive(Default)]
pub struct CfgMutation {
    entries: FxHashMap<InsnUid, Entry>,
}

impl CfgMutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert_before(&mut self, at: InsnUid, insns: Vec<Insn>) {
        self.entries.entry(at).or_default().before.extend(insns);
    }

    pub fn insert_after(&mut self, at: InsnUid, insns: Vec<Insn>) {
        self.entries.entry(at).or_default().after.extend(insns);
    }

    pub fn replace(&mut self, at: InsnUid, insns: Vec<Insn>) {
        let entry = self.entries.entry(at).or_default();
        assert!(entry.primary.is_none(), "conflicting edits for {at}");
        entry.primary = Some(Primary::Replace(insns));
    }

    pub fn remove(&mut self, at: InsnUid) {
        let entry = self.entries.entry(at).or_default();
        assert!(entry.primary.is_none(), "conflicting edits for {at}");
        entry.primary = Some(Primary::Remove);
    }

    /// Apply all recorded edits.
    pub fn flush(mut self, cfg: &mut ControlFlowGraph) {
        if self.entries.is_empty() {
            return;
        }
        for block in cfg.blocks() {
            if self.entries.is_empty() {
                break;
            }
            let items = std::mem::take(&mut cfg.blocks[block].items);
            let mut out = Vec::with_capacity(items.len());
            let mut iter = items.into_iter().peekable();
            while let Some(item) = iter.next() {
                let insn = match item {
                    BlockItem::Insn(insn) => insn,
                    other => {
                        out.push(other);
                        continue;
                    }
                };
                let Some(entry) = self.entries.remove(&insn.uid()) else {
                    out.push(BlockItem::Insn(insn));
                    continue;
                };
                out.extend(entry.before.into_iter().map(BlockItem::Insn));
                // Keep the producer and its move-result glued together.
                let mut companion = None;
                if insn.opcode().has_move_result_any() {
                    if let Some(BlockItem::Insn(next)) = iter.peek() {
                        if next.opcode().is_move_result_any() {
                            companion = iter.next();
                        }
                    }
                }
                match entry.primary {
                    Some(Primary::Remove) => {}
                    Some(Primary::Replace(insns)) => {
                        out.extend(insns.into_iter().map(BlockItem::Insn));
                    }
                    None => {
                        out.push(BlockItem::Insn(insn));
                        if let Some(companion) = companion {
                            out.push(companion);
                        }
                    }
                }
                out.extend(entry.after.into_iter().map(BlockItem::Insn));
            }
            cfg.blocks[block].items = out;
        }
        debug_assert!(
            self.entries.is_empty(),
            "edits recorded against instructions that are no longer in the graph"
        );
    }
}
