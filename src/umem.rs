//! In-process persistent memory instance.
//!
//! Records live in slots addressed by [UmemOff]. Every mutation has to happen inside a
//! transaction: a record is snapshotted into the undo log by [Umem::tx_add] before the first
//! write, allocations are undone by releasing the slot and frees are deferred until commit.
//! Aborting a transaction (or [Umem::crash]) replays the undo log backwards, which restores
//! the exact pre-transaction state.

use hashbrown::HashSet;

use crate::{
    error::{GcError, Result},
    layout::Record,
};

/// Opaque persistent offset. Offset zero is the null offset.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct UmemOff(u64);

impl UmemOff {
    pub const NULL: UmemOff = UmemOff(0);

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    const fn from_slot(slot: usize) -> Self {
        Self(slot as u64 + 1)
    }

    const fn slot(self) -> usize {
        self.0 as usize - 1
    }
}

impl std::fmt::Display for UmemOff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Faults that can be armed to exercise failure paths. Each one fires once.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Fault {
    /// Next `tx_begin` fails.
    TxBegin,
    /// Next outermost `tx_end` fails to commit and rolls back.
    TxCommit,
    /// Next allocation reports no space.
    Alloc,
}

enum Undo {
    Snapshot { off: UmemOff, record: Record },
    Alloc { off: UmemOff },
    Free { off: UmemOff, record: Record },
}

struct Tx {
    depth: u32,
    undo: Vec<Undo>,
    /// Offsets that may be written in place for the rest of the transaction.
    writable: HashSet<UmemOff>,
    /// Slots released at commit together with their sizes.
    pending_free: Vec<(UmemOff, usize)>,
    failed: Option<GcError>,
}

pub struct Umem {
    slots: Vec<Option<Record>>,
    free_slots: Vec<usize>,
    capacity: usize,
    used: usize,
    tx: Option<Tx>,
    faults: Vec<Fault>,
}

impl Umem {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            capacity,
            used: 0,
            tx: None,
            faults: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes held by live records, including records freed by the open transaction.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of live records.
    pub fn live_records(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn in_tx(&self) -> bool {
        self.tx.is_some()
    }

    pub fn inject(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(ix) => {
                self.faults.swap_remove(ix);
                true
            }
            None => false,
        }
    }

    pub fn tx_begin(&mut self) -> Result<()> {
        if self.take_fault(Fault::TxBegin) {
            return Err(GcError::Io("failed to begin transaction".into()));
        }
        match self.tx {
            Some(ref mut tx) => tx.depth += 1,
            None => {
                self.tx = Some(Tx {
                    depth: 1,
                    undo: Vec::new(),
                    writable: HashSet::new(),
                    pending_free: Vec::new(),
                    failed: None,
                })
            }
        }
        Ok(())
    }

    /// Ends the innermost transaction. An error in `rc` aborts the whole transaction; the
    /// outermost end commits or rolls back and returns the first recorded error.
    pub fn tx_end(&mut self, rc: Result<()>) -> Result<()> {
        let mut tx = self.tx.take().ok_or(GcError::NoTx)?;
        if let Err(e) = rc {
            tx.failed.get_or_insert(e);
        }
        tx.depth -= 1;
        if tx.depth > 0 {
            let rc = match tx.failed {
                Some(ref e) => Err(e.clone()),
                None => Ok(()),
            };
            self.tx = Some(tx);
            return rc;
        }

        if let Some(e) = tx.failed.clone() {
            self.rollback(tx);
            return Err(e);
        }
        if self.take_fault(Fault::TxCommit) {
            self.rollback(tx);
            return Err(GcError::Io("failed to commit transaction".into()));
        }
        for (off, size) in tx.pending_free {
            self.used -= size;
            self.free_slots.push(off.slot());
        }
        Ok(())
    }

    /// Simulates a process restart: an in-flight transaction never committed, so its undo log
    /// is replayed.
    pub fn crash(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.rollback(tx);
        }
        self.faults.clear();
    }

    fn rollback(&mut self, tx: Tx) {
        for undo in tx.undo.into_iter().rev() {
            match undo {
                Undo::Snapshot { off, record } => {
                    self.slots[off.slot()] = Some(record);
                }
                Undo::Alloc { off } => {
                    let record = self.slots[off.slot()]
                        .take()
                        .expect("allocated record vanished before rollback");
                    self.used -= record.size();
                    self.free_slots.push(off.slot());
                }
                Undo::Free { off, record } => {
                    self.slots[off.slot()] = Some(record);
                }
            }
        }
    }

    /// Snapshot `off` so that it can be modified by the current transaction.
    pub fn tx_add(&mut self, off: UmemOff) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(GcError::NoTx)?;
        if off.is_null() {
            return Err(GcError::NonExist);
        }
        if tx.writable.contains(&off) {
            return Ok(());
        }
        let record = self
            .slots
            .get(off.slot())
            .and_then(|slot| slot.clone())
            .ok_or(GcError::NonExist)?;
        tx.undo.push(Undo::Snapshot { off, record });
        tx.writable.insert(off);
        Ok(())
    }

    pub fn alloc(&mut self, record: Record) -> Result<UmemOff> {
        if self.tx.is_none() {
            return Err(GcError::NoTx);
        }
        let size = record.size();
        if self.take_fault(Fault::Alloc) || self.used + size > self.capacity {
            return Err(GcError::NoSpace);
        }
        let off = match self.free_slots.pop() {
            Some(slot) => {
                debug_assert!(self.slots[slot].is_none());
                self.slots[slot] = Some(record);
                UmemOff::from_slot(slot)
            }
            None => {
                self.slots.push(Some(record));
                UmemOff::from_slot(self.slots.len() - 1)
            }
        };
        self.used += size;
        if let Some(ref mut tx) = self.tx {
            tx.undo.push(Undo::Alloc { off });
            tx.writable.insert(off);
        }
        Ok(off)
    }

    /// Releases `off`. The slot is not reused before the transaction commits.
    pub fn free(&mut self, off: UmemOff) -> Result<()> {
        let tx = self.tx.as_mut().ok_or(GcError::NoTx)?;
        if off.is_null() {
            return Err(GcError::NonExist);
        }
        let record = match self.slots.get_mut(off.slot()).and_then(|slot| slot.take()) {
            Some(record) => record,
            None => panic!("double free of persistent record {}", off),
        };
        tx.pending_free.push((off, record.size()));
        tx.writable.remove(&off);
        tx.undo.push(Undo::Free { off, record });
        Ok(())
    }

    pub fn get(&self, off: UmemOff) -> Option<&Record> {
        if off.is_null() {
            return None;
        }
        self.slots.get(off.slot()).and_then(|slot| slot.as_ref())
    }

    /// Mutable access to a record already snapshotted by [Umem::tx_add] (or allocated by the
    /// current transaction).
    pub fn get_mut(&mut self, off: UmemOff) -> Option<&mut Record> {
        if off.is_null() {
            return None;
        }
        match self.tx {
            Some(ref tx) if tx.writable.contains(&off) => {}
            _ => panic!("write to persistent record {} without snapshot", off),
        }
        self.slots.get_mut(off.slot()).and_then(|slot| slot.as_mut())
    }

    /// Live records in slot order.
    pub fn records(&self) -> impl Iterator<Item = (UmemOff, &Record)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, rec)| rec.as_ref().map(|rec| (UmemOff::from_slot(slot), rec)))
    }

    pub fn record(&self, off: UmemOff) -> &Record {
        match self.get(off) {
            Some(record) => record,
            None => panic!("dangling persistent offset {}", off),
        }
    }

    pub fn record_mut(&mut self, off: UmemOff) -> &mut Record {
        match self.get_mut(off) {
            Some(record) => record,
            None => panic!("dangling persistent offset {}", off),
        }
    }
}
