//! Transient state of open containers.
use std::collections::VecDeque;

use hashbrown::HashSet;

use crate::umem::UmemOff;

/// Handle of an open container, valid until the matching close.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContHandle {
    df: UmemOff,
}

impl ContHandle {
    pub(crate) fn new(df: UmemOff) -> Self {
        Self { df }
    }

    /// Offset of the container descriptor.
    pub fn df(&self) -> UmemOff {
        self.df
    }
}

pub(crate) struct Container {
    pub df: UmemOff,
    pub opened: u32,
}

/// Round robin list of containers with pending garbage. A container is at most once in the
/// list.
#[derive(Clone, Default, Debug)]
pub struct ContList {
    queue: VecDeque<UmemOff>,
    members: HashSet<UmemOff>,
}

impl ContList {
    pub fn contains(&self, cont: UmemOff) -> bool {
        self.members.contains(&cont)
    }

    /// Appends `cont` unless it is queued already.
    pub fn push(&mut self, cont: UmemOff) -> bool {
        if !self.members.insert(cont) {
            return false;
        }
        self.queue.push_back(cont);
        true
    }

    pub fn pop(&mut self) -> Option<UmemOff> {
        let cont = self.queue.pop_front()?;
        self.members.remove(&cont);
        Some(cont)
    }

    pub fn remove(&mut self, cont: UmemOff) -> bool {
        if !self.members.remove(&cont) {
            return false;
        }
        self.queue.retain(|c| *c != cont);
        true
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = UmemOff> + '_ {
        self.queue.iter().copied()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.members.clear();
    }
}
