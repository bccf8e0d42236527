//! Wired-memory tracking over the driver's residency facility
//!
//! Tracks every direct (non-heap) buffer the allocator currently owns or
//! has handed out and keeps as many of them wired into physical memory as
//! the byte budget allows. Members that do not fit stay tracked but
//! unwired until space frees up. Insertion order is preserved; re-wiring
//! prefers the oldest-inserted members, on the theory that long-lived
//! buffers profit most from staying wired.
//!
//! All driver calls are best-effort: failures are logged and swallowed.
//! The set is touched only while the allocator's mutex is held.

use std::sync::Arc;

use crate::backend::{RawBuffer, ResidencyDriver};

#[derive(Debug)]
struct Member {
    buf: RawBuffer,
    wired: bool,
}

/// Set of buffers kept wired into physical memory up to a byte budget
#[derive(Debug)]
pub struct ResidencySet {
    driver: Option<Arc<dyn ResidencyDriver>>,
    /// Wire budget in bytes
    capacity: usize,
    /// Bytes currently wired
    wired_bytes: usize,
    /// Members in insertion order
    members: Vec<Member>,
}

impl ResidencySet {
    pub fn new(driver: Option<Arc<dyn ResidencyDriver>>, capacity: usize) -> Self {
        ResidencySet {
            driver,
            capacity,
            wired_bytes: 0,
            members: Vec::new(),
        }
    }

    /// Set with no driver facility behind it; tracking only
    pub fn detached() -> Self {
        Self::new(None, 0)
    }

    /// Track `buf` and wire it if the budget allows
    ///
    /// Infallible from the caller's perspective. Double insertion is a
    /// caller bug; it is logged and ignored.
    pub fn insert(&mut self, buf: &RawBuffer) {
        if self.position(buf).is_some() {
            tracing::warn!(buffer = ?buf, "buffer already in residency set");
            return;
        }
        let mut member = Member {
            buf: buf.clone(),
            wired: false,
        };
        let len = member.buf.length();
        if self.wired_bytes + len <= self.capacity {
            member.wired = self.wire(&member.buf);
            if member.wired {
                self.wired_bytes += len;
            }
        } else {
            tracing::trace!(len, "residency budget full, tracking unwired");
        }
        self.members.push(member);
    }

    /// Stop tracking `buf`, unwiring it first if needed
    ///
    /// Freed budget is handed to the oldest unwired members.
    pub fn erase(&mut self, buf: &RawBuffer) {
        let Some(pos) = self.position(buf) else {
            tracing::warn!(buffer = ?buf, "buffer not in residency set");
            return;
        };
        let member = self.members.remove(pos);
        if member.wired {
            self.unwire(&member.buf);
            self.wired_bytes -= member.buf.length();
            self.rewire();
        }
    }

    /// Grow or shrink the wire budget
    ///
    /// Shrinking unwires the newest-inserted members first, so the oldest
    /// stay wired; growing re-wires waiters oldest-first.
    pub fn resize(&mut self, new_capacity: usize) {
        self.capacity = new_capacity;
        let mut idx = self.members.len();
        while self.wired_bytes > self.capacity && idx > 0 {
            idx -= 1;
            if !self.members[idx].wired {
                continue;
            }
            let buf = self.members[idx].buf.clone();
            self.unwire(&buf);
            self.members[idx].wired = false;
            self.wired_bytes -= buf.length();
        }
        self.rewire();
    }

    /// The driver-side residency facility, for runtime registration
    pub fn handle(&self) -> Option<&Arc<dyn ResidencyDriver>> {
        self.driver.as_ref()
    }

    /// Bytes currently wired
    pub fn wired_bytes(&self) -> usize {
        self.wired_bytes
    }

    /// Current wire budget
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tracked buffers
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Wire unwired members oldest-first while the budget allows.
    /// Members too large for the remaining budget are skipped so smaller,
    /// newer ones can still fill it.
    fn rewire(&mut self) {
        for idx in 0..self.members.len() {
            if self.members[idx].wired {
                continue;
            }
            let len = self.members[idx].buf.length();
            if self.wired_bytes + len > self.capacity {
                continue;
            }
            let buf = self.members[idx].buf.clone();
            if self.wire(&buf) {
                self.members[idx].wired = true;
                self.wired_bytes += len;
            }
        }
    }

    fn position(&self, buf: &RawBuffer) -> Option<usize> {
        self.members
            .iter()
            .position(|m| m.buf.same_allocation(buf))
    }

    fn wire(&self, buf: &RawBuffer) -> bool {
        match &self.driver {
            Some(driver) => {
                let wired = driver.wire(buf);
                if !wired {
                    tracing::warn!(len = buf.length(), "driver refused to wire buffer");
                }
                wired
            }
            None => false,
        }
    }

    fn unwire(&self, buf: &RawBuffer) {
        if let Some(driver) = &self.driver {
            driver.unwire(buf);
        }
    }
}
