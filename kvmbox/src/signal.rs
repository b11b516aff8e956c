// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Process-wide pending-signal queue.
//!
//! The host signal handler installed here may only enqueue: it runs
//! asynchronously and must never touch VM state. The queue is a
//! fixed-size single-producer/single-consumer ring of atomics, so both
//! sides stay async-signal-safe. The dispatcher drains it between vCPU
//! quanta.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

const QUEUE_CAPACITY: usize = 32;

struct SignalQueue {
    head: AtomicUsize,
    tail: AtomicUsize,
    slots: [AtomicI32; QUEUE_CAPACITY],
}

impl SignalQueue {
    const fn new() -> Self {
        const ZERO: AtomicI32 = AtomicI32::new(0);
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            slots: [ZERO; QUEUE_CAPACITY],
        }
    }

    /// Called from the host signal handler.
    fn push(&self, signum: i32) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % QUEUE_CAPACITY;
        if next == self.tail.load(Ordering::Acquire) {
            // Queue full; the signal is dropped.
            return;
        }
        self.slots[head].store(signum, Ordering::Relaxed);
        self.head.store(next, Ordering::Release);
    }

    fn pop(&self) -> Option<i32> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let signum = self.slots[tail].load(Ordering::Relaxed);
        self.tail
            .store((tail + 1) % QUEUE_CAPACITY, Ordering::Release);
        Some(signum)
    }
}

static PENDING_SIGNALS: SignalQueue = SignalQueue::new();

extern "C" fn host_signal_handler(signum: libc::c_int) {
    PENDING_SIGNALS.push(signum);
}

/// Install the enqueue-only host handler for `signum`. Done once per
/// signal number the guest registers a disposition for.
pub fn install_host_handler(signum: i32) -> std::io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = host_signal_handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        if libc::sigaction(signum, &sa, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Pop the next pending signal, if any.
pub fn next_pending() -> Option<i32> {
    PENDING_SIGNALS.pop()
}

/// Push a signal as if it had been received from the host. Used by
/// tests.
pub fn inject_pending(signum: i32) {
    PENDING_SIGNALS.push(signum);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_round_trip() {
        while next_pending().is_some() {}
        inject_pending(2);
        inject_pending(15);
        assert_eq!(next_pending(), Some(2));
        assert_eq!(next_pending(), Some(15));
        assert_eq!(next_pending(), None);
    }
}
