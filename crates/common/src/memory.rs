//! Byte-budget accounting for buffered rows.
//!
//! A [`BytesMonitor`] owns a budget shared by everything reserving through
//! it. Operators hold a [`BoundAccount`] and grow/shrink it as their buffers
//! change; a reservation that would cross the budget fails immediately with
//! [`RowflowError::ResourceExhausted`] instead of blocking or spilling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, RowflowError};

/// Shared byte budget.
#[derive(Debug)]
pub struct BytesMonitor {
    name: String,
    budget_bytes: usize,
    in_use_bytes: AtomicUsize,
    max_bytes: AtomicUsize,
}

impl BytesMonitor {
    /// Create a monitor with a hard ceiling of `budget_bytes`.
    #[must_use]
    pub fn new(name: impl Into<String>, budget_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            budget_bytes,
            in_use_bytes: AtomicUsize::new(0),
            max_bytes: AtomicUsize::new(0),
        })
    }

    /// Monitor name used in error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes currently reserved.
    pub fn allocated_bytes(&self) -> usize {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    /// High-water mark of reserved bytes.
    pub fn maximum_bytes(&self) -> usize {
        self.max_bytes.load(Ordering::Acquire)
    }

    /// Open an empty account drawing from this monitor.
    #[must_use]
    pub fn make_account(self: &Arc<Self>) -> BoundAccount {
        BoundAccount {
            monitor: Arc::clone(self),
            used: 0,
        }
    }

    fn reserve(&self, requested: usize) -> Result<()> {
        if requested == 0 {
            return Ok(());
        }
        loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let next = current.saturating_add(requested);
            if next > self.budget_bytes {
                return Err(RowflowError::ResourceExhausted {
                    monitor: self.name.clone(),
                    requested,
                    used: current,
                    budget: self.budget_bytes,
                });
            }
            if self
                .in_use_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.max_bytes.fetch_max(next, Ordering::AcqRel);
                return Ok(());
            }
        }
    }

    fn release(&self, bytes: usize) {
        if bytes > 0 {
            self.in_use_bytes.fetch_sub(bytes, Ordering::AcqRel);
        }
    }
}

/// A growable reservation against a [`BytesMonitor`], released on drop.
#[derive(Debug)]
pub struct BoundAccount {
    monitor: Arc<BytesMonitor>,
    used: usize,
}

impl BoundAccount {
    /// Reserve `n` more bytes.
    pub fn grow(&mut self, n: usize) -> Result<()> {
        self.monitor.reserve(n)?;
        self.used += n;
        Ok(())
    }

    /// Release up to `n` bytes.
    pub fn shrink(&mut self, n: usize) {
        let n = n.min(self.used);
        self.monitor.release(n);
        self.used -= n;
    }

    /// Replace the current reservation with exactly `n` bytes.
    ///
    /// On failure the previous reservation is kept.
    pub fn resize(&mut self, n: usize) -> Result<()> {
        if n > self.used {
            self.grow(n - self.used)
        } else {
            self.shrink(self.used - n);
            Ok(())
        }
    }

    /// Release everything held by this account.
    pub fn clear(&mut self) {
        self.shrink(self.used);
    }

    /// Bytes held by this account.
    pub fn used(&self) -> usize {
        self.used
    }
}

impl Drop for BoundAccount {
    fn drop(&mut self) {
        self.clear();
    }
}
