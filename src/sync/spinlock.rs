//! Spinlock with interrupt masking.
//!
//! Wraps [`spin::Mutex`] and clears IF for as long as the guard lives, so a
//! trap handler can never observe (or deadlock on) a half-finished update.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use crate::arch::{self, Cpu};

pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let platform = arch::platform();
        let interrupts_were_enabled = platform.is_some_and(|cpu| cpu.interrupts_enabled());
        if let Some(cpu) = platform {
            cpu.disable_interrupts();
        }

        SpinLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            interrupts_were_enabled,
        }
    }

    /// Returns whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

pub struct SpinLockGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    interrupts_were_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before IF comes back on.
        // SAFETY:
        // - `guard` is dropped exactly once, here, and never touched afterwards.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        if self.interrupts_were_enabled {
            if let Some(cpu) = arch::platform() {
                cpu.enable_interrupts();
            }
        }
    }
}
