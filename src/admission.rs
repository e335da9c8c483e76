#![forbid(unsafe_code)]

//! Concurrency cap for running downloads.
//!
//! A successful [`AdmissionController::try_admit`] hands out an
//! [`AdmissionSlot`]. The slot gives its unit of capacity back when it is
//! dropped, which happens exactly once no matter which path finishes the job.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<AdmissionInner>,
}

struct AdmissionInner {
    active: Mutex<usize>,
    max_concurrent: usize,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(AdmissionInner {
                active: Mutex::new(0),
                max_concurrent: max_concurrent.max(1),
            }),
        }
    }

    /// Non-blocking. Returns `None` when every slot is taken.
    pub fn try_admit(&self) -> Option<AdmissionSlot> {
        let mut active = self.inner.active.lock();
        if *active >= self.inner.max_concurrent {
            return None;
        }
        *active += 1;
        Some(AdmissionSlot {
            controller: self.clone(),
        })
    }

    pub fn active(&self) -> usize {
        *self.inner.active.lock()
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    fn release(&self) {
        let mut active = self.inner.active.lock();
        debug_assert!(*active > 0, "admission slot released twice");
        *active = active.saturating_sub(1);
    }
}

/// One unit of the concurrency budget, held for the lifetime of a job.
pub struct AdmissionSlot {
    controller: AdmissionController,
}

impl AdmissionSlot {
    /// Explicit release; equivalent to dropping the slot.
    pub fn release(self) {}
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.controller.release();
    }
}

impl std::fmt::Debug for AdmissionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionSlot")
            .field("active", &self.controller.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn rejects_when_full() {
        let admission = AdmissionController::new(2);
        let first = admission.try_admit().unwrap();
        let _second = admission.try_admit().unwrap();
        assert!(admission.try_admit().is_none());
        assert_eq!(admission.active(), 2);

        first.release();
        assert_eq!(admission.active(), 1);
        let third = admission.try_admit();
        assert!(third.is_some());
        assert!(admission.try_admit().is_none());
    }

    #[test]
    fn one_admission_after_each_release() {
        let admission = AdmissionController::new(1);
        let slot = admission.try_admit().unwrap();
        drop(slot);
        let again = admission.try_admit();
        assert!(again.is_some());
        assert!(admission.try_admit().is_none());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let admission = AdmissionController::new(0);
        assert_eq!(admission.max_concurrent(), 1);
        assert!(admission.try_admit().is_some());
    }

    #[test]
    fn concurrent_admissions_never_exceed_cap() {
        let admission = AdmissionController::new(4);
        let peak = Arc::new(Mutex::new(0usize));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let admission = admission.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(slot) = admission.try_admit() {
                            let now = admission.active();
                            assert!(now <= 4);
                            let mut peak = peak.lock();
                            *peak = (*peak).max(now);
                            drop(peak);
                            drop(slot);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(admission.active(), 0);
        assert!(*peak.lock() <= 4);
    }
}
