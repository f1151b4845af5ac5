//! Accumulation of relocation errors. A bad relocation stops neither the current pass nor the
//! scanning of other objects; diagnostics pile up here and the driver refuses to produce output
//! if any were recorded.

use crate::error::Error;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

#[derive(Debug, Default)]
pub struct DiagnosticSink {
    errors: Mutex<Vec<Error>>,
    count: AtomicUsize,
}

impl DiagnosticSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_error(&self, error: Error) {
        tracing::error!(%error);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.errors.lock().unwrap().push(error);
    }

    /// The count is atomic so that hot paths can check it without taking the lock.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    #[must_use]
    pub fn take_errors(&self) -> Vec<Error> {
        std::mem::take(&mut self.errors.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn errors_accumulate() {
        let sink = DiagnosticSink::new();
        assert!(!sink.has_errors());
        sink.report_error(anyhow!("first"));
        sink.report_error(anyhow!("second"));
        assert_eq!(sink.error_count(), 2);
        let errors = sink.take_errors();
        assert_eq!(errors.len(), 2);
        // The count deliberately survives draining: it records that the link must fail.
        assert!(sink.has_errors());
    }
}
