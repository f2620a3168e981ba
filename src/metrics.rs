use std::sync::atomic::{AtomicU64, Ordering};

use crate::extraction::PageState;
use crate::processing::DocumentStatus;

/// Thread-safe counters describing extraction activity.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    documents_processed: AtomicU64,
    documents_partial: AtomicU64,
    documents_failed: AtomicU64,
    pages_native: AtomicU64,
    pages_ocr: AtomicU64,
    pages_failed: AtomicU64,
    chunks_embedded: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one page's terminal state.
    pub fn record_page(&self, state: PageState) {
        let counter = match state {
            PageState::NativeAccepted => &self.pages_native,
            PageState::OcrAccepted => &self.pages_ocr,
            PageState::OcrFailed => &self.pages_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished document and the number of chunks embedded for it.
    pub fn record_document(&self, status: DocumentStatus, chunk_count: u64) {
        self.documents_processed.fetch_add(1, Ordering::Relaxed);
        match status {
            DocumentStatus::Complete => {}
            DocumentStatus::Partial => {
                self.documents_partial.fetch_add(1, Ordering::Relaxed);
            }
            DocumentStatus::Failed => {
                self.documents_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.chunks_embedded.fetch_add(chunk_count, Ordering::Relaxed);
    }

    /// Record a document rejected with a terminal error.
    pub fn record_failure(&self) {
        self.record_document(DocumentStatus::Failed, 0);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_processed: self.documents_processed.load(Ordering::Relaxed),
            documents_partial: self.documents_partial.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            pages_native: self.pages_native.load(Ordering::Relaxed),
            pages_ocr: self.pages_ocr.load(Ordering::Relaxed),
            pages_failed: self.pages_failed.load(Ordering::Relaxed),
            chunks_embedded: self.chunks_embedded.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Documents that reached a result or a terminal error since startup.
    pub documents_processed: u64,
    /// Documents returned with status `partial`.
    pub documents_partial: u64,
    /// Documents rejected or failed.
    pub documents_failed: u64,
    /// Pages accepted from the native text layer.
    pub pages_native: u64,
    /// Pages recognized by OCR.
    pub pages_ocr: u64,
    /// Pages whose OCR failed.
    pub pages_failed: u64,
    /// Chunks embedded across all documents.
    pub chunks_embedded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_documents_and_chunks() {
        let metrics = PipelineMetrics::new();
        metrics.record_document(DocumentStatus::Complete, 2);
        metrics.record_document(DocumentStatus::Partial, 3);
        metrics.record_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.documents_processed, 3);
        assert_eq!(snapshot.documents_partial, 1);
        assert_eq!(snapshot.documents_failed, 1);
        assert_eq!(snapshot.chunks_embedded, 5);
    }

    #[test]
    fn records_pages_by_state() {
        let metrics = PipelineMetrics::new();
        metrics.record_page(PageState::NativeAccepted);
        metrics.record_page(PageState::OcrAccepted);
        metrics.record_page(PageState::OcrAccepted);
        metrics.record_page(PageState::OcrFailed);

        let snapshot = metrics.snapshot();
        assert_eq!(
            (snapshot.pages_native, snapshot.pages_ocr, snapshot.pages_failed),
            (1, 2, 1)
        );
    }

    #[test]
    fn snapshot_starts_empty() {
        assert_eq!(PipelineMetrics::new().snapshot(), MetricsSnapshot::default());
    }
}
