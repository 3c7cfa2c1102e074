use dashmap::DashSet;
use std::sync::Arc;

// ────────────────────────────────────────────────────────────────
// ProcessingGuard - Prevents duplicate processing of the same job id
// ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct InProgress(Arc<DashSet<String>>);

pub struct ProcessingGuard {
    set: Arc<DashSet<String>>,
    job_id: String,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.set.remove(&self.job_id);
    }
}

impl InProgress {
    pub fn try_acquire(&self, job_id: impl AsRef<str>) -> Option<ProcessingGuard> {
        let job_id = job_id.as_ref().to_string();
        if self.0.insert(job_id.clone()) {
            Some(ProcessingGuard {
                set: self.0.clone(),
                job_id,
            })
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
