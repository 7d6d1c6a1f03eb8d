use crate::error::SourceError;
use crate::events::Sample;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

pub type SourceFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<Sample>, SourceError>> + Send + 'a>>;

/// Anything that can be asked for the current metric readings
pub trait MetricSource: Send + Sync {
    fn pull(&self) -> SourceFuture<'_>;

    fn name(&self) -> &str;
}

/// Source replaying a fixed script of pull results
///
/// Once the script runs out every pull returns no samples.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<Sample>, SourceError>>>,
    pulls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<Vec<Sample>, SourceError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            pulls: AtomicUsize::new(0),
        }
    }

    /// One successful pull per sample
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self::new(samples.into_iter().map(|s| Ok(vec![s])).collect())
    }

    pub fn push(&self, result: Result<Vec<Sample>, SourceError>) {
        lock(&self.script).push_back(result);
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }
}

impl MetricSource for ScriptedSource {
    fn pull(&self) -> SourceFuture<'_> {
        Box::pin(async move {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            lock(&self.script).pop_front().unwrap_or_else(|| Ok(Vec::new()))
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
