use std::future::Future;

use futures::future::{try_join_all, BoxFuture};

use super::step::StepError;

/// A group of concurrent sub-calls inside a single step.
///
/// The group commits as a unit: [`join`](Self::join) returns every result in
/// insertion order, or the first error, in which case the remaining sub-calls
/// are dropped. Because a step only memoizes on success, a partially
/// successful fan-out never produces a memoized result.
///
/// ```ignore
/// let pages = ctx.run_step("scrape-urls", move || async move {
///     let group: ParallelGroup<_> = urls.iter().map(|u| scraper.scrape(u)).collect();
///     group.join().await
/// }).await?;
/// ```
pub struct ParallelGroup<'a, T> {
    tasks: Vec<BoxFuture<'a, Result<T, StepError>>>,
}

impl<'a, T: Send + 'a> ParallelGroup<'a, T> {
    /// Create an empty group.
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Add a sub-call.
    pub fn push<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T, StepError>> + Send + 'a,
    {
        self.tasks.push(Box::pin(task));
    }

    /// Add a sub-call, builder style.
    pub fn with<F>(mut self, task: F) -> Self
    where
        F: Future<Output = Result<T, StepError>> + Send + 'a,
    {
        self.push(task);
        self
    }

    /// Get the number of sub-calls.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the group is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every sub-call concurrently; all-or-nothing.
    pub async fn join(self) -> Result<Vec<T>, StepError> {
        tracing::debug!(tasks = self.tasks.len(), "Joining parallel group");
        try_join_all(self.tasks).await
    }
}

impl<'a, T: Send + 'a> Default for ParallelGroup<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T, F> FromIterator<F> for ParallelGroup<'a, T>
where
    T: Send + 'a,
    F: Future<Output = Result<T, StepError>> + Send + 'a,
{
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        let mut group = Self::new();
        for task in iter {
            group.push(task);
        }
        group
    }
}
