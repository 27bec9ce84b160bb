//! Task units: the user-supplied asynchronous work applied to each item.

use async_trait::async_trait;
use flowgate_shared::errors::BoxError;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;

/// What a task unit produced for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<O> {
    /// Forward this result downstream.
    Emit(O),
    /// Forward nothing for this item. In ordered delivery the item's slot in
    /// the sequence is still consumed.
    Skip,
}

impl<O> TaskOutcome<O> {
    pub fn into_option(self) -> Option<O> {
        match self {
            Self::Emit(value) => Some(value),
            Self::Skip => None,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }
}

impl<O> From<Option<O>> for TaskOutcome<O> {
    fn from(value: Option<O>) -> Self {
        value.map_or(Self::Skip, Self::Emit)
    }
}

/// Trait for work that a parallel stage runs once per item.
///
/// Implement this for task types that carry their own state; for plain
/// async closures use [`FnTask`].
#[async_trait]
pub trait TaskUnit<I: Send + 'static>: Send + Sync {
    type Output: Send + 'static;

    /// Process one item.
    async fn run(&self, item: I) -> Result<TaskOutcome<Self::Output>, BoxError>;

    /// Human-readable task name for logging and errors.
    fn name(&self) -> &str;
}

/// A [`TaskUnit`] backed by an async closure.
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F> FnTask<F> {
    /// Wrap a closure that already returns a [`TaskOutcome`].
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

type UnitFuture<O> = BoxFuture<'static, Result<TaskOutcome<O>, BoxError>>;

impl FnTask<()> {
    /// Task that emits one result per item.
    pub fn map<I, O, E, Fut, G>(
        name: impl Into<String>,
        g: G,
    ) -> FnTask<impl Fn(I) -> UnitFuture<O> + Send + Sync>
    where
        G: Fn(I) -> Fut + Send + Sync,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        E: Into<BoxError>,
        O: Send + 'static,
    {
        FnTask::new(name, move |item| {
            g(item)
                .map(|result| result.map(TaskOutcome::Emit).map_err(Into::into))
                .boxed()
        })
    }

    /// Task that may skip items by returning `Ok(None)`.
    pub fn filter_map<I, O, E, Fut, G>(
        name: impl Into<String>,
        g: G,
    ) -> FnTask<impl Fn(I) -> UnitFuture<O> + Send + Sync>
    where
        G: Fn(I) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Option<O>, E>> + Send + 'static,
        E: Into<BoxError>,
        O: Send + 'static,
    {
        FnTask::new(name, move |item| {
            g(item)
                .map(|result| result.map(TaskOutcome::from).map_err(Into::into))
                .boxed()
        })
    }
}

#[async_trait]
impl<I, O, F, Fut> TaskUnit<I> for FnTask<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskOutcome<O>, BoxError>> + Send + 'static,
{
    type Output = O;

    async fn run(&self, item: I) -> Result<TaskOutcome<O>, BoxError> {
        (self.f)(item).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_map_emits_every_item() {
        let task = FnTask::map("double", |x: u32| async move { Ok::<_, BoxError>(x * 2) });

        assert_eq!(task.name(), "double");
        assert_eq!(task.run(21).await.unwrap(), TaskOutcome::Emit(42));
    }

    #[tokio::test]
    async fn test_filter_map_skips_none() {
        let task = FnTask::filter_map("evens", |x: u32| async move {
            Ok::<_, BoxError>((x % 2 == 0).then_some(x))
        });

        assert_eq!(task.run(4).await.unwrap(), TaskOutcome::Emit(4));
        assert!(task.run(3).await.unwrap().is_skip());
    }

    #[tokio::test]
    async fn test_error_is_boxed() {
        let task = FnTask::map("fails", |_: u32| async move {
            Err::<u32, _>(std::io::Error::other("disk on fire"))
        });

        let err = task.run(1).await.unwrap_err();
        assert_eq!(err.to_string(), "disk on fire");
    }
}
