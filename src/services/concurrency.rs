use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::{AppError, AppResult};

/// Maps an async transform over a list with at most `limit` transforms in flight
///
/// Results come back in input order regardless of completion order. A new
/// input is admitted as soon as any running transform finishes. The first
/// failure stops admission and is returned; transforms still running are
/// dropped and their outcomes discarded.
#[derive(Debug, Clone, Copy)]
pub struct BoundedConcurrencyMapper {
    limit: usize,
}

impl BoundedConcurrencyMapper {
    pub fn new(limit: usize) -> AppResult<Self> {
        if limit == 0 {
            return Err(AppError::ConcurrencyBudgetExceeded(limit));
        }
        Ok(Self { limit })
    }

    pub async fn map<I, T, F, Fut>(&self, inputs: Vec<I>, mut transform: F) -> AppResult<Vec<T>>
    where
        F: FnMut(I) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let total = inputs.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut pending = inputs.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();

        let mut admit = |index: usize, input: I| {
            let future = transform(input);
            async move { (index, future.await) }
        };

        for (index, input) in pending.by_ref().take(self.limit) {
            in_flight.push(admit(index, input));
        }

        while let Some((index, result)) = in_flight.next().await {
            match result {
                Ok(value) => results[index] = Some(value),
                Err(e) => {
                    tracing::debug!(
                        index = index,
                        abandoned = in_flight.len(),
                        error = %e,
                        "Bounded map aborted on first failure"
                    );
                    return Err(e);
                }
            }

            if let Some((index, input)) = pending.next() {
                in_flight.push(admit(index, input));
            }
        }

        results
            .into_iter()
            .collect::<Option<Vec<T>>>()
            .ok_or_else(|| AppError::Internal("Bounded map lost a result".to_string()))
    }
}
