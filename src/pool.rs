// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Bounded fan-out for per-host I/O.

use std::{future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinSet};

/// The default number of hosts operated on concurrently.
pub const DEFAULT_MAX_PARALLELISM: usize = 16;

/// Run one future per item, at most `max_parallelism` at a time, and wait for all of them.
///
/// Results are returned in the same order as `items`, regardless of completion order. A task that
/// panics is re-raised on the caller.
pub async fn run_bounded<I, T, F, Fut, R>(items: I, max_parallelism: usize, f: F) -> Vec<R>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_parallelism.max(1)));
    let mut set = JoinSet::new();
    let mut len = 0;

    for (index, item) in items.into_iter().enumerate() {
        let fut = f(item);
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            // Hold onto the permit until the task finishes.
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("we never close the semaphore");
            (index, fut.await)
        });
        len += 1;
    }

    let mut slots: Vec<Option<R>> = (0..len).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, output)) => slots[index] = Some(output),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => panic!("per-host task failed to complete: {e}"),
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.expect("every spawned task reports exactly once"))
        .collect()
}
