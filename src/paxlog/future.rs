// Copyright 2021 The paxlog Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

#[derive(Debug)]
struct ReadSharedState<T> {
    result: Option<T>,
    finished: bool,
    waker: Option<Waker>,
}

/// The pending result of a linearized read.
#[derive(Debug)]
pub struct ReadFuture<T> {
    inner: Arc<Mutex<ReadSharedState<T>>>,
}

/// The completion side of a `ReadFuture`, owned by the group.
#[derive(Debug)]
pub struct ReadPromise<T> {
    inner: Arc<Mutex<ReadSharedState<T>>>,
}

pub fn create_promise<T>() -> (ReadFuture<T>, ReadPromise<T>) {
    let inner = Arc::new(Mutex::new(ReadSharedState {
        result: None,
        finished: false,
        waker: None,
    }));
    let future = ReadFuture {
        inner: inner.clone(),
    };
    let promise = ReadPromise { inner };
    (future, promise)
}

fn lock<T>(inner: &Mutex<ReadSharedState<T>>) -> MutexGuard<'_, ReadSharedState<T>> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T> ReadPromise<T> {
    /// Finish the read, a promise could only be finished once.
    pub fn finish(self, result: T) {
        let mut shared_state = lock(&self.inner);
        debug_assert!(!shared_state.finished);
        shared_state.result = Some(result);
        shared_state.finished = true;
        if let Some(waker) = shared_state.waker.take() {
            waker.wake();
        }
    }
}

impl<T> ReadFuture<T> {
    pub fn is_finished(&self) -> bool {
        lock(&self.inner).finished
    }
}

impl<T> Future for ReadFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared_state = lock(&self.inner);
        match shared_state.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                shared_state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use futures::executor::block_on;

    #[test]
    fn finish_before_poll() {
        let (future, promise) = create_promise();
        assert!(!future.is_finished());
        promise.finish(3u64);
        assert!(future.is_finished());
        assert_eq!(block_on(future), 3);
    }

    #[test]
    fn finish_from_other_thread() {
        let (future, promise) = create_promise::<String>();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            promise.finish("done".to_owned());
        });
        assert_eq!(block_on(future), "done");
        handle.join().unwrap();
    }
}
