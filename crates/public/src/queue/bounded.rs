/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Condvar, Mutex,
};
use std::time::{Duration, Instant};

use super::Error;
use crate::counter as stats;

/// What to do with new entries when the queue is full. Stale entries are
/// usually the less useful ones, so overwriting the head is the default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropPolicy {
    DropOldest,
    DropNewest,
}

impl Default for DropPolicy {
    fn default() -> Self {
        DropPolicy::DropOldest
    }
}

pub fn bounded<T>(size: usize) -> (Sender<T>, Receiver<T>, StatsHandle<T>) {
    bounded_with_policy(size, DropPolicy::DropOldest)
}

pub fn bounded_with_policy<T>(
    size: usize,
    policy: DropPolicy,
) -> (Sender<T>, Receiver<T>, StatsHandle<T>) {
    let inner = Arc::new(Inner {
        size: size.max(1),
        policy,
        state: Mutex::new(State {
            buffer: VecDeque::with_capacity(size.max(1)),
            terminated: false,
        }),
        notify: Condvar::new(),
        senders: AtomicUsize::new(1),
        counter: QueueCounter::default(),
    });
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver {
            inner: inner.clone(),
        },
        StatsHandle { inner },
    )
}

#[derive(Debug, Default)]
struct QueueCounter {
    input: AtomicU64,
    output: AtomicU64,
    dropped: AtomicU64,
}

struct State<T> {
    buffer: VecDeque<T>,
    terminated: bool,
}

struct Inner<T> {
    size: usize,
    policy: DropPolicy,
    state: Mutex<State<T>>,
    notify: Condvar,
    senders: AtomicUsize,
    counter: QueueCounter,
}

impl<T> Inner<T> {
    fn push(&self, state: &mut State<T>, msg: T) {
        if state.buffer.len() >= self.size {
            self.counter.dropped.fetch_add(1, Ordering::Relaxed);
            match self.policy {
                DropPolicy::DropOldest => {
                    state.buffer.pop_front();
                }
                DropPolicy::DropNewest => return,
            }
        }
        state.buffer.push_back(msg);
        self.counter.input.fetch_add(1, Ordering::Relaxed);
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.terminated = true;
        self.notify.notify_all();
    }

    fn terminated(&self) -> bool {
        self.state.lock().unwrap().terminated
    }
}

pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    pub fn terminated(&self) -> bool {
        self.inner.terminated()
    }

    pub fn send(&self, msg: T) -> Result<(), Error<T>> {
        let mut state = self.inner.state.lock().unwrap();
        if state.terminated {
            return Err(Error::Terminated(Some(msg), None));
        }
        self.inner.push(&mut state, msg);
        drop(state);
        self.inner.notify.notify_one();
        Ok(())
    }

    // This method clears the Vec on success, and leaves it as is on failure
    pub fn send_all(&self, msgs: &mut Vec<T>) -> Result<(), Error<T>> {
        if msgs.len() > self.inner.size {
            return Err(Error::BatchTooLarge(None));
        }
        let mut state = self.inner.state.lock().unwrap();
        if state.terminated {
            return Err(Error::Terminated(None, None));
        }
        for msg in msgs.drain(..) {
            self.inner.push(&mut state, msg);
        }
        drop(state);
        self.inner.notify.notify_one();
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.senders.fetch_add(1, Ordering::Relaxed);
        Sender {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // receivers drain what is buffered, then see Terminated
        if self.inner.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.close();
        }
    }
}

pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Receiver<T> {
    pub fn terminated(&self) -> bool {
        self.inner.terminated()
    }

    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, Error<T>> {
        let mut state = self.wait_nonempty(timeout)?;
        let msg = state.buffer.pop_front().unwrap();
        self.inner.counter.output.fetch_add(1, Ordering::Relaxed);
        Ok(msg)
    }

    // Clears anything in msgs, and receives at most msgs.capacity() messages
    pub fn recv_all(&self, msgs: &mut Vec<T>, timeout: Option<Duration>) -> Result<(), Error<T>> {
        msgs.clear();
        let max_recv = msgs.capacity().max(1);
        let mut state = self.wait_nonempty(timeout)?;
        while msgs.len() < max_recv {
            match state.buffer.pop_front() {
                Some(msg) => msgs.push(msg),
                None => break,
            }
        }
        self.inner
            .counter
            .output
            .fetch_add(msgs.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn wait_nonempty(
        &self,
        timeout: Option<Duration>,
    ) -> Result<std::sync::MutexGuard<'_, State<T>>, Error<T>> {
        let mut state = self.inner.state.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        while state.buffer.is_empty() {
            if state.terminated {
                return Err(Error::Terminated(None, None));
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    let (guard, result) = self
                        .inner
                        .notify
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    if result.timed_out() && guard.buffer.is_empty() {
                        if guard.terminated {
                            return Err(Error::Terminated(None, None));
                        }
                        return Err(Error::Timeout);
                    }
                    guard
                }
                None => self.inner.notify.wait(state).unwrap(),
            };
        }
        Ok(state)
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<T> Iterator for Receiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv(None).ok()
    }
}

pub struct StatsHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send> stats::OwnedCountable for StatsHandle<T> {
    fn get_counters(&self) -> Vec<stats::Counter> {
        let pending = self.inner.state.lock().unwrap().buffer.len();
        vec![
            (
                "in",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.inner.counter.input.swap(0, Ordering::Relaxed)),
            ),
            (
                "out",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.inner.counter.output.swap(0, Ordering::Relaxed)),
            ),
            (
                "dropped",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(
                    self.inner.counter.dropped.swap(0, Ordering::Relaxed),
                ),
            ),
            (
                "pending",
                stats::CounterType::Gauged,
                stats::CounterValue::Unsigned(pending as u64),
            ),
        ]
    }

    fn closed(&self) -> bool {
        self.inner.terminated()
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::thread;

    use super::*;

    #[test]
    fn send_receive() {
        let (s, r, _) = bounded(4);
        let h = thread::spawn(move || {
            let v: u64 = r.recv(None).unwrap();
            assert_eq!(v, 42);
        });
        s.send(42u64).unwrap();
        h.join().unwrap();
    }

    #[test]
    fn drop_oldest_on_full() {
        let (s, r, _) = bounded(2);
        s.send(1).unwrap();
        s.send(2).unwrap();
        s.send(3).unwrap();
        assert_eq!(r.recv(None).unwrap(), 2);
        assert_eq!(r.recv(None).unwrap(), 3);
    }

    #[test]
    fn drop_newest_on_full() {
        let (s, r, _) = bounded_with_policy(2, DropPolicy::DropNewest);
        s.send(1).unwrap();
        s.send(2).unwrap();
        s.send(3).unwrap();
        assert_eq!(r.recv(None).unwrap(), 1);
        assert_eq!(r.recv(None).unwrap(), 2);
    }

    #[test]
    fn batch_send_and_receive() {
        let (s, r, _) = bounded(8);
        s.send_all(&mut vec![1, 2, 3]).unwrap();
        s.send(4).unwrap();
        let mut out = Vec::with_capacity(8);
        r.recv_all(&mut out, None).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn multiple_senders_drain_to_terminated() {
        let (s, r, _) = bounded(64);
        for _ in 0..4 {
            let sender = s.clone();
            thread::spawn(move || {
                for j in 1..=10u64 {
                    sender.send(j).unwrap();
                }
            });
        }
        mem::drop(s);
        let sum: u64 = r.sum();
        assert_eq!(sum, 220);
    }

    #[test]
    fn timeout_then_terminated() {
        let (s, r, _) = bounded(2);
        let e: Error<u64> = r.recv(Some(Duration::from_millis(10))).err().unwrap();
        assert_eq!(e, Error::Timeout);
        s.send(7).unwrap();
        assert_eq!(r.recv(Some(Duration::from_millis(10))).unwrap(), 7);
        mem::drop(s);
        let e: Error<u64> = r.recv(Some(Duration::from_millis(10))).err().unwrap();
        assert_eq!(e, Error::Terminated(None, None));
    }
}
