/*
 * Copyright (c) 2022 Yunshan Networks
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

use std::fmt::Write;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::info;
use parking_lot::RwLock;

pub use public::counter::*;

const TICK_CYCLE: Duration = Duration::from_secs(1);

struct Source {
    module: &'static str,
    tags: Vec<(&'static str, String)>,
    countable: Countable,
}

impl Source {
    fn render(&self) -> Option<String> {
        let points = self.countable.get_counters();
        if points.is_empty() {
            return None;
        }
        let mut line = String::new();
        let _ = write!(&mut line, "{}", self.module);
        for (k, v) in self.tags.iter() {
            let _ = write!(&mut line, " {}={}", k, v);
        }
        for (name, _, value) in points {
            match value {
                CounterValue::Signed(v) => {
                    let _ = write!(&mut line, " {}={}", name, v);
                }
                CounterValue::Unsigned(v) => {
                    let _ = write!(&mut line, " {}={}", name, v);
                }
                CounterValue::Float(v) => {
                    let _ = write!(&mut line, " {}={}", name, v);
                }
            }
        }
        Some(line)
    }
}

pub enum StatsOption {
    Tag(&'static str, String),
}

/// Counter source registry. Registered sources are drained every interval
/// and reported through the log; dead sources unregister themselves by
/// reporting closed.
pub struct Collector {
    sources: Arc<RwLock<Vec<Source>>>,
    interval: Duration,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            sources: Arc::new(RwLock::new(vec![])),
            interval: Duration::from_secs(interval_secs.max(1)),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        options: Vec<StatsOption>,
    ) {
        let tags = options
            .into_iter()
            .map(|StatsOption::Tag(k, v)| (k, v))
            .collect();
        self.sources.write().push(Source {
            module,
            tags,
            countable,
        });
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let running = self.running.clone();
        let sources = self.sources.clone();
        let interval = self.interval;
        let thread = thread::Builder::new()
            .name("stats-collector".to_owned())
            .spawn(move || {
                let mut elapsed = Duration::ZERO;
                while running.load(Ordering::Relaxed) {
                    thread::sleep(TICK_CYCLE);
                    elapsed += TICK_CYCLE;
                    if elapsed < interval {
                        continue;
                    }
                    elapsed = Duration::ZERO;

                    let mut sources = sources.write();
                    sources.retain(|s| !s.countable.closed());
                    for source in sources.iter() {
                        if let Some(line) = source.render() {
                            info!("stats {}", line);
                        }
                    }
                }
            })
            .unwrap();
        self.thread.lock().unwrap().replace(thread);
        info!("stats collector started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        info!("stats collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct One;

    impl OwnedCountable for One {
        fn get_counters(&self) -> Vec<Counter> {
            vec![("ones", CounterType::Counted, CounterValue::Unsigned(1))]
        }

        fn closed(&self) -> bool {
            false
        }
    }

    #[test]
    fn render_line() {
        let source = Source {
            module: "analyzer",
            tags: vec![("worker", "3".to_owned())],
            countable: Countable::Owned(Box::new(One)),
        };
        assert_eq!(source.render().unwrap(), "analyzer worker=3 ones=1");
    }
}
