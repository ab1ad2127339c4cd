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

use std::time::Duration;

use thiserror::Error;

use crate::common::event::SocketEvent;

use public::queue::{self, Receiver, Sender};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe init failed: {0}")]
    InitFailed(String),
    #[error("subscribe {0}/{1} failed")]
    SubscribeFailed(String, String),
    #[error("probe terminated")]
    Terminated,
}

/// The kernel probe boundary. The native side streams raw syscall events;
/// the analyzer only depends on this seam. Bridge failures are fatal to
/// the process, unlike anything inside the analyzer.
pub trait ProbeBridge: Send {
    fn init_probe(&mut self) -> Result<(), ProbeError>;
    fn subscribe(&mut self, event_name: &str, category: &str) -> Result<(), ProbeError>;
    // blocks until an event arrives, None on shutdown
    fn next_event(&mut self) -> Option<SocketEvent>;
}

/// Queue backed bridge, used by tests and by replay tooling that feeds
/// captured events in from user space.
pub struct QueueBridge {
    receiver: Receiver<SocketEvent>,
    recv_timeout: Duration,
}

impl QueueBridge {
    pub fn bounded(size: usize) -> (Sender<SocketEvent>, Self) {
        let (sender, receiver, _) = queue::bounded(size);
        (
            sender,
            Self {
                receiver,
                recv_timeout: Duration::from_secs(1),
            },
        )
    }
}

impl ProbeBridge for QueueBridge {
    fn init_probe(&mut self) -> Result<(), ProbeError> {
        Ok(())
    }

    fn subscribe(&mut self, _event_name: &str, _category: &str) -> Result<(), ProbeError> {
        Ok(())
    }

    fn next_event(&mut self) -> Option<SocketEvent> {
        loop {
            match self.receiver.recv(Some(self.recv_timeout)) {
                Ok(event) => return Some(event),
                Err(queue::Error::Timeout) => continue,
                Err(_) => return None,
            }
        }
    }
}
