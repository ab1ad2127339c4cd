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

pub mod connection;
pub mod enums;
pub mod event;
pub mod l7_protocol_info;
pub mod l7_protocol_log;

pub use connection::ConnectionKey;
pub use event::SocketEvent;

// identification gives up after this many inconclusive rounds per connection
pub const L7_PROTOCOL_INFERENCE_MAX_FAIL_COUNT: usize = 5;
// seconds before a cached port inference expires
pub const L7_PROTOCOL_INFERENCE_TTL: u64 = 60;
