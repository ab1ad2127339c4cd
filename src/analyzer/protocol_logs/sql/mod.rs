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

mod mysql;
mod redis;

pub use mysql::{MysqlHeader, MysqlInfo, MysqlLog};
pub use redis::{RedisInfo, RedisLog};

const SQL_KEYWORDS: [&str; 20] = [
    "SELECT", "INSERT", "UPDATE", "DELETE", "SHOW", "CREATE", "DROP", "ALTER", "SET", "BEGIN",
    "COMMIT", "ROLLBACK", "USE", "DESC", "DESCRIBE", "EXPLAIN", "WITH", "REPLACE", "TRUNCATE",
    "GRANT",
];

// first word looks like the start of a statement
pub(super) fn is_valid_sql(payload: &[u8]) -> bool {
    let mut start = 0;
    while start < payload.len() && payload[start].is_ascii_whitespace() {
        start += 1;
    }
    let end = payload[start..]
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .map(|p| start + p)
        .unwrap_or(payload.len());
    let Ok(word) = std::str::from_utf8(&payload[start..end]) else {
        return false;
    };
    let word = word.to_ascii_uppercase();
    SQL_KEYWORDS.iter().any(|kw| *kw == word.as_str())
}
