/* Copyright (C) 2022 Antmicro
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     https://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

/* Leveled debug logging for the packing core.
 *
 * `dbg_log!(level, fmt, args...)` writes to stderr when the level is within
 * the verbosity read once from CLBPACK_DBG_LOG_LEVEL (0 = critical only).
 * Messages are prefixed with the emitting module so a packing trace can be
 * filtered per subsystem. The whole thing compiles out of release builds.
 */

pub const DBG_CRITICAL: usize = 0;
pub const DBG_WARN: usize = 1;
pub const DBG_INFO: usize = 2;
pub const DBG_EXTRA1: usize = 3;
pub const DBG_EXTRA2: usize = 4;

lazy_static! {
    pub static ref DBG_LOG_LEVEL: usize = std::env::var("CLBPACK_DBG_LOG_LEVEL")
        .ok()
        .and_then(|lvl| lvl.parse().ok())
        .unwrap_or(0);
}

pub fn level_tag(level: usize) -> &'static str {
    match level {
        DBG_CRITICAL => "critical",
        DBG_WARN => "warning",
        DBG_INFO => "info",
        _ => "debug",
    }
}

#[cfg(debug_assertions)]
macro_rules! dbg_log {
    ($lvl:expr, $fmt:literal $(, $v:expr )*) => {
        if *crate::log::DBG_LOG_LEVEL >= $lvl {
            eprintln!(
                concat!("[{}] {}: ", $fmt),
                module_path!(),
                crate::log::level_tag($lvl)
                $(, &$v )*
            );
        }
    };
}

#[cfg(not(debug_assertions))]
macro_rules! dbg_log {
    ($lvl:expr, $fmt:literal $(, $v:expr )*) => {};
}
