/*
Copyright 2025 The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::cell::RefCell;
use std::sync::Once;

use log::{set_logger, set_max_level, Level, LevelFilter, Log, Metadata, Record};

/// A `log` logger that keeps what each thread logs, so tests running in
/// parallel only see their own records
pub static LOGGER: Logger = Logger {};
static INITLOGGER: Once = Once::new();

/// One captured log record
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogCall {
    pub level: Level,
    pub args: String,
    pub target: String,
    pub line: Option<u32>,
    pub file: Option<String>,
    pub module_path: Option<String>,
}

thread_local!(
    static LOGCALLS: RefCell<Vec<LogCall>> = const { RefCell::new(Vec::<LogCall>::new()) };
    static LOGGER_MAX_LEVEL: RefCell<LevelFilter> = const { RefCell::new(LevelFilter::Off) };
);

pub struct Logger {}

impl Logger {
    /// Install [`LOGGER`] as the process wide logger. Safe to call from
    /// every test, only the first call does anything.
    ///
    /// Nothing is captured on a thread until [`Logger::set_max_level`] is
    /// called on it.
    ///
    /// # Example
    ///
    /// ```
    /// use hyperlight_testing::logger::{Logger, LOGGER};
    ///
    /// Logger::initialize_test_logger();
    /// LOGGER.set_max_level(log::LevelFilter::Warn);
    /// LOGGER.clear_log_calls();
    ///
    /// log::info!("not captured");
    /// log::error!("captured");
    ///
    /// assert_eq!(LOGGER.num_log_calls(), 1);
    /// assert_eq!(LOGGER.get_log_call(0).unwrap().args, "captured");
    /// ```
    pub fn initialize_test_logger() {
        INITLOGGER.call_once(|| {
            set_logger(&LOGGER).unwrap();
            set_max_level(log::LevelFilter::Trace);
        });
    }

    /// The number of records captured on this thread since the last clear
    pub fn num_log_calls(&self) -> usize {
        LOGCALLS.with(|log_calls| log_calls.borrow().len())
    }

    pub fn get_log_call(&self, idx: usize) -> Option<LogCall> {
        LOGCALLS.with(|log_calls| log_calls.borrow().get(idx).cloned())
    }

    pub fn clear_log_calls(&self) {
        LOGCALLS.with(|log_calls| log_calls.borrow_mut().clear());
    }

    /// Hand the records captured on this thread to `f`, then clear them
    pub fn test_log_records<F: Fn(&Vec<LogCall>)>(&self, f: F) {
        LOGCALLS.with(|log_calls| f(&log_calls.borrow()));
        self.clear_log_calls();
    }

    /// Capture records at `level` and above on this thread
    pub fn set_max_level(&self, level: LevelFilter) {
        LOGGER_MAX_LEVEL.with(|max_level| {
            *max_level.borrow_mut() = level;
        });
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        LOGGER_MAX_LEVEL.with(|max_level| metadata.level() <= *max_level.borrow())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        LOGCALLS.with(|log_calls| {
            log_calls.borrow_mut().push(LogCall {
                level: record.level(),
                args: format!("{}", record.args()),
                target: record.target().to_string(),
                line: record.line(),
                file: record.file().map(|file| file.to_string()),
                module_path: record.module_path().map(|path| path.to_string()),
            })
        });
    }

    fn flush(&self) {}
}
