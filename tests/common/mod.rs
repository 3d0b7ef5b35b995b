//! Shared test helpers: an in-memory connection that records every statement.

#![allow(dead_code)]

use chryso::db::ConnectionPool;
use chryso::{Connection, DriverError, DriverFailure, Engine, RowSet, SqlParam};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Statement log shared by every connection a test engine creates.
#[derive(Default)]
pub struct Recorder {
    /// (connection serial, sql)
    log: Mutex<Vec<(usize, String)>>,
    failures: Mutex<Vec<(String, DriverFailure)>>,
    opened: AtomicUsize,
    close_attempts: AtomicUsize,
    fail_close: Mutex<Vec<usize>>,
}

impl Recorder {
    /// Every statement issued, across all connections, in order.
    pub fn statements(&self) -> Vec<String> {
        self.log.lock().iter().map(|(_, sql)| sql.clone()).collect()
    }

    /// Statements issued on one connection.
    pub fn statements_on(&self, serial: usize) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(s, _)| *s == serial)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }

    /// Make statements starting with `prefix` fail with `failure`.
    pub fn fail_on(&self, prefix: &str, failure: DriverFailure) {
        self.failures.lock().push((prefix.to_string(), failure));
    }

    /// Make closing the connection with this serial fail.
    pub fn fail_close_of(&self, serial: usize) {
        self.fail_close.lock().push(serial);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn close_attempts(&self) -> usize {
        self.close_attempts.load(Ordering::SeqCst)
    }
}

pub struct RecordingConnection {
    serial: usize,
    recorder: Arc<Recorder>,
}

impl RecordingConnection {
    pub fn open(recorder: &Arc<Recorder>) -> Self {
        let serial = recorder.opened.fetch_add(1, Ordering::SeqCst);
        Self {
            serial,
            recorder: Arc::clone(recorder),
        }
    }
}

impl Connection for RecordingConnection {
    fn execute(&self, sql: &str, _params: &[SqlParam]) -> Result<RowSet, DriverError> {
        self.recorder
            .log
            .lock()
            .push((self.serial, sql.to_string()));

        let failure = self
            .recorder
            .failures
            .lock()
            .iter()
            .find(|(prefix, _)| sql.starts_with(prefix.as_str()))
            .map(|(_, failure)| failure.clone());

        match failure {
            Some(failure) => Err(Box::new(failure)),
            None => Ok(RowSet::empty()),
        }
    }

    fn close(&self) -> Result<(), DriverError> {
        self.recorder.close_attempts.fetch_add(1, Ordering::SeqCst);
        if self.recorder.fail_close.lock().contains(&self.serial) {
            return Err(Box::new(DriverFailure::new("close failed")));
        }
        Ok(())
    }
}

pub fn recording_pool() -> (ConnectionPool, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let shared = Arc::clone(&recorder);
    let pool = ConnectionPool::from_fn(move || {
        Ok(Box::new(RecordingConnection::open(&shared)) as Box<dyn Connection>)
    });
    (pool, recorder)
}

pub fn recording_engine() -> (Engine, Arc<Recorder>) {
    let (pool, recorder) = recording_pool();
    (Engine::new(pool), recorder)
}
