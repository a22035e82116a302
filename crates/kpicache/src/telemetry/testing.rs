// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Captures formatted `cache.event` records for assertions.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;

#[derive(Debug, Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formatted records, one per line.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buffer.lock()).lines().map(str::to_owned).collect()
    }

    /// Records mentioning `key`.
    pub fn lines_for(&self, key: &str) -> Vec<String> {
        self.lines().into_iter().filter(|line| line.contains(key)).collect()
    }

    pub fn assert_contains(&self, expected: &str) {
        let lines = self.lines();
        assert!(
            lines.iter().any(|line| line.contains(expected)),
            "no record contains {expected:?}:\n{}",
            lines.join("\n")
        );
    }

    /// A subscriber writing plain text into this capture; install with `set_default`.
    pub fn subscriber(&self) -> impl tracing::Subscriber {
        tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_writer(self.clone())
                .with_ansi(false)
                .with_target(false),
        )
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter(Arc::clone(&self.buffer))
    }
}

pub(crate) struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
