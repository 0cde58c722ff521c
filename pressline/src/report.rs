//! The write-only publish report.
//!
//! The engine wraps a caller-supplied sink in a tee: every line is written to
//! an internal durable buffer and forwarded to the external sink when one is
//! present. Failures of the external sink are captured into the internal
//! buffer instead of propagating, guarded against recursive double-writing.

use std::sync::{Arc, Mutex};

use thiserror::Error;

/// An error writing to an external report sink.
#[derive(Debug, Error)]
#[error("failed to write to report sink: {0}")]
pub struct ReportError(pub String);

/// A write-only progress stream for one publish job.
///
/// Implementations receive structured progress lines, warnings and errors in
/// the order the engine and content store produce them.
pub trait ReportSink: Send {
    fn print(&mut self, line: &str) -> Result<(), ReportError>;
    fn warn(&mut self, line: &str) -> Result<(), ReportError>;
    fn error(&mut self, line: &str) -> Result<(), ReportError>;
    fn flush(&mut self) -> Result<(), ReportError> {
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    fn prefix(self) -> &'static str {
        match self {
            Self::Info => "",
            Self::Warning => "WARNING: ",
            Self::Error => "ERROR: ",
        }
    }
}

/// Tee writer backing a job's report.
///
/// Owns the durable copy of the report and optionally forwards every write to
/// the caller's sink.
struct TeeReport {
    external: Option<Box<dyn ReportSink>>,
    buffer: String,
    warnings: usize,
    errors: usize,
    // Re-entrancy guard: set while forwarding so a sink failure noted in the
    // buffer cannot trigger another forward.
    forwarding: bool,
}

impl TeeReport {
    fn new(external: Option<Box<dyn ReportSink>>) -> Self {
        Self {
            external,
            buffer: String::new(),
            warnings: 0,
            errors: 0,
            forwarding: false,
        }
    }

    fn write(&mut self, severity: Severity, line: &str) {
        self.buffer.push_str(severity.prefix());
        self.buffer.push_str(line);
        self.buffer.push('\n');
        match severity {
            Severity::Warning => self.warnings += 1,
            Severity::Error => self.errors += 1,
            Severity::Info => {}
        }
        self.forward(|sink| match severity {
            Severity::Info => sink.print(line),
            Severity::Warning => sink.warn(line),
            Severity::Error => sink.error(line),
        });
    }

    fn flush(&mut self) {
        self.forward(|sink| sink.flush());
    }

    fn forward(
        &mut self,
        write: impl FnOnce(&mut Box<dyn ReportSink>) -> Result<(), ReportError>,
    ) {
        if self.forwarding {
            return;
        }
        self.forwarding = true;
        let result = match self.external.as_mut() {
            Some(sink) => write(sink),
            None => Ok(()),
        };
        if let Err(err) = result {
            tracing::warn!(%err, "external report sink failed");
            self.buffer
                .push_str(&format!("(external report sink failed: {err})\n"));
        }
        self.forwarding = false;
    }
}

/// Handle to a job's report, shared between the engine, the worker and the
/// content store.
#[derive(Clone)]
pub struct SharedReport(Arc<Mutex<TeeReport>>);

impl SharedReport {
    /// Creates a report, optionally teeing every write into the given
    /// external sink.
    pub fn new(external: Option<Box<dyn ReportSink>>) -> Self {
        Self(Arc::new(Mutex::new(TeeReport::new(external))))
    }

    pub fn print(&self, line: &str) {
        self.0.lock().unwrap().write(Severity::Info, line);
    }

    pub fn warn(&self, line: &str) {
        self.0.lock().unwrap().write(Severity::Warning, line);
    }

    pub fn error(&self, line: &str) {
        self.0.lock().unwrap().write(Severity::Error, line);
    }

    pub fn flush(&self) {
        self.0.lock().unwrap().flush();
    }

    pub fn warnings(&self) -> usize {
        self.0.lock().unwrap().warnings
    }

    pub fn errors(&self) -> usize {
        self.0.lock().unwrap().errors
    }

    /// The durable copy of the report so far.
    pub fn contents(&self) -> String {
        self.0.lock().unwrap().buffer.clone()
    }

    /// The durable copy as bytes, for persistence through the content store.
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().buffer.clone().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records every line it receives; can be scripted to fail.
    struct VecSink {
        lines: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl VecSink {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
            let lines = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    lines: Arc::clone(&lines),
                    fail: false,
                },
                lines,
            )
        }
    }

    impl ReportSink for VecSink {
        fn print(&mut self, line: &str) -> Result<(), ReportError> {
            if self.fail {
                return Err(ReportError("sink closed".to_owned()));
            }
            self.lines.lock().unwrap().push(line.to_owned());
            Ok(())
        }

        fn warn(&mut self, line: &str) -> Result<(), ReportError> {
            self.print(&format!("W {line}"))
        }

        fn error(&mut self, line: &str) -> Result<(), ReportError> {
            self.print(&format!("E {line}"))
        }
    }

    #[test]
    fn writes_go_to_both_sinks() {
        let (sink, lines) = VecSink::new();
        let report = SharedReport::new(Some(Box::new(sink)));
        report.print("publishing /a.txt");
        report.warn("skipping /b.txt");
        report.error("failed /c.txt");

        let lines = lines.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                "publishing /a.txt".to_owned(),
                "W skipping /b.txt".to_owned(),
                "E failed /c.txt".to_owned(),
            ]
        );
        let contents = report.contents();
        assert!(contents.contains("publishing /a.txt"));
        assert!(contents.contains("WARNING: skipping /b.txt"));
        assert!(contents.contains("ERROR: failed /c.txt"));
    }

    #[test]
    fn counts_warnings_and_errors() {
        let report = SharedReport::new(None);
        report.print("one");
        report.warn("two");
        report.error("three");
        report.error("four");
        assert_eq!(report.warnings(), 1);
        assert_eq!(report.errors(), 2);
    }

    #[test]
    fn external_sink_failure_is_captured_once() {
        let (mut sink, lines) = VecSink::new();
        sink.fail = true;
        let report = SharedReport::new(Some(Box::new(sink)));
        report.print("publishing /a.txt");

        // the line still reached the durable buffer, with a single note about
        // the broken sink
        let contents = report.contents();
        assert!(contents.contains("publishing /a.txt"));
        assert_eq!(contents.matches("external report sink failed").count(), 1);
        assert!(lines.lock().unwrap().is_empty());
        // the sink failure is not a publish error
        assert_eq!(report.errors(), 0);
    }

    #[test]
    fn works_without_external_sink() {
        let report = SharedReport::new(None);
        report.print("quiet");
        report.flush();
        assert_eq!(report.contents(), "quiet\n");
        assert_eq!(report.bytes(), b"quiet\n".to_vec());
    }
}
