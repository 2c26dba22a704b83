use std::fs;
use std::path::{Path, PathBuf};

use confab_core::{DocumentSink, Error};

/// File-backed document sink. The file is held in memory as lines and
/// written back after every mutation, so a crash mid-conversation never
/// loses text that already streamed in.
pub struct FileSink {
    path: PathBuf,
    lines: Vec<String>,
}

impl FileSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let content = fs::read_to_string(&path)?;
        let lines = content.lines().map(|l| l.to_string()).collect();
        Ok(Self { path, lines })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    fn flush(&self) -> Result<(), Error> {
        let mut content = self.lines.join("\n");
        content.push('\n');
        fs::write(&self.path, content)?;
        Ok(())
    }

    fn check_range(&self, start: usize, end: usize) -> Result<(), Error> {
        if start > end || end >= self.lines.len() {
            return Err(Error::Unknown(format!(
                "line range {start}..={end} out of bounds ({} lines)",
                self.lines.len()
            )));
        }
        Ok(())
    }
}

impl DocumentSink for FileSink {
    fn line_count(&self) -> usize {
        self.lines.len()
    }

    fn read_lines(&self, start: usize, end: usize) -> Result<Vec<String>, Error> {
        self.check_range(start, end)?;
        Ok(self.lines[start..=end].to_vec())
    }

    fn append_at(&mut self, line: usize, lines: &[String]) -> Result<(), Error> {
        if line > self.lines.len() {
            return Err(Error::Unknown(format!(
                "insert point {line} out of bounds ({} lines)",
                self.lines.len()
            )));
        }
        self.lines.splice(line..line, lines.iter().cloned());
        self.flush()
    }

    fn replace_span(&mut self, start: usize, end: usize, lines: &[String]) -> Result<(), Error> {
        self.check_range(start, end)?;
        self.lines.splice(start..=end, lines.iter().cloned());
        self.flush()
    }
}
