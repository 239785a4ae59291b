//! Append-only overflow segment backing a stage queue.
//!
//! Records are newline-delimited JSON documents. The segment keeps one
//! buffered append handle and one independent read handle on the same file,
//! so reads always observe records in write order. Every append is flushed
//! before it returns, so a full disk fails the push that hit it. Once enough
//! records have been consumed the unread tail is copied into a fresh file
//! which is then renamed over the original path; callers hold the queue lock
//! while this happens, so no append can interleave with the swap.
//!
//! All methods block on file IO. The queue runs them on the blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Consumed records required before a compaction is considered.
pub const COMPACT_MIN_READ: usize = 4096;

#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    writer: BufWriter<File>,
    reader: BufReader<File>,
    written: usize,
    read: usize,
    compactions: u64,
}

impl Segment {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let reader = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            reader: BufReader::new(reader),
            written: 0,
            read: 0,
            compactions: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &str) -> io::Result<()> {
        debug_assert!(!record.contains('\n'));
        self.writer.write_all(record.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn read_next(&mut self) -> io::Result<Option<String>> {
        if self.unread() == 0 {
            return Ok(None);
        }
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 || !line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("overflow segment '{}' ended early", self.path.display()),
            ));
        }
        line.pop();
        self.read += 1;
        Ok(Some(line))
    }

    pub fn unread(&self) -> usize {
        self.written - self.read
    }

    pub fn compactions(&self) -> u64 {
        self.compactions
    }

    pub fn should_compact(&self) -> bool {
        self.read >= COMPACT_MIN_READ && self.read >= self.unread()
    }

    /// Rewrites the unread tail into a new file and swaps it into place.
    pub fn compact(&mut self) -> io::Result<()> {
        let tmp = self.path.with_extension("compact");
        let remaining = self.unread();
        {
            let out = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut out = BufWriter::new(out);
            let mut line = String::new();
            for _ in 0..remaining {
                line.clear();
                if self.reader.read_line(&mut line)? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "overflow segment ended during compaction",
                    ));
                }
                out.write_all(line.as_bytes())?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.reader = BufReader::new(File::open(&self.path)?);
        self.written = remaining;
        self.read = 0;
        self.compactions += 1;
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
