//! The swap file behind the memory manager.
//!
//! Plain text, one record per line:
//!
//! ```text
//! CSOPESY Backing Store - Page Data
//! Format: ProcessName:PageNumber:Data
//! screen_01:0:00aa,0000,...,ffff
//! ```
//!
//! Each data word is a four-digit lowercase hex 16-bit value. Records are
//! append-only; a page evicted several times leaves several records, and the
//! last one holds the current contents.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_PATH: &str = "csopesy-backing-store.txt";

const HEADER_TITLE: &str = "CSOPESY Backing Store - Page Data";
const HEADER_FORMAT: &str = "Format: ProcessName:PageNumber:Data";

#[derive(Debug)]
pub struct BackingStore {
    path: PathBuf,
}

impl BackingStore {
    /// Creates the store file, truncating any previous contents, and writes
    /// the two header lines.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut file = File::create(&path)?;
        writeln!(file, "{}", HEADER_TITLE)?;
        writeln!(file, "{}", HEADER_FORMAT)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one page record.
    pub fn append(&self, process: &str, page: usize, words: &[u16]) -> io::Result<()> {
        let mut line = String::with_capacity(process.len() + 8 + words.len() * 5);
        let _ = write!(line, "{}:{}:", process, page);
        for (i, word) in words.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            let _ = write!(line, "{:04x}", word);
        }
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", line)
    }

    /// Returns the contents of the last record matching `(process, page)`,
    /// padded or truncated to `words_per_page`. Earlier records for the same
    /// page are stale page-outs and are skipped over.
    pub fn lookup(
        &self,
        process: &str,
        page: usize,
        words_per_page: usize,
    ) -> io::Result<Option<Vec<u16>>> {
        let file = File::open(&self.path)?;
        let mut found = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Some(words) = parse_record(&line, process, page) {
                found = Some(words);
            }
        }
        Ok(found.map(|mut words| {
            words.resize(words_per_page, 0);
            words
        }))
    }
}

/// Parses a record line, returning its words when it matches. Header lines
/// fail the page-number parse and fall out naturally.
fn parse_record(line: &str, process: &str, page: usize) -> Option<Vec<u16>> {
    let mut parts = line.splitn(3, ':');
    let name = parts.next()?;
    let number: usize = parts.next()?.trim().parse().ok()?;
    let data = parts.next()?;
    if name != process || number != page {
        return None;
    }
    Some(
        data.split(',')
            .map(|word| u16::from_str_radix(word.trim(), 16).unwrap_or(0))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn store() -> (tempfile::TempDir, BackingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BackingStore::create(dir.path().join("store.txt")).unwrap();
        (dir, store)
    }

    #[test]
    fn create_writes_header() {
        let (_dir, store) = store();
        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.starts_with("CSOPESY Backing Store - Page Data\n"));
        assert!(text.contains("Format: ProcessName:PageNumber:Data\n"));
    }

    #[test]
    fn append_then_lookup_round_trips() {
        let (_dir, store) = store();
        let words: Vec<u16> = (0..16).map(|i| i * 3).collect();
        store.append("p1", 2, &words).unwrap();
        assert_eq!(store.lookup("p1", 2, 16).unwrap(), Some(words));
        assert_eq!(store.lookup("p1", 0, 16).unwrap(), None);
        assert_eq!(store.lookup("p2", 2, 16).unwrap(), None);
    }

    #[test]
    fn last_matching_record_wins() {
        let (_dir, store) = store();
        store.append("p1", 0, &[0xaaaa; 16]).unwrap();
        store.append("p1", 0, &[0xcccc; 16]).unwrap();
        assert_eq!(store.lookup("p1", 0, 16).unwrap(), Some(vec![0xcccc; 16]));
    }

    #[test]
    fn words_are_four_digit_lowercase_hex() {
        let (_dir, store) = store();
        store.append("p1", 1, &[0x00ab, 0xffff, 0]).unwrap();
        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("p1:1:00ab,ffff,0000\n"));
    }
}
