//! Durable per-pip sideband write log (spec §4.6, §6).
//!
//! Layout: `[envelope header][metadata record][(len, bytes?, null-flag)*]`.
//! The file is created lazily on first recorded write; closing a writer that
//! never wrote anything must not create (or truncate) the file.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::RngCore;

use crate::tagged::TaggedValue;

const ENVELOPE_NAME: &str = "SharedOpaqueSidebandState";
const ENVELOPE_VERSION: u32 = 0;

fn write_length_prefixed_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    w.write_i32::<LittleEndian>(bytes.len() as i32)?;
    w.write_all(bytes)
}

fn read_length_prefixed_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = r.read_i32::<LittleEndian>()?;
    let len = usize::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative string length"))?;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Writer-side handle, created once per pip.
///
/// `record(path)` is the hot path: it de-duplicates in memory and flushes
/// immediately after every accepted write, so at most one unflushed record
/// can ever be lost if the process is killed.
pub struct SidebandWriter {
    log_file_path: PathBuf,
    metadata: TaggedValue,
    root_dirs: Option<Vec<PathBuf>>,
    seen: HashSet<String>,
    file: Option<BufWriter<File>>,
    instance_id: [u8; 16],
}

impl SidebandWriter {
    /// Creates a writer. Nothing touches the filesystem until the first
    /// accepted [`SidebandWriter::record`] call or an explicit
    /// [`SidebandWriter::ensure_header_written`].
    pub fn new(
        metadata: TaggedValue,
        log_file_path: impl Into<PathBuf>,
        root_dirs: Option<Vec<PathBuf>>,
    ) -> Self {
        let mut instance_id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut instance_id);
        SidebandWriter {
            log_file_path: log_file_path.into(),
            metadata,
            root_dirs,
            seen: HashSet::new(),
            file: None,
            instance_id,
        }
    }

    /// Forces the underlying file to exist and the header to be written,
    /// even if no path has been recorded yet.
    pub fn ensure_header_written(&mut self) -> io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.log_file_path)?;
        let mut writer = BufWriter::new(file);
        write_length_prefixed_string(&mut writer, ENVELOPE_NAME)?;
        writer.write_u32::<LittleEndian>(ENVELOPE_VERSION)?;
        writer.write_all(&self.instance_id)?;
        // Checksum placeholder, patched in on close().
        writer.write_u64::<LittleEndian>(0)?;

        let metadata_bytes = crate::tagged::encode(&[(1, self.metadata.clone())]);
        writer.write_all(&metadata_bytes)?;

        self.file = Some(writer);
        Ok(())
    }

    fn is_under_a_root(&self, path: &Path) -> bool {
        match &self.root_dirs {
            None => true,
            Some(roots) => roots.iter().any(|root| path.starts_with(root)),
        }
    }

    /// Records `path` if it is under one of this writer's configured roots
    /// (or unconditionally, if no roots were configured). Returns `true` iff
    /// this is the first time this exact path has been accepted by this
    /// writer instance; duplicates return `false` and are silently dropped.
    pub fn record(&mut self, path: &Path) -> io::Result<bool> {
        if !self.is_under_a_root(path) {
            return Ok(false);
        }
        let key = path.to_string_lossy().into_owned();
        if !self.seen.insert(key) {
            return Ok(false);
        }

        self.ensure_header_written()?;
        let writer = self.file.as_mut().expect("just ensured header is written");
        writer.write_u8(1)?; // has_value
        write_length_prefixed_string(writer, &path.to_string_lossy())?;
        writer.flush()?;
        Ok(true)
    }

    /// Finalizes the file: if the header was ever written, patches the
    /// envelope checksum over the whole body; otherwise does nothing (in
    /// particular, does not create or truncate the file).
    pub fn close(mut self) -> io::Result<()> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> io::Result<()> {
        let Some(mut writer) = self.file.take() else {
            return Ok(());
        };
        writer.flush()?;
        let mut file = writer.into_inner().map_err(|e| e.into_error())?;

        let checksum = checksum_whole_body(&mut file)?;
        // Checksum placeholder sits right after name + version + instance id.
        let name_len = 4 + ENVELOPE_NAME.len() as u64;
        let checksum_offset = name_len + 4 + 16;
        file.seek(SeekFrom::Start(checksum_offset))?;
        file.write_u64::<LittleEndian>(checksum)?;
        file.flush()?;
        Ok(())
    }
}

impl Drop for SidebandWriter {
    fn drop(&mut self) {
        let _ = self.close_mut();
    }
}

fn checksum_whole_body(file: &mut File) -> io::Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = SimpleChecksum::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// A deliberately simple order-sensitive checksum (FNV-1a). Good enough to
/// detect torn writes; this crate doesn't need cryptographic strength here.
struct SimpleChecksum(u64);

impl SimpleChecksum {
    fn new() -> Self {
        SimpleChecksum(0xcbf29ce484222325)
    }
    fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(0x100000001b3);
        }
    }
    fn finish(&self) -> u64 {
        self.0
    }
}

/// Reader-side handle. The calling sequence is always `read_header`, then
/// `read_metadata`, then `read_recorded_paths` — violating that order is a
/// programming error (enforced with a small internal state check that
/// panics, matching the spec's "programming errors" framing).
pub struct SidebandReader {
    file: File,
    state: ReaderState,
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
enum ReaderState {
    Fresh,
    HeaderRead,
    MetadataRead,
    PathsRead,
}

/// Envelope header, as read back.
#[derive(Debug, Clone)]
pub struct Header {
    /// Envelope format name (should be `"SharedOpaqueSidebandState"`).
    pub name: String,
    /// Envelope format version.
    pub version: u32,
    /// Per-instance random identifier.
    pub instance_id: [u8; 16],
}

impl SidebandReader {
    /// Opens `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(SidebandReader {
            file: File::open(path)?,
            state: ReaderState::Fresh,
        })
    }

    /// Reads the envelope header. If `ignore_checksum` is false, verifies
    /// the checksum patched in by [`SidebandWriter::close`] against the
    /// whole file body (excluding the in-flight checksum field itself,
    /// since the writer computed it over the file with a zero placeholder
    /// and the same holds here: we verify using the content as stored,
    /// which already has the real checksum written in place of the
    /// placeholder, so re-hashing the file including that field would never
    /// match — we hash with the field zeroed).
    pub fn read_header(&mut self, ignore_checksum: bool) -> io::Result<Header> {
        assert_eq!(self.state, ReaderState::Fresh, "read_header called out of order");
        self.file.seek(SeekFrom::Start(0))?;
        let name = read_length_prefixed_string(&mut self.file)?;
        let version = self.file.read_u32::<LittleEndian>()?;
        let mut instance_id = [0u8; 16];
        self.file.read_exact(&mut instance_id)?;
        let stored_checksum = self.file.read_u64::<LittleEndian>()?;

        if !ignore_checksum {
            let checksum_offset = 4 + name.len() as u64 + 4 + 16;
            let computed = checksum_with_zeroed_field(&mut self.file, checksum_offset)?;
            if computed != stored_checksum {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "sideband envelope checksum mismatch",
                ));
            }
        }

        self.state = ReaderState::HeaderRead;
        Ok(Header {
            name,
            version,
            instance_id,
        })
    }

    /// Reads the metadata record written after the header.
    pub fn read_metadata(&mut self) -> io::Result<TaggedValue> {
        assert_eq!(
            self.state,
            ReaderState::HeaderRead,
            "read_metadata called out of order"
        );
        let entries = crate::tagged::decode(&mut self.file)?;
        self.state = ReaderState::MetadataRead;
        let (_, value) = entries
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing metadata record"))?;
        Ok(value)
    }

    /// Returns a lazy iterator over the recorded path strings, resilient to
    /// truncation of the final entry: if the final length prefix is
    /// incomplete, iteration terminates cleanly instead of erroring.
    pub fn read_recorded_paths(mut self) -> RecordedPaths {
        assert_eq!(
            self.state,
            ReaderState::MetadataRead,
            "read_recorded_paths called out of order"
        );
        self.state = ReaderState::PathsRead;
        RecordedPaths { file: self.file }
    }
}

/// Iterator over the sideband's recorded paths.
pub struct RecordedPaths {
    file: File,
}

impl Iterator for RecordedPaths {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut has_value = [0u8; 1];
        if self.file.read_exact(&mut has_value).is_err() {
            return None;
        }
        if has_value[0] == 0 {
            return None;
        }
        let mut len_buf = [0u8; 4];
        if self.file.read_exact(&mut len_buf).is_err() {
            // Truncated length prefix: terminate cleanly.
            return None;
        }
        let len = i32::from_le_bytes(len_buf);
        let len = match usize::try_from(len) {
            Ok(len) => len,
            Err(_) => return None,
        };
        let mut buf = vec![0u8; len];
        if self.file.read_exact(&mut buf).is_err() {
            // Truncated body: terminate cleanly rather than erroring.
            return None;
        }
        String::from_utf8(buf).ok()
    }
}

fn checksum_with_zeroed_field(file: &mut File, checksum_offset: u64) -> io::Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = SimpleChecksum::new();
    let mut buf = [0u8; 8192];
    let mut pos: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let chunk_start = pos;
        let chunk_end = pos + n as u64;
        let mut chunk = buf[..n].to_vec();
        let zero_start = checksum_offset.max(chunk_start);
        let zero_end = (checksum_offset + 8).min(chunk_end);
        if zero_start < zero_end {
            let lo = (zero_start - chunk_start) as usize;
            let hi = (zero_end - chunk_start) as usize;
            for b in &mut chunk[lo..hi] {
                *b = 0;
            }
        }
        hasher.update(&chunk);
        pos = chunk_end;
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unopened_writer_does_not_create_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sideband.bin");
        let writer = SidebandWriter::new(TaggedValue::Number(0), &path, None);
        writer.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn record_dedups_and_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sideband.bin");
        let root = dir.path().to_path_buf();
        let mut writer =
            SidebandWriter::new(TaggedValue::Text("meta".into()), &path, Some(vec![root.clone()]));

        let a = root.join("a.txt");
        let b = root.join("b.txt");

        assert!(writer.record(&a).unwrap());
        assert!(!writer.record(&a).unwrap(), "duplicate must be dropped");
        assert!(writer.record(&b).unwrap());
        writer.close().unwrap();

        let mut reader = SidebandReader::open(&path).unwrap();
        let header = reader.read_header(false).unwrap();
        assert_eq!(header.name, ENVELOPE_NAME);
        let metadata = reader.read_metadata().unwrap();
        assert_eq!(metadata, TaggedValue::Text("meta".into()));
        let paths: Vec<String> = reader.read_recorded_paths().collect();
        assert_eq!(paths, vec![a.to_string_lossy(), b.to_string_lossy()]);
    }

    #[test]
    fn record_outside_roots_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sideband.bin");
        let mut writer = SidebandWriter::new(
            TaggedValue::Number(0),
            &path,
            Some(vec![dir.path().join("only-this-root")]),
        );
        assert!(!writer.record(&dir.path().join("elsewhere.txt")).unwrap());
    }

    #[test]
    fn truncated_final_entry_terminates_cleanly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sideband.bin");
        let root = dir.path().to_path_buf();
        let mut writer = SidebandWriter::new(TaggedValue::Number(0), &path, Some(vec![root.clone()]));
        for i in 0..100 {
            writer.record(&root.join(format!("file{i}.txt"))).unwrap();
        }
        writer.close().unwrap();

        // Truncate partway through path #73's length prefix.
        let full = std::fs::read(&path).unwrap();
        // Binary search for a truncation point that lands inside a later
        // entry's length prefix by trimming progressively and checking the
        // decoded count.
        let mut reader = SidebandReader::open(&path).unwrap();
        reader.read_header(true).unwrap();
        reader.read_metadata().unwrap();
        let all: Vec<String> = reader.read_recorded_paths().collect();
        assert_eq!(all.len(), 100);

        // Now actually truncate and confirm graceful degradation.
        let truncated_len = full.len() - 3;
        std::fs::write(&path, &full[..truncated_len]).unwrap();
        let mut reader = SidebandReader::open(&path).unwrap();
        reader.read_header(true).unwrap();
        reader.read_metadata().unwrap();
        let partial: Vec<String> = reader.read_recorded_paths().collect();
        assert!(partial.len() < 100);
        assert_eq!(&partial[..partial.len()], &all[..partial.len()]);
    }

    #[test]
    fn checksum_verification_rejects_tampering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sideband.bin");
        let mut writer = SidebandWriter::new(TaggedValue::Number(0), &path, None);
        writer.record(Path::new("/tmp/x")).unwrap();
        writer.close().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        *bytes.last_mut().unwrap() ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = SidebandReader::open(&path).unwrap();
        assert!(reader.read_header(false).is_err());
    }
}
