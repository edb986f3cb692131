//! Streaming extractor for gzip-wrapped CPIO archives in the odc format.
//!
//! AirDrop senders upload archives as a gzip stream of 76-byte ASCII odc
//! headers, each followed by a NUL-terminated name and the entry payload.
//! The extractor is push-driven: callers feed buffers of arbitrary size and
//! entries are written to disk as their bytes arrive, so an archive never
//! has to be held in memory.

use std::fs;
use std::io::{self, Write};
use std::mem;
use std::path::PathBuf;

use flate2::write::GzDecoder;

use crate::utils::{octal::parse_octal, BridgeError, BridgeResult};

/// Size of an odc header.
pub const HEADER_LEN: usize = 76;

const MAGIC: &[u8; 6] = b"070707";
const TRAILER: &str = "TRAILER!!!";
const MODE_DIR: u32 = 0o040000;
const MODE_FILE: u32 = 0o100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Directory,
    File,
    Other,
}

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    kind: EntryKind,
    /// Name length on the wire, including the trailing NUL.
    name_len: usize,
    file_size: u64,
}

enum State {
    ExpectHeader,
    ExpectName(EntryMeta),
    /// Consuming payload bytes. `out` is `None` for entries that are skipped
    /// rather than written (directories, special files, `.`/`..`).
    ExpectData {
        out: Option<(fs::File, PathBuf)>,
        remaining: u64,
    },
    End,
    /// A previous push failed; the extractor is unusable.
    Failed,
}

/// Incremental CPIO-odc reader that extracts below a fixed root directory.
pub struct CpioExtractor {
    root: PathBuf,
    state: State,
    pending: Vec<u8>,
    extracted: Vec<PathBuf>,
}

impl CpioExtractor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: State::ExpectHeader,
            pending: Vec::with_capacity(HEADER_LEN),
            extracted: Vec::new(),
        }
    }

    /// Feed the next chunk of the (already decompressed) archive stream.
    ///
    /// Buffer boundaries are arbitrary; a header, name or payload may span
    /// any number of chunks. Bytes after the trailer entry are ignored.
    pub fn push(&mut self, data: &[u8]) -> BridgeResult<()> {
        let mut input = data;
        while !input.is_empty() {
            let state = mem::replace(&mut self.state, State::Failed);
            let (next, rest) = self.step(state, input)?;
            self.state = next;
            input = rest;
        }
        Ok(())
    }

    /// Declare end of input, returning the regular files created, in the
    /// order the archive listed them.
    pub fn finish(self) -> BridgeResult<Vec<PathBuf>> {
        match self.state {
            State::End => Ok(self.extracted),
            State::Failed => Err(BridgeError::Archive(
                "archive extraction already failed".into(),
            )),
            _ => Err(BridgeError::Archive(
                "archive truncated before trailer entry".into(),
            )),
        }
    }

    fn step<'a>(&mut self, state: State, input: &'a [u8]) -> BridgeResult<(State, &'a [u8])> {
        match state {
            State::Failed => Err(BridgeError::Archive(
                "extractor previously failed".into(),
            )),
            State::End => Ok((State::End, &[])),
            State::ExpectHeader => {
                let need = HEADER_LEN - self.pending.len();
                let take = need.min(input.len());
                self.pending.extend_from_slice(&input[..take]);
                let rest = &input[take..];
                if self.pending.len() < HEADER_LEN {
                    return Ok((State::ExpectHeader, rest));
                }
                let header = mem::take(&mut self.pending);
                let meta = parse_header(&header)?;
                Ok((State::ExpectName(meta), rest))
            }
            State::ExpectName(meta) => {
                let need = meta.name_len - self.pending.len();
                let take = need.min(input.len());
                self.pending.extend_from_slice(&input[..take]);
                let rest = &input[take..];
                if self.pending.len() < meta.name_len {
                    return Ok((State::ExpectName(meta), rest));
                }
                let raw = mem::take(&mut self.pending);
                let next = self.begin_entry(meta, &raw)?;
                Ok((next, rest))
            }
            State::ExpectData { mut out, mut remaining } => {
                let take = remaining.min(input.len() as u64) as usize;
                if let Some((file, _)) = out.as_mut() {
                    file.write_all(&input[..take])?;
                }
                remaining -= take as u64;
                let rest = &input[take..];
                if remaining > 0 {
                    return Ok((State::ExpectData { out, remaining }, rest));
                }
                if let Some((_, path)) = out {
                    self.extracted.push(path);
                }
                Ok((State::ExpectHeader, rest))
            }
        }
    }

    fn begin_entry(&mut self, meta: EntryMeta, raw: &[u8]) -> BridgeResult<State> {
        let name_bytes = match raw.iter().position(|&b| b == 0) {
            Some(n) => &raw[..n],
            None => {
                return Err(BridgeError::Archive(
                    "entry name is not NUL-terminated".into(),
                ))
            }
        };
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| BridgeError::Archive("entry name is not valid UTF-8".into()))?;
        let name = name.strip_prefix("./").unwrap_or(name);

        if name == "." || name == ".." {
            return Ok(skip_entry(meta.file_size));
        }
        if name == TRAILER {
            return Ok(State::End);
        }
        if meta.kind != EntryKind::File {
            return Ok(skip_entry(meta.file_size));
        }

        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&path)?;
        if meta.file_size == 0 {
            self.extracted.push(path);
            return Ok(State::ExpectHeader);
        }
        Ok(State::ExpectData {
            out: Some((file, path)),
            remaining: meta.file_size,
        })
    }

    /// Resolve an entry name below the extraction root.
    ///
    /// Names are normalised lexically: separators of either flavour split
    /// components, empty and `.` components vanish, and anything that would
    /// step outside the root (`..`, drive prefixes) is rejected. Absolute
    /// names are re-rooted rather than honoured.
    fn resolve(&self, name: &str) -> BridgeResult<PathBuf> {
        let mut path = self.root.clone();
        for component in name.split(['/', '\\']) {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." || component.contains(':') {
                return Err(BridgeError::Archive(format!(
                    "entry name {name:?} escapes the extraction root"
                )));
            }
            path.push(component);
        }
        if path == self.root {
            return Err(BridgeError::Archive(format!(
                "entry name {name:?} resolves to the extraction root"
            )));
        }
        Ok(path)
    }
}

fn skip_entry(size: u64) -> State {
    if size == 0 {
        State::ExpectHeader
    } else {
        State::ExpectData {
            out: None,
            remaining: size,
        }
    }
}

fn parse_header(header: &[u8]) -> BridgeResult<EntryMeta> {
    if &header[0..6] != MAGIC {
        return Err(BridgeError::Archive(format!(
            "bad odc magic {:02x?}",
            &header[0..6]
        )));
    }
    let field = |range: std::ops::Range<usize>, what: &str| {
        parse_octal(&header[range])
            .map_err(|e| BridgeError::Archive(format!("bad {what} field: {e}")))
    };
    let mode = field(18..24, "mode")?;
    let name_len = field(59..65, "name size")? as usize;
    let file_size = u64::from(field(65..76, "file size")?);
    if name_len == 0 {
        return Err(BridgeError::Archive("entry name size is zero".into()));
    }

    let kind = if mode & MODE_DIR != 0 {
        EntryKind::Directory
    } else if mode & MODE_FILE != 0 {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    Ok(EntryMeta {
        kind,
        name_len,
        file_size,
    })
}

struct ExtractorSink(CpioExtractor);

impl Write for ExtractorSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .push(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// [`CpioExtractor`] behind an inline gzip decompressor, matching the upload
/// wire format (Apple compresses the body but sends no `Content-Encoding`).
pub struct GzipExtractor {
    decoder: GzDecoder<ExtractorSink>,
}

impl GzipExtractor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            decoder: GzDecoder::new(ExtractorSink(CpioExtractor::new(root))),
        }
    }

    pub fn push(&mut self, data: &[u8]) -> BridgeResult<()> {
        self.decoder.write_all(data).map_err(into_bridge_error)
    }

    pub fn finish(self) -> BridgeResult<Vec<PathBuf>> {
        let sink = self.decoder.finish().map_err(into_bridge_error)?;
        sink.0.finish()
    }
}

fn into_bridge_error(err: io::Error) -> BridgeError {
    let wraps_bridge = err
        .get_ref()
        .map_or(false, |inner| inner.downcast_ref::<BridgeError>().is_some());
    if wraps_bridge {
        if let Some(inner) = err.into_inner() {
            if let Ok(bridge) = inner.downcast::<BridgeError>() {
                return *bridge;
            }
        }
        return BridgeError::Archive("archive error lost in transit".into());
    }
    BridgeError::Archive(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::octal::format_octal;
    use std::path::Path;

    fn header(name: &str, mode: u32, filesize: usize) -> Vec<u8> {
        let mut h = Vec::with_capacity(HEADER_LEN);
        h.extend_from_slice(MAGIC);
        let fields: [(u32, usize); 10] = [
            (0, 6),                        // device
            (1, 6),                        // inode
            (mode, 6),                     // mode
            (0, 6),                        // uid
            (0, 6),                        // gid
            (1, 6),                        // nlink
            (0, 6),                        // rdev
            (0, 11),                       // mtime
            (name.len() as u32 + 1, 6),    // namesize incl. NUL
            (filesize as u32, 11),         // filesize
        ];
        for (value, width) in fields {
            h.extend_from_slice(format_octal(value, width).as_bytes());
        }
        assert_eq!(h.len(), HEADER_LEN);
        h
    }

    fn entry(name: &str, mode: u32, data: &[u8]) -> Vec<u8> {
        let mut bytes = header(name, mode, data.len());
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(data);
        bytes
    }

    fn file_entry(name: &str, data: &[u8]) -> Vec<u8> {
        entry(name, 0o100644, data)
    }

    fn archive(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for e in entries {
            bytes.extend_from_slice(e);
        }
        bytes.extend_from_slice(&entry(TRAILER, 0, b""));
        bytes
    }

    fn extract(archive: &[u8], root: &Path) -> BridgeResult<Vec<PathBuf>> {
        let mut extractor = CpioExtractor::new(root);
        extractor.push(archive)?;
        extractor.finish()
    }

    #[test]
    fn extracts_single_file() {
        let out = tempfile::tempdir().unwrap();
        let data = [0xabu8; 33];
        let bytes = archive(&[file_entry("test.bin", &data)]);

        let files = extract(&bytes, out.path()).unwrap();
        assert_eq!(files, vec![out.path().join("test.bin")]);
        assert_eq!(fs::read(&files[0]).unwrap(), data);
    }

    #[test]
    fn extracts_many_small_files() {
        let out = tempfile::tempdir().unwrap();
        let entries: Vec<Vec<u8>> = (0..100)
            .map(|i| file_entry(&format!("file{i:02}.bin"), &[i as u8; 1024]))
            .collect();
        let bytes = archive(&entries);

        let files = extract(&bytes, out.path()).unwrap();
        assert_eq!(files.len(), 100);
        for (i, path) in files.iter().enumerate() {
            assert_eq!(fs::read(path).unwrap(), vec![i as u8; 1024]);
        }
    }

    #[test]
    fn extracts_large_files_in_chunks() {
        let out = tempfile::tempdir().unwrap();
        let entries: Vec<Vec<u8>> = (0..5)
            .map(|i| file_entry(&format!("big{i}.bin"), &[0x5a; 10240]))
            .collect();
        let bytes = archive(&entries);

        let mut extractor = CpioExtractor::new(out.path());
        for chunk in bytes.chunks(4096) {
            extractor.push(chunk).unwrap();
        }
        let files = extractor.finish().unwrap();
        assert_eq!(files.len(), 5);
        for path in &files {
            assert_eq!(fs::metadata(path).unwrap().len(), 10240);
        }
    }

    #[test]
    fn creates_nested_directories() {
        let out = tempfile::tempdir().unwrap();
        let bytes = archive(&[
            file_entry("test1/test.txt", b"one"),
            file_entry("test2/test.log", b"two"),
            file_entry("test3/test4/test.csv", b"three"),
        ]);

        let files = extract(&bytes, out.path()).unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(
            fs::read(out.path().join("test3/test4/test.csv")).unwrap(),
            b"three"
        );
    }

    #[test]
    fn byte_at_a_time_feed_matches_single_buffer() {
        let whole = tempfile::tempdir().unwrap();
        let trickled = tempfile::tempdir().unwrap();
        let bytes = archive(&[
            file_entry("a.bin", &[1; 100]),
            file_entry("dir/b.bin", &[2; 257]),
            file_entry("empty.bin", b""),
        ]);

        let from_whole = extract(&bytes, whole.path()).unwrap();

        let mut extractor = CpioExtractor::new(trickled.path());
        for byte in &bytes {
            extractor.push(std::slice::from_ref(byte)).unwrap();
        }
        let from_trickle = extractor.finish().unwrap();

        assert_eq!(from_whole.len(), from_trickle.len());
        for (a, b) in from_whole.iter().zip(&from_trickle) {
            assert_eq!(a.strip_prefix(whole.path()), b.strip_prefix(trickled.path()));
            assert_eq!(fs::read(a).unwrap(), fs::read(b).unwrap());
        }
    }

    #[test]
    fn rejects_parent_traversal() {
        let out = tempfile::tempdir().unwrap();
        let bytes = archive(&[file_entry("../../etc/passwd", b"pwned")]);
        assert!(extract(&bytes, out.path()).is_err());
        assert!(!out.path().parent().unwrap().join("etc/passwd").exists());
    }

    #[test]
    fn rejects_backslash_traversal() {
        let out = tempfile::tempdir().unwrap();
        let bytes = archive(&[file_entry("..\\evil.bin", b"x")]);
        assert!(extract(&bytes, out.path()).is_err());
    }

    #[test]
    fn reroots_absolute_names() {
        let out = tempfile::tempdir().unwrap();
        let bytes = archive(&[file_entry("/abs/path.bin", b"ok")]);
        let files = extract(&bytes, out.path()).unwrap();
        assert_eq!(files, vec![out.path().join("abs/path.bin")]);
    }

    #[test]
    fn strips_leading_dot_slash() {
        let out = tempfile::tempdir().unwrap();
        let bytes = archive(&[file_entry("./plain.bin", b"ok")]);
        let files = extract(&bytes, out.path()).unwrap();
        assert_eq!(files, vec![out.path().join("plain.bin")]);
    }

    #[test]
    fn skips_directory_and_dot_entries() {
        let out = tempfile::tempdir().unwrap();
        let bytes = archive(&[
            entry(".", 0o040755, b""),
            entry("subdir", 0o040755, b""),
            file_entry("subdir/file.bin", b"data"),
        ]);

        let files = extract(&bytes, out.path()).unwrap();
        assert_eq!(files, vec![out.path().join("subdir/file.bin")]);
    }

    #[test]
    fn ignores_bytes_after_trailer() {
        let out = tempfile::tempdir().unwrap();
        let mut bytes = archive(&[file_entry("f.bin", b"data")]);
        bytes.extend_from_slice(b"garbage that is not a header");

        let files = extract(&bytes, out.path()).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn truncated_archive_fails_on_finish() {
        let out = tempfile::tempdir().unwrap();
        let bytes = file_entry("f.bin", b"data");
        let mut extractor = CpioExtractor::new(out.path());
        extractor.push(&bytes).unwrap();
        assert!(extractor.finish().is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let out = tempfile::tempdir().unwrap();
        let mut bytes = archive(&[file_entry("f.bin", b"data")]);
        bytes[0] = b'9';
        assert!(extract(&bytes, out.path()).is_err());
    }

    #[test]
    fn gzip_stream_extracts_across_chunk_boundaries() {
        use flate2::{write::GzEncoder, Compression};

        let out = tempfile::tempdir().unwrap();
        let bytes = archive(&[
            file_entry("x/one.bin", &[7; 513]),
            file_entry("two.bin", &[9; 64]),
        ]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut extractor = GzipExtractor::new(out.path());
        for chunk in compressed.chunks(7) {
            extractor.push(chunk).unwrap();
        }
        let files = extractor.finish().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(fs::read(out.path().join("x/one.bin")).unwrap(), [7; 513]);
    }
}
