use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use crc32c::crc32c;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const SPOOL_MAGIC: &[u8; 8] = b"FNQUEUE1";
const SPOOL_VERSION: u32 = 1;
const SPOOL_HEADER_LEN: usize = 16;
const FRAME_HEADER_LEN: u64 = 8;
const MAX_FRAME_LEN: usize = 1024 * 1024;
const RECORD_ID_LEN: usize = 8;

pub type RecordId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub body: Bytes,
}

/// Ordered record storage shared by the retry queue and the text logs.
///
/// Ids are stable for the lifetime of a record in the spool and memory
/// stores. Line files number lines from the top at the time they are read.
pub trait RecordStore: Send {
    fn append(&mut self, body: &[u8]) -> Result<RecordId>;

    /// All live records, oldest first.
    fn records(&mut self) -> Result<Vec<StoredRecord>>;

    /// Removes the given ids; unknown ids are ignored. Returns how many were removed.
    fn remove(&mut self, ids: &[RecordId]) -> Result<usize>;

    /// Keeps only the newest `keep` records. Returns how many were dropped.
    fn trim_to_last(&mut self, keep: usize) -> Result<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only binary spool: a fixed header followed by
/// `len u32 LE | crc32c u32 LE | id u64 LE + body` frames.
pub struct SpoolFile {
    path: PathBuf,
    file: fs::File,
    ids: Vec<RecordId>,
    next_id: RecordId,
}

impl SpoolFile {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create spool dir {}", parent.display()))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;

        if file.metadata()?.len() == 0 {
            write_spool_header(&mut file)?;
            file.sync_data().ok();
        } else if let Err(err) = check_spool_header(&mut file) {
            let aside = path.with_extension("corrupt");
            tracing::warn!(
                error = %err,
                path = %path.display(),
                moved_to = %aside.display(),
                "spool header unreadable; starting a fresh spool"
            );
            drop(file);
            fs::rename(path, &aside).with_context(|| format!("move aside {}", path.display()))?;
            file = fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(path)
                .with_context(|| format!("create {}", path.display()))?;
            write_spool_header(&mut file)?;
            file.sync_data().ok();
        }

        let mut spool = Self {
            path: path.to_path_buf(),
            file,
            ids: Vec::new(),
            next_id: 1,
        };
        spool.reindex()?;
        Ok(spool)
    }

    /// Rebuilds the id index and cuts off anything after the last intact
    /// frame, which is what a crash mid-append leaves behind.
    fn reindex(&mut self) -> Result<()> {
        let scan = scan_frames(&mut self.file)?;
        let end = self.file.metadata()?.len();
        if scan.valid_len < end {
            tracing::warn!(
                path = %self.path.display(),
                kept = scan.valid_len,
                discarded = end - scan.valid_len,
                "truncated torn spool tail"
            );
            self.file.set_len(scan.valid_len)?;
        }
        self.ids = scan.records.iter().map(|record| record.id).collect();
        self.next_id = self.ids.iter().max().map_or(1, |id| id + 1);
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<StoredRecord>> {
        let scan = scan_frames(&mut self.file)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(scan.records)
    }

    /// Rewrites the spool with only the records `keep` accepts, via tmp file + rename.
    fn compact(&mut self, keep: impl Fn(RecordId) -> bool) -> Result<usize> {
        let records = self.read_all()?;
        let before = records.len();
        let tmp = self.path.with_extension("tmp");
        {
            let mut out = fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            write_spool_header(&mut out)?;
            let mut kept = 0usize;
            for record in records.iter().filter(|record| keep(record.id)) {
                write_frame(&mut out, record.id, &record.body)?;
                kept += 1;
            }
            out.sync_data().ok();
            tracing::debug!(kept, dropped = before - kept, "compacted spool");
        }
        fs::rename(&tmp, &self.path).with_context(|| format!("rename {}", tmp.display()))?;

        let next_id = self.next_id;
        self.file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("reopen {}", self.path.display()))?;
        self.reindex()?;
        // Ids are never reused, even when the newest records were removed.
        self.next_id = self.next_id.max(next_id);
        Ok(before - self.ids.len())
    }
}

impl RecordStore for SpoolFile {
    fn append(&mut self, body: &[u8]) -> Result<RecordId> {
        let id = self.next_id;
        self.file.seek(SeekFrom::End(0))?;
        write_frame(&mut self.file, id, body)?;
        self.file.sync_data().ok();
        self.next_id += 1;
        self.ids.push(id);
        Ok(id)
    }

    fn records(&mut self) -> Result<Vec<StoredRecord>> {
        self.read_all()
    }

    fn remove(&mut self, ids: &[RecordId]) -> Result<usize> {
        let doomed: HashSet<RecordId> = ids.iter().copied().collect();
        if !self.ids.iter().any(|id| doomed.contains(id)) {
            return Ok(0);
        }
        self.compact(|id| !doomed.contains(&id))
    }

    fn trim_to_last(&mut self, keep: usize) -> Result<usize> {
        if self.ids.len() <= keep {
            return Ok(0);
        }
        let cutoff = self.ids[self.ids.len() - keep..]
            .first()
            .copied()
            .unwrap_or(RecordId::MAX);
        self.compact(|id| id >= cutoff)
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Newline-delimited text file; each line is one record.
pub struct LineFile {
    path: PathBuf,
    lines: usize,
}

impl LineFile {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let mut lines = 0;
        if path.exists() {
            let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
            for line in BufReader::new(file).lines() {
                line.with_context(|| format!("read {}", path.display()))?;
                lines += 1;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            lines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        Ok(data.lines().map(str::to_string).collect())
    }

    fn rewrite(&mut self, lines: &[String]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("rename {}", tmp.display()))?;
        self.lines = lines.len();
        Ok(())
    }
}

impl RecordStore for LineFile {
    fn append(&mut self, body: &[u8]) -> Result<RecordId> {
        let line = String::from_utf8_lossy(body).replace(['\n', '\r'], " ");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("append {}", self.path.display()))?;
        let id = self.lines as RecordId;
        self.lines += 1;
        Ok(id)
    }

    fn records(&mut self) -> Result<Vec<StoredRecord>> {
        let lines = self.read_lines()?;
        self.lines = lines.len();
        Ok(lines
            .into_iter()
            .enumerate()
            .map(|(idx, line)| StoredRecord {
                id: idx as RecordId,
                body: Bytes::from(line),
            })
            .collect())
    }

    fn remove(&mut self, ids: &[RecordId]) -> Result<usize> {
        let doomed: HashSet<RecordId> = ids.iter().copied().collect();
        let lines = self.read_lines()?;
        let before = lines.len();
        let kept: Vec<String> = lines
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !doomed.contains(&(*idx as RecordId)))
            .map(|(_, line)| line)
            .collect();
        if kept.len() == before {
            return Ok(0);
        }
        self.rewrite(&kept)?;
        Ok(before - kept.len())
    }

    fn trim_to_last(&mut self, keep: usize) -> Result<usize> {
        if self.lines <= keep {
            return Ok(0);
        }
        let mut lines = self.read_lines()?;
        if lines.len() <= keep {
            self.lines = lines.len();
            return Ok(0);
        }
        let dropped = lines.len() - keep;
        lines.drain(..dropped);
        self.rewrite(&lines)?;
        Ok(dropped)
    }

    fn len(&self) -> usize {
        self.lines
    }
}

/// Process-local store, used when the spool directory is unusable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: VecDeque<StoredRecord>,
    next_id: RecordId,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn append(&mut self, body: &[u8]) -> Result<RecordId> {
        let id = self.next_id;
        self.next_id += 1;
        self.records.push_back(StoredRecord {
            id,
            body: Bytes::copy_from_slice(body),
        });
        Ok(id)
    }

    fn records(&mut self) -> Result<Vec<StoredRecord>> {
        Ok(self.records.iter().cloned().collect())
    }

    fn remove(&mut self, ids: &[RecordId]) -> Result<usize> {
        let doomed: HashSet<RecordId> = ids.iter().copied().collect();
        let before = self.records.len();
        self.records.retain(|record| !doomed.contains(&record.id));
        Ok(before - self.records.len())
    }

    fn trim_to_last(&mut self, keep: usize) -> Result<usize> {
        let dropped = self.records.len().saturating_sub(keep);
        self.records.drain(..dropped);
        Ok(dropped)
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Capacity of the filesystem holding a path, as seen by an unprivileged user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

pub fn disk_usage(path: &Path) -> Result<DiskUsage> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let cpath = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path {} contains a NUL byte", path.display()))?;
    let mut raw = MaybeUninit::<libc::statvfs>::zeroed();
    // SAFETY: `cpath` is NUL-terminated and `raw` is a valid out pointer.
    if unsafe { libc::statvfs(cpath.as_ptr(), raw.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs {}", path.display()));
    }
    // SAFETY: statvfs returned success, so the struct is filled in.
    let raw = unsafe { raw.assume_init() };
    let fragment = match raw.f_frsize as u64 {
        0 => raw.f_bsize as u64,
        size => size,
    };
    Ok(DiskUsage {
        total_bytes: (raw.f_blocks as u64).saturating_mul(fragment),
        free_bytes: (raw.f_bavail as u64).saturating_mul(fragment),
    })
}

fn write_spool_header(file: &mut fs::File) -> Result<()> {
    let mut header = [0u8; SPOOL_HEADER_LEN];
    header[0..8].copy_from_slice(SPOOL_MAGIC);
    header[8..12].copy_from_slice(&SPOOL_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&(SPOOL_HEADER_LEN as u32).to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

fn check_spool_header(file: &mut fs::File) -> Result<()> {
    let mut header = [0u8; SPOOL_HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header).context("short spool header")?;
    if &header[0..8] != SPOOL_MAGIC {
        return Err(anyhow!("bad spool magic"));
    }
    let [_, _, _, _, _, _, _, _, v0, v1, v2, v3, ..] = header;
    let version = u32::from_le_bytes([v0, v1, v2, v3]);
    if version != SPOOL_VERSION {
        return Err(anyhow!("unsupported spool version {version}"));
    }
    Ok(())
}

fn write_frame(file: &mut fs::File, id: RecordId, body: &[u8]) -> Result<()> {
    let mut payload = Vec::with_capacity(RECORD_ID_LEN + body.len());
    payload.extend_from_slice(&id.to_le_bytes());
    payload.extend_from_slice(body);
    if payload.len() > MAX_FRAME_LEN {
        return Err(anyhow!("record too large for spool ({} bytes)", payload.len()));
    }
    let len = payload.len() as u32;
    let crc = crc32c(&payload);
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    file.write_all(&frame)?;
    Ok(())
}

/// Frames that passed their checksum, and the offset just past the last one.
struct FrameScan {
    records: Vec<StoredRecord>,
    valid_len: u64,
}

/// Walks the frames after the header and stops at the first one that is
/// short, out of bounds or fails its checksum.
fn scan_frames(file: &mut fs::File) -> Result<FrameScan> {
    let mut reader = BufReader::new(&mut *file);
    reader.seek(SeekFrom::Start(SPOOL_HEADER_LEN as u64))?;
    let mut scan = FrameScan {
        records: Vec::new(),
        valid_len: SPOOL_HEADER_LEN as u64,
    };
    loop {
        let mut head = [0u8; FRAME_HEADER_LEN as usize];
        if !fill(&mut reader, &mut head)? {
            break;
        }
        let [l0, l1, l2, l3, c0, c1, c2, c3] = head;
        let len = u32::from_le_bytes([l0, l1, l2, l3]) as usize;
        if !(RECORD_ID_LEN..=MAX_FRAME_LEN).contains(&len) {
            break;
        }
        let mut payload = vec![0u8; len];
        if !fill(&mut reader, &mut payload)? {
            break;
        }
        if crc32c(&payload) != u32::from_le_bytes([c0, c1, c2, c3]) {
            break;
        }
        let mut id = [0u8; RECORD_ID_LEN];
        id.copy_from_slice(&payload[..RECORD_ID_LEN]);
        scan.records.push(StoredRecord {
            id: RecordId::from_le_bytes(id),
            body: Bytes::from(payload).slice(RECORD_ID_LEN..),
        });
        scan.valid_len += FRAME_HEADER_LEN + len as u64;
    }
    Ok(scan)
}

/// `read_exact` that reports a clean end of file as `false`.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}
