//! On-disk formats.
//!
//! Index file `.kpi`: one header page, then page-aligned sections, then a
//! directory of `(key, offset, len)` records. All integers are little-endian.
//!
//! Partial run: flat array of [`KmerEntry`] records terminated by a sentinel.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::index::{IndexError, KmerEntry};

pub const KPI_MAGIC: u32 = 0x4B_50_49_31; // "KPI1"
pub const KPI_VERSION: u32 = 1;

/// Payload of the VERSION section. Readers reject other values.
pub const INDEX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Extension appended to a database path to name its index.
pub const INDEX_EXTENSION: &str = "kpi";

/// Alignment of every section in an index file.
pub const PAGE_SIZE: u64 = 4096;

/// Round `pos` up to a multiple of `align` (a power of two).
#[inline]
pub fn align_up(pos: u64, align: u64) -> u64 {
    (pos + align - 1) & !(align - 1)
}

/// Section identifiers, in their fixed write order.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionKey {
    Version = 0,
    Meta = 1,
    Entries = 2,
    EntriesOffsets = 3,
    EntriesGridSize = 4,
    EntriesNum = 5,
}

impl SectionKey {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(SectionKey::Version),
            1 => Some(SectionKey::Meta),
            2 => Some(SectionKey::Entries),
            3 => Some(SectionKey::EntriesOffsets),
            4 => Some(SectionKey::EntriesGridSize),
            5 => Some(SectionKey::EntriesNum),
            _ => None,
        }
    }
}

/// Bulk record writer that index construction streams into.
///
/// A record is bracketed by `write_start`/`write_end`; `write_add` appends to
/// the open record.
pub trait SectionSink {
    fn write_start(&mut self) -> Result<(), IndexError>;
    fn write_add(&mut self, data: &[u8]) -> Result<(), IndexError>;
    fn write_end(&mut self, key: SectionKey) -> Result<(), IndexError>;
    /// Pad output so the next record starts on a page boundary.
    fn align_to_page_size(&mut self) -> Result<(), IndexError>;

    /// One-shot record.
    fn write_data(&mut self, key: SectionKey, data: &[u8]) -> Result<(), IndexError> {
        self.write_start()?;
        self.write_add(data)?;
        self.write_end(key)
    }
}

/// In-memory sink keeping each section as its own buffer.
#[derive(Default, Debug)]
pub struct MemorySink {
    sections: BTreeMap<SectionKey, Vec<u8>>,
    open: Option<Vec<u8>>,
}

impl MemorySink {
    pub fn section(&self, key: SectionKey) -> Option<&[u8]> {
        self.sections.get(&key).map(|v| v.as_slice())
    }
}

impl SectionSink for MemorySink {
    fn write_start(&mut self) -> Result<(), IndexError> {
        if self.open.is_some() {
            return Err(IndexError::Format("record already open".into()));
        }
        self.open = Some(Vec::new());
        Ok(())
    }

    fn write_add(&mut self, data: &[u8]) -> Result<(), IndexError> {
        match self.open.as_mut() {
            Some(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            None => Err(IndexError::Format("no open record".into())),
        }
    }

    fn write_end(&mut self, key: SectionKey) -> Result<(), IndexError> {
        let buf = self
            .open
            .take()
            .ok_or_else(|| IndexError::Format("no open record".into()))?;
        self.sections.insert(key, buf);
        Ok(())
    }

    fn align_to_page_size(&mut self) -> Result<(), IndexError> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub dir_offset: u64,
    pub dir_len: u64,
}

impl FileHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LE>(self.magic)?;
        w.write_u32::<LE>(self.version)?;
        w.write_u64::<LE>(self.dir_offset)?;
        w.write_u64::<LE>(self.dir_len)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(FileHeader {
            magic: r.read_u32::<LE>()?,
            version: r.read_u32::<LE>()?,
            dir_offset: r.read_u64::<LE>()?,
            dir_len: r.read_u64::<LE>()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionDir {
    pub key: SectionKey,
    pub offset: u64,
    pub len: u64,
}

impl SectionDir {
    const BYTES: u64 = 20;

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LE>(self.key as u32)?;
        w.write_u64::<LE>(self.offset)?;
        w.write_u64::<LE>(self.len)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, IndexError> {
        let raw_key = r.read_u32::<LE>()?;
        let key = SectionKey::from_u32(raw_key)
            .ok_or_else(|| IndexError::Format(format!("unknown section key {raw_key}")))?;
        Ok(SectionDir {
            key,
            offset: r.read_u64::<LE>()?,
            len: r.read_u64::<LE>()?,
        })
    }
}

/// Writer producing a page-aligned `.kpi` file.
pub struct IndexFileWriter<W: Write + Seek> {
    out: W,
    pos: u64,
    open: Option<u64>,
    dir: Vec<SectionDir>,
}

impl IndexFileWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self, IndexError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        Self::new(BufWriter::with_capacity(4 * 1024 * 1024, file))
    }
}

impl<W: Write + Seek> IndexFileWriter<W> {
    /// Reserve the header page.
    pub fn new(mut out: W) -> Result<Self, IndexError> {
        FileHeader::default().write_to(&mut out)?;
        let mut w = IndexFileWriter {
            out,
            pos: 24,
            open: None,
            dir: Vec::new(),
        };
        w.align_to_page_size()?;
        Ok(w)
    }

    /// Write the directory and patch the header. Returns the underlying writer.
    pub fn finish(mut self) -> Result<W, IndexError> {
        if self.open.is_some() {
            return Err(IndexError::Format("unterminated record at finish".into()));
        }
        let dir_offset = align_up(self.pos, 8);
        self.pad_to(dir_offset)?;
        for d in &self.dir {
            d.write_to(&mut self.out)?;
        }
        let header = FileHeader {
            magic: KPI_MAGIC,
            version: KPI_VERSION,
            dir_offset,
            dir_len: self.dir.len() as u64,
        };
        self.out.seek(SeekFrom::Start(0))?;
        header.write_to(&mut self.out)?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn pad_to(&mut self, target: u64) -> Result<(), IndexError> {
        const ZEROS: [u8; 4096] = [0u8; 4096];
        while self.pos < target {
            let n = ((target - self.pos) as usize).min(ZEROS.len());
            self.out.write_all(&ZEROS[..n])?;
            self.pos += n as u64;
        }
        Ok(())
    }
}

impl<W: Write + Seek> SectionSink for IndexFileWriter<W> {
    fn write_start(&mut self) -> Result<(), IndexError> {
        if self.open.is_some() {
            return Err(IndexError::Format("record already open".into()));
        }
        self.open = Some(self.pos);
        Ok(())
    }

    fn write_add(&mut self, data: &[u8]) -> Result<(), IndexError> {
        if self.open.is_none() {
            return Err(IndexError::Format("no open record".into()));
        }
        self.out.write_all(data)?;
        self.pos += data.len() as u64;
        Ok(())
    }

    fn write_end(&mut self, key: SectionKey) -> Result<(), IndexError> {
        let start = self
            .open
            .take()
            .ok_or_else(|| IndexError::Format("no open record".into()))?;
        self.dir.push(SectionDir {
            key,
            offset: start,
            len: self.pos - start,
        });
        Ok(())
    }

    fn align_to_page_size(&mut self) -> Result<(), IndexError> {
        let target = align_up(self.pos, PAGE_SIZE);
        self.pad_to(target)
    }
}

/// Memory-mapped `.kpi` file with its parsed directory.
pub struct IndexFile {
    map: memmap2::Mmap,
    dir: Vec<SectionDir>,
}

impl IndexFile {
    /// Map `path` and validate header, directory and section bounds. Any size
    /// read from the file is checked against the file length before use.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let file = File::open(path)?;
        let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
        let file_len = map.len() as u64;

        let header = FileHeader::read_from(&mut &map[..])
            .map_err(|_| IndexError::Format("truncated header".into()))?;
        if header.magic != KPI_MAGIC {
            return Err(IndexError::Format("bad magic".into()));
        }
        if header.version != KPI_VERSION {
            return Err(IndexError::Format(format!(
                "unsupported version {}",
                header.version
            )));
        }

        let dir_end = header
            .dir_len
            .checked_mul(SectionDir::BYTES)
            .and_then(|n| n.checked_add(header.dir_offset))
            .filter(|&end| end <= file_len)
            .ok_or_else(|| {
                IndexError::Format(format!(
                    "directory of {} records at {} exceeds file of {file_len} bytes",
                    header.dir_len, header.dir_offset
                ))
            })?;
        let mut raw = &map[header.dir_offset as usize..dir_end as usize];
        let dir = (0..header.dir_len)
            .map(|_| SectionDir::read_from(&mut raw))
            .collect::<Result<Vec<_>, _>>()?;

        for d in &dir {
            let in_bounds = d.offset.checked_add(d.len).is_some_and(|end| end <= file_len);
            if d.offset % PAGE_SIZE != 0 || !in_bounds {
                return Err(IndexError::Format(format!(
                    "section {:?} at {}+{} is misplaced",
                    d.key, d.offset, d.len
                )));
            }
        }
        Ok(IndexFile { map, dir })
    }

    /// VERSION payload written by the builder.
    pub fn version(&self) -> Result<&str, IndexError> {
        std::str::from_utf8(self.section(SectionKey::Version)?)
            .map_err(|e| IndexError::Format(format!("version string: {e}")))
    }

    /// True if `path` is an index written by this version of the builder.
    pub fn is_index_file(path: &Path) -> bool {
        IndexFile::open(path)
            .and_then(|f| f.version().map(|v| v.starts_with(INDEX_VERSION)))
            .unwrap_or(false)
    }

    pub fn section(&self, key: SectionKey) -> Result<&[u8], IndexError> {
        let d = self
            .dir
            .iter()
            .find(|d| d.key == key)
            .ok_or_else(|| IndexError::Format(format!("missing section {key:?}")))?;
        Ok(&self.map[d.offset as usize..(d.offset + d.len) as usize])
    }

    pub fn section_slice<T: bytemuck::Pod>(&self, key: SectionKey) -> Result<&[T], IndexError> {
        let bytes = self.section(key)?;
        if bytes.is_empty() {
            return Ok(&[]);
        }
        bytemuck::try_cast_slice(bytes).map_err(|e| IndexError::Cast(format!("{key:?}: {e:?}")))
    }

    pub fn scalar_u64(&self, key: SectionKey) -> Result<u64, IndexError> {
        let mut bytes = self.section(key)?;
        if bytes.len() != 8 {
            return Err(IndexError::Format(format!(
                "{key:?} holds {} bytes, expected 8",
                bytes.len()
            )));
        }
        Ok(bytes.read_u64::<LE>()?)
    }
}

/// Index path of a database: `<db>.kpi`, next to the database.
pub fn index_path(db: &Path) -> PathBuf {
    let mut name = db.as_os_str().to_owned();
    name.push(".");
    name.push(INDEX_EXTENSION);
    PathBuf::from(name)
}

/// The index next to `db`, if one exists.
pub fn find_index(db: &Path) -> Option<PathBuf> {
    let path = index_path(db);
    path.is_file().then_some(path)
}

/// Write one sorted partial run, appending the sentinel record.
pub fn write_partial_run(path: &Path, entries: &[KmerEntry]) -> Result<(), IndexError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    let mut w = BufWriter::with_capacity(1024 * 1024, file);
    let body = match entries.last() {
        Some(e) if e.is_sentinel() => &entries[..entries.len() - 1],
        _ => entries,
    };
    w.write_all(bytemuck::cast_slice::<KmerEntry, u8>(body))?;
    w.write_all(bytemuck::bytes_of(&KmerEntry::sentinel()))?;
    w.flush()?;
    Ok(())
}

/// Map a partial run read-only. Any failure here is fatal for the build.
pub fn map_partial_run(path: &Path) -> Result<memmap2::Mmap, IndexError> {
    let run_err = |source| IndexError::RunOpen {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(run_err)?;
    let map = unsafe { memmap2::Mmap::map(&file) }.map_err(run_err)?;
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn sections_land_on_page_boundaries() {
        let mut w = IndexFileWriter::new(Cursor::new(Vec::new())).unwrap();
        w.write_data(SectionKey::Version, b"v1").unwrap();
        w.align_to_page_size().unwrap();
        w.write_start().unwrap();
        w.write_add(&[1u8; 10]).unwrap();
        w.write_add(&[2u8; 10]).unwrap();
        w.write_end(SectionKey::Entries).unwrap();
        w.align_to_page_size().unwrap();
        let dir = w.dir.clone();
        let bytes = w.finish().unwrap().into_inner();

        assert_eq!(dir[0].offset, PAGE_SIZE);
        assert_eq!(dir[1].offset, 2 * PAGE_SIZE);
        assert_eq!(dir[1].len, 20);
        let header = FileHeader::read_from(&mut &bytes[..]).unwrap();
        assert_eq!(header.magic, KPI_MAGIC);
        assert_eq!(header.dir_len, 2);
        assert_eq!(header.dir_offset, 3 * PAGE_SIZE);
    }

    #[test]
    fn add_without_start_is_rejected() {
        let mut sink = MemorySink::default();
        assert!(sink.write_add(b"x").is_err());
        assert!(sink.write_end(SectionKey::Meta).is_err());
    }

    #[test]
    fn missing_run_is_a_run_open_error() {
        let err = map_partial_run(Path::new("/nonexistent/run.0.bin")).unwrap_err();
        assert!(matches!(err, IndexError::RunOpen { .. }));
    }

    fn written_file(dir: &tempfile::TempDir, name: &str, version: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut w = IndexFileWriter::create(&path).unwrap();
        w.write_data(SectionKey::Version, version).unwrap();
        w.align_to_page_size().unwrap();
        w.finish().unwrap();
        path
    }

    fn patch(path: &Path, at: usize, bytes: &[u8]) {
        let mut data = std::fs::read(path).unwrap();
        data[at..at + bytes.len()].copy_from_slice(bytes);
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn oversized_directory_length_is_a_format_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = written_file(&dir, "x.kpi", INDEX_VERSION.as_bytes());
        patch(&path, 16, &(1u64 << 60).to_le_bytes());
        assert!(matches!(IndexFile::open(&path), Err(IndexError::Format(_))));
        patch(&path, 16, &u64::MAX.to_le_bytes());
        assert!(matches!(IndexFile::open(&path), Err(IndexError::Format(_))));
    }

    #[test]
    fn overflowing_section_bounds_are_a_format_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = written_file(&dir, "x.kpi", INDEX_VERSION.as_bytes());
        let data = std::fs::read(&path).unwrap();
        let header = FileHeader::read_from(&mut &data[..]).unwrap();
        // first directory record: key u32, offset u64, len u64
        let len_at = header.dir_offset as usize + 12;
        patch(&path, len_at, &u64::MAX.to_le_bytes());
        assert!(matches!(IndexFile::open(&path), Err(IndexError::Format(_))));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("short.kpi");
        std::fs::write(&path, b"KPI").unwrap();
        assert!(IndexFile::open(&path).is_err());
        assert!(!IndexFile::is_index_file(&path));
    }

    #[test]
    fn version_payload_identifies_index_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = written_file(&dir, "x.kpi", INDEX_VERSION.as_bytes());
        assert_eq!(IndexFile::open(&path).unwrap().version().unwrap(), INDEX_VERSION);
        assert!(IndexFile::is_index_file(&path));

        let other = written_file(&dir, "other.kpi", b"not-a-version");
        assert!(!IndexFile::is_index_file(&other));
        assert!(!IndexFile::is_index_file(&dir.path().join("absent.kpi")));
    }

    #[test]
    fn index_lives_next_to_the_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("db.fasta");
        assert_eq!(index_path(&db), dir.path().join("db.fasta.kpi"));
        assert_eq!(find_index(&db), None);
        std::fs::write(index_path(&db), b"").unwrap();
        assert_eq!(find_index(&db), Some(dir.path().join("db.fasta.kpi")));
    }

    #[test]
    fn align_up_rounds_to_page() {
        assert_eq!(align_up(0, PAGE_SIZE), 0);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
    }
}
