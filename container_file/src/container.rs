//! The container handle, see [`ContainerFile`].

use crate::toc::{components, AttrValue, DatasetMeta, DatasetNode, Extent, GroupNode, Node, Toc};
use crate::{
    AlreadyExistsSnafu, BufferMismatchSnafu, ElementTypeMismatchSnafu, InvalidFormatSnafu,
    IoSnafu, NotADatasetSnafu, NotAGroupSnafu, NotFoundSnafu, OutOfBoundsSnafu, ReadOnlySnafu,
    Result, ShrinkForbiddenSnafu, TocDecodeSnafu, TocEncodeSnafu,
};
use flow_types::{Array, ElementType};
use observability_deps::tracing::debug;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"FLWCONT1";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 32;

/// Default dataset layout hint, consumed by auto-chunking iterators.
pub const DEFAULT_CHUNK_ROWS: u64 = 1024;

/// How a container is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Reads only; the file must already exist.
    ReadOnly,
    /// Reads and writes; the file is created when absent.
    ReadWrite,
}

/// An open container file.
///
/// All mutation goes through this handle; the TOC is kept in memory and
/// serialized to the end of the file by [`ContainerFile::flush`] (also run
/// on drop). Row data is written straight through.
#[derive(Debug)]
pub struct ContainerFile {
    file: File,
    path: PathBuf,
    mode: OpenMode,
    toc: Toc,
    /// File offset one past the last data extent; the TOC lands here on
    /// flush and is overwritten by the next extent allocation.
    data_end: u64,
    dirty: bool,
}

impl ContainerFile {
    /// Open (or, in read-write mode, create) the container at `path`.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true);
        if mode == OpenMode::ReadWrite {
            options.write(true).create(true);
        }
        let mut file = options.open(&path).context(IoSnafu { path: &path })?;
        let len = file.metadata().context(IoSnafu { path: &path })?.len();

        if len == 0 {
            ensure!(
                mode == OpenMode::ReadWrite,
                InvalidFormatSnafu {
                    path: &path,
                    reason: "empty file".to_string(),
                }
            );
            let mut container = Self {
                file,
                path,
                mode,
                toc: Toc::default(),
                data_end: HEADER_SIZE,
                dirty: true,
            };
            container.flush()?;
            return Ok(container);
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0)).context(IoSnafu { path: &path })?;
        file.read_exact(&mut header).context(IoSnafu { path: &path })?;
        ensure!(
            header[..8] == MAGIC[..],
            InvalidFormatSnafu {
                path: &path,
                reason: "bad magic".to_string(),
            }
        );
        let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
        ensure!(
            version == FORMAT_VERSION,
            InvalidFormatSnafu {
                path: &path,
                reason: format!("unsupported format version {}", version),
            }
        );
        let toc_offset = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let toc_len = u64::from_le_bytes(header[24..32].try_into().unwrap());

        let (toc, data_end) = if toc_len == 0 {
            (Toc::default(), HEADER_SIZE)
        } else {
            let mut buf = vec![0u8; toc_len as usize];
            file.seek(SeekFrom::Start(toc_offset))
                .context(IoSnafu { path: &path })?;
            file.read_exact(&mut buf).context(IoSnafu { path: &path })?;
            let toc = serde_json::from_slice(&buf).context(TocDecodeSnafu)?;
            (toc, toc_offset)
        };

        Ok(Self {
            file,
            path,
            mode,
            toc,
            data_end,
            dirty: false,
        })
    }

    /// Filesystem location of this container.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the container accepts mutation.
    pub fn writable(&self) -> bool {
        self.mode == OpenMode::ReadWrite
    }

    fn ensure_writable(&self) -> Result<()> {
        ensure!(self.writable(), ReadOnlySnafu { path: &self.path });
        Ok(())
    }

    /// Serialize the TOC and patch the header. No-op when nothing changed
    /// or the container is read-only.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty || !self.writable() {
            return Ok(());
        }
        let toc_bytes = serde_json::to_vec(&self.toc).context(TocEncodeSnafu)?;
        self.file
            .seek(SeekFrom::Start(self.data_end))
            .context(IoSnafu { path: &self.path })?;
        self.file
            .write_all(&toc_bytes)
            .context(IoSnafu { path: &self.path })?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[..8].copy_from_slice(MAGIC);
        header[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[16..24].copy_from_slice(&self.data_end.to_le_bytes());
        header[24..32].copy_from_slice(&(toc_bytes.len() as u64).to_le_bytes());
        self.file
            .seek(SeekFrom::Start(0))
            .context(IoSnafu { path: &self.path })?;
        self.file
            .write_all(&header)
            .context(IoSnafu { path: &self.path })?;

        // The file may shrink logically when a TOC rewrite lands below a
        // previous, longer one; stale bytes beyond the new TOC are harmless.
        self.dirty = false;
        debug!(path = %self.path.display(), toc_len = toc_bytes.len(), "container flushed");
        Ok(())
    }

    /// True when any object (group or dataset) exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.toc.node(path).is_some()
    }

    /// True when a dataset exists at `path`.
    pub fn is_dataset(&self, path: &str) -> bool {
        matches!(self.toc.node(path), Some(Node::Dataset(_)))
    }

    /// Create the group at `path` (and any missing intermediates).
    /// Idempotent when the group already exists.
    pub fn create_group(&mut self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        if components(path).is_empty() {
            return Ok(());
        }
        let (group, last) = self
            .toc
            .parent_group_mut(path)
            .context(NotAGroupSnafu { path })?;
        match group.children.get(&last) {
            Some(Node::Group(_)) => return Ok(()),
            Some(Node::Dataset(_)) => return AlreadyExistsSnafu { path }.fail(),
            None => {
                group
                    .children
                    .insert(last, Node::Group(GroupNode::default()));
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Unlink the object at `path` (and everything below it). The storage it
    /// occupied is not reclaimed.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let parts = components(path);
        let (last, dirs) = parts.split_last().context(NotFoundSnafu { path })?;
        let mut group = &mut self.toc.root;
        for part in dirs {
            match group.children.get_mut(*part) {
                Some(Node::Group(g)) => group = g,
                _ => return NotFoundSnafu { path }.fail(),
            }
        }
        group
            .children
            .remove(*last)
            .context(NotFoundSnafu { path })?;
        self.dirty = true;
        Ok(())
    }

    /// Full paths of every dataset at or below `root`, in tree order.
    /// Missing roots yield an empty list.
    pub fn datasets_under(&self, root: &str) -> Vec<String> {
        fn walk(prefix: &str, group: &GroupNode, out: &mut Vec<String>) {
            for (name, child) in &group.children {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", prefix, name)
                };
                match child {
                    Node::Dataset(_) => out.push(path),
                    Node::Group(g) => walk(&path, g, out),
                }
            }
        }

        let mut out = Vec::new();
        let normalized = components(root).join("/");
        match self.toc.node(&normalized) {
            None if normalized.is_empty() => walk("", &self.toc.root, &mut out),
            Some(Node::Group(g)) => walk(&normalized, g, &mut out),
            Some(Node::Dataset(_)) => out.push(normalized),
            None => {}
        }
        out
    }

    /// Set one attribute on an existing node.
    pub fn set_attr(&mut self, path: &str, key: &str, value: AttrValue) -> Result<()> {
        self.ensure_writable()?;
        let node = self.toc.node_mut(path).context(NotFoundSnafu { path })?;
        node.attrs_mut().insert(key.to_string(), value);
        self.dirty = true;
        Ok(())
    }

    /// One attribute of a node, if present.
    pub fn get_attr(&self, path: &str, key: &str) -> Result<Option<AttrValue>> {
        let node = self.toc.node(path).context(NotFoundSnafu { path })?;
        Ok(node.attrs().get(key).cloned())
    }

    /// The full attribute bag of a node.
    pub fn get_attrs(&self, path: &str) -> Result<BTreeMap<String, AttrValue>> {
        let node = self.toc.node(path).context(NotFoundSnafu { path })?;
        Ok(node.attrs().clone())
    }

    /// Create a dataset at `path` with the given element type. Matching
    /// re-creation is a no-op; a different element type is an error.
    pub fn create_dataset(
        &mut self,
        path: &str,
        element: ElementType,
        chunk_rows: u64,
    ) -> Result<()> {
        self.ensure_writable()?;
        let (group, last) = self
            .toc
            .parent_group_mut(path)
            .context(NotAGroupSnafu { path })?;
        match group.children.get(&last) {
            Some(Node::Dataset(d)) => {
                ensure!(
                    d.meta.element == element,
                    ElementTypeMismatchSnafu {
                        path,
                        existing: d.meta.element.to_string(),
                        requested: element.to_string(),
                    }
                );
                return Ok(());
            }
            Some(Node::Group(_)) => return AlreadyExistsSnafu { path }.fail(),
            None => {}
        }
        group.children.insert(
            last,
            Node::Dataset(DatasetNode {
                meta: DatasetMeta {
                    element,
                    rows: 0,
                    chunk_rows: chunk_rows.max(1),
                },
                extents: Vec::new(),
                attrs: BTreeMap::new(),
            }),
        );
        self.dirty = true;
        Ok(())
    }

    fn dataset(&self, path: &str) -> Result<&DatasetNode> {
        match self.toc.node(path) {
            Some(Node::Dataset(d)) => Ok(d),
            Some(Node::Group(_)) => NotADatasetSnafu { path }.fail(),
            None => NotFoundSnafu { path }.fail(),
        }
    }

    fn dataset_mut(&mut self, path: &str) -> Result<&mut DatasetNode> {
        match self.toc.node_mut(path) {
            Some(Node::Dataset(d)) => Ok(d),
            Some(Node::Group(_)) => NotADatasetSnafu { path }.fail(),
            None => NotFoundSnafu { path }.fail(),
        }
    }

    /// Bookkeeping for the dataset at `path`.
    pub fn dataset_meta(&self, path: &str) -> Result<DatasetMeta> {
        Ok(self.dataset(path)?.meta.clone())
    }

    /// Current row count of the dataset at `path`.
    pub fn dataset_rows(&self, path: &str) -> Result<u64> {
        Ok(self.dataset(path)?.meta.rows)
    }

    /// Grow the dataset to `new_rows` rows, zero-filling the tail. Equal
    /// size is a no-op; shrinking is forbidden.
    pub fn resize_dataset(&mut self, path: &str, new_rows: u64) -> Result<()> {
        self.ensure_writable()?;
        let (rows, row_size) = {
            let d = self.dataset(path)?;
            (d.meta.rows, d.meta.element.row_size() as u64)
        };
        if new_rows == rows {
            return Ok(());
        }
        ensure!(
            new_rows > rows,
            ShrinkForbiddenSnafu {
                path,
                rows,
                requested: new_rows,
            }
        );

        let nbytes = (new_rows - rows) * row_size;
        let offset = self.data_end;
        zero_fill(&mut self.file, offset, nbytes).context(IoSnafu { path: &self.path })?;

        let d = self.dataset_mut(path)?;
        d.extents.push(Extent {
            offset,
            start_row: rows,
            rows: new_rows - rows,
        });
        d.meta.rows = new_rows;
        self.data_end = offset + nbytes;
        self.dirty = true;
        Ok(())
    }

    /// Read rows `[start, stop)` of the dataset at `path`.
    pub fn read_rows(&mut self, path: &str, start: u64, stop: u64) -> Result<Array> {
        let (element, rows, extents) = {
            let d = self.dataset(path)?;
            (d.meta.element.clone(), d.meta.rows, d.extents.clone())
        };
        ensure!(
            start <= stop && stop <= rows,
            OutOfBoundsSnafu {
                path,
                rows,
                start,
                stop,
            }
        );
        let row_size = element.row_size() as u64;
        let mut buf = vec![0u8; ((stop - start) * row_size) as usize];
        for extent in &extents {
            let ext_stop = extent.start_row + extent.rows;
            let a = start.max(extent.start_row);
            let b = stop.min(ext_stop);
            if a >= b {
                continue;
            }
            let file_offset = extent.offset + (a - extent.start_row) * row_size;
            let buf_start = ((a - start) * row_size) as usize;
            let buf_stop = ((b - start) * row_size) as usize;
            self.file
                .seek(SeekFrom::Start(file_offset))
                .context(IoSnafu { path: &self.path })?;
            self.file
                .read_exact(&mut buf[buf_start..buf_stop])
                .context(IoSnafu { path: &self.path })?;
        }
        Ok(Array::from_raw(element, buf).expect("buffer is a whole number of rows"))
    }

    /// Write `array` in place starting at row `start`. The target range must
    /// already be covered by the dataset.
    pub fn write_rows(&mut self, path: &str, start: u64, array: &Array) -> Result<()> {
        self.ensure_writable()?;
        let (element, rows, extents) = {
            let d = self.dataset(path)?;
            (d.meta.element.clone(), d.meta.rows, d.extents.clone())
        };
        ensure!(
            *array.element() == element,
            BufferMismatchSnafu {
                path,
                expected: element.to_string(),
                actual: array.element().to_string(),
            }
        );
        let stop = start + array.rows() as u64;
        ensure!(
            stop <= rows,
            OutOfBoundsSnafu {
                path,
                rows,
                start,
                stop,
            }
        );
        let row_size = element.row_size() as u64;
        let bytes = array.bytes();
        for extent in &extents {
            let ext_stop = extent.start_row + extent.rows;
            let a = start.max(extent.start_row);
            let b = stop.min(ext_stop);
            if a >= b {
                continue;
            }
            let file_offset = extent.offset + (a - extent.start_row) * row_size;
            let buf_start = ((a - start) * row_size) as usize;
            let buf_stop = ((b - start) * row_size) as usize;
            self.file
                .seek(SeekFrom::Start(file_offset))
                .context(IoSnafu { path: &self.path })?;
            self.file
                .write_all(&bytes[buf_start..buf_stop])
                .context(IoSnafu { path: &self.path })?;
        }
        Ok(())
    }
}

impl Drop for ContainerFile {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            debug!(path = %self.path.display(), %e, "container flush on drop failed");
        }
    }
}

fn zero_fill(file: &mut File, offset: u64, nbytes: u64) -> std::io::Result<()> {
    const CHUNK: usize = 64 * 1024;
    static ZEROS: [u8; CHUNK] = [0u8; CHUNK];
    file.seek(SeekFrom::Start(offset))?;
    let mut remaining = nbytes as usize;
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        file.write_all(&ZEROS[..n])?;
        remaining -= n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_types::ScalarType;

    fn i64_dset() -> ElementType {
        ElementType::scalar(ScalarType::I64)
    }

    #[test]
    fn create_write_read_reopen() {
        let file = test_helpers::tmp_file().unwrap();
        let path = file.path().to_path_buf();
        {
            let mut c = ContainerFile::open(&path, OpenMode::ReadWrite).unwrap();
            c.create_dataset("a/data", i64_dset(), 16).unwrap();
            c.resize_dataset("a/data", 5).unwrap();
            c.write_rows("a/data", 0, &Array::from_i64s(&[1, 2, 3, 4, 5]))
                .unwrap();
            // attributes require an existing node
            assert!(matches!(
                c.set_attr("zzz", "classname", "Example".into()),
                Err(crate::Error::NotFound { .. })
            ));
            c.set_attr("a", "classname", "Example".into()).unwrap();
            c.flush().unwrap();
        }
        {
            let mut c = ContainerFile::open(&path, OpenMode::ReadOnly).unwrap();
            assert!(c.exists("a/data"));
            assert_eq!(c.dataset_rows("a/data").unwrap(), 5);
            let arr = c.read_rows("a/data", 1, 4).unwrap();
            assert_eq!(arr.to_i64_vec().unwrap(), vec![2, 3, 4]);
            assert_eq!(
                c.get_attr("a", "classname").unwrap(),
                Some(AttrValue::Str("Example".into()))
            );
        }
    }

    #[test]
    fn resize_zero_fills_and_appends() {
        let file = test_helpers::tmp_file().unwrap();
        let mut c = ContainerFile::open(file.path(), OpenMode::ReadWrite).unwrap();
        c.create_dataset("d/data", i64_dset(), 16).unwrap();
        c.resize_dataset("d/data", 3).unwrap();
        c.write_rows("d/data", 0, &Array::from_i64s(&[7, 8, 9])).unwrap();
        c.resize_dataset("d/data", 6).unwrap();
        let arr = c.read_rows("d/data", 0, 6).unwrap();
        assert_eq!(arr.to_i64_vec().unwrap(), vec![7, 8, 9, 0, 0, 0]);

        // rows written before a resize survive it
        c.write_rows("d/data", 4, &Array::from_i64s(&[11])).unwrap();
        let arr = c.read_rows("d/data", 0, 6).unwrap();
        assert_eq!(arr.to_i64_vec().unwrap(), vec![7, 8, 9, 0, 11, 0]);
    }

    #[test]
    fn shrink_forbidden() {
        let file = test_helpers::tmp_file().unwrap();
        let mut c = ContainerFile::open(file.path(), OpenMode::ReadWrite).unwrap();
        c.create_dataset("d/data", i64_dset(), 16).unwrap();
        c.resize_dataset("d/data", 4).unwrap();
        assert!(matches!(
            c.resize_dataset("d/data", 2),
            Err(crate::Error::ShrinkForbidden { .. })
        ));
        // equal size is a no-op
        c.resize_dataset("d/data", 4).unwrap();
    }

    #[test]
    fn recreate_same_element_is_noop() {
        let file = test_helpers::tmp_file().unwrap();
        let mut c = ContainerFile::open(file.path(), OpenMode::ReadWrite).unwrap();
        c.create_dataset("d/data", i64_dset(), 16).unwrap();
        c.resize_dataset("d/data", 2).unwrap();
        c.create_dataset("d/data", i64_dset(), 16).unwrap();
        assert_eq!(c.dataset_rows("d/data").unwrap(), 2);
        assert!(matches!(
            c.create_dataset("d/data", ElementType::scalar(ScalarType::F64), 16),
            Err(crate::Error::ElementTypeMismatch { .. })
        ));
    }

    #[test]
    fn delete_unlinks_subtree() {
        let file = test_helpers::tmp_file().unwrap();
        let mut c = ContainerFile::open(file.path(), OpenMode::ReadWrite).unwrap();
        c.create_dataset("a/ref/b/ref", i64_dset(), 16).unwrap();
        c.create_dataset("a/data", i64_dset(), 16).unwrap();
        c.delete("a/ref").unwrap();
        assert!(!c.exists("a/ref/b/ref"));
        assert!(c.exists("a/data"));
        assert!(matches!(
            c.delete("a/ref"),
            Err(crate::Error::NotFound { .. })
        ));
    }

    #[test]
    fn datasets_under_walks_tree() {
        let file = test_helpers::tmp_file().unwrap();
        let mut c = ContainerFile::open(file.path(), OpenMode::ReadWrite).unwrap();
        c.create_dataset("a/data", i64_dset(), 16).unwrap();
        c.create_dataset("a/ref/b/ref", i64_dset(), 16).unwrap();
        c.create_dataset("a/ref/b/ref_region", i64_dset(), 16).unwrap();
        c.create_dataset("b/data", i64_dset(), 16).unwrap();
        assert_eq!(
            c.datasets_under("a"),
            vec!["a/data", "a/ref/b/ref", "a/ref/b/ref_region"]
        );
        assert!(c.datasets_under("missing").is_empty());
    }

    #[test]
    fn read_only_rejects_writes() {
        let file = test_helpers::tmp_file().unwrap();
        let path = file.path().to_path_buf();
        {
            let mut c = ContainerFile::open(&path, OpenMode::ReadWrite).unwrap();
            c.create_dataset("d/data", i64_dset(), 16).unwrap();
        }
        let mut c = ContainerFile::open(&path, OpenMode::ReadOnly).unwrap();
        assert!(matches!(
            c.create_dataset("x/data", i64_dset(), 16),
            Err(crate::Error::ReadOnly { .. })
        ));
        assert!(matches!(
            c.resize_dataset("d/data", 1),
            Err(crate::Error::ReadOnly { .. })
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let file = test_helpers::tmp_file().unwrap();
        std::fs::write(file.path(), b"definitely not a container").unwrap();
        assert!(matches!(
            ContainerFile::open(file.path(), OpenMode::ReadOnly),
            Err(crate::Error::InvalidFormat { .. })
        ));
    }
}
