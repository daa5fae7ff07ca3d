//! The Pager reads and writes fixed-size blocks inside the files of one data
//! directory.
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::block::BlockId;
use crate::error::DbResult;
use crate::page::Page;

/// The block store: every transfer is exactly `block_size` bytes.
pub struct Pager {
    dir: PathBuf,
    block_size: usize,
    is_new: bool,
    open_files: Mutex<HashMap<String, Arc<File>>>,
}

impl Pager {
    /// Opens the data directory, creating it if it doesn't exist. Leftover
    /// files whose name starts with `temp` are removed.
    pub fn open<P: AsRef<Path>>(dir: P, block_size: usize) -> DbResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let is_new = !dir.exists();
        if is_new {
            fs::create_dir_all(&dir)?;
        } else {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file()
                    && entry.file_name().to_string_lossy().starts_with("temp")
                {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        debug!(dir = %dir.display(), block_size, is_new, "opened pager");
        Ok(Self {
            dir,
            block_size,
            is_new,
            open_files: Mutex::new(HashMap::new()),
        })
    }

    fn file(&self, file_name: &str) -> DbResult<Arc<File>> {
        let mut files = self.open_files.lock();
        if let Some(file) = files.get(file_name) {
            return Ok(file.clone());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(file_name))?;
        let file = Arc::new(file);
        files.insert(file_name.to_string(), file.clone());
        Ok(file)
    }

    fn offset(&self, block: &BlockId) -> u64 {
        block.number() * self.block_size as u64
    }

    /// Reads `block` into `page`. A block past the end of the file, or a
    /// short read at the tail, leaves the missing bytes zeroed.
    pub fn read(&self, block: &BlockId, page: &mut Page) -> DbResult<()> {
        trace!(%block, "read block");
        let file = self.file(block.file_name())?;
        let buf = page.contents_mut();
        buf.fill(0);
        let mut filled = 0;
        let base = self.offset(block);
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], base + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(())
    }

    pub fn write(&self, block: &BlockId, page: &Page) -> DbResult<()> {
        trace!(%block, "write block");
        let file = self.file(block.file_name())?;
        file.write_all_at(page.contents(), self.offset(block))?;
        file.sync_data()?;
        Ok(())
    }

    /// Extends `file_name` by one zeroed block and returns its id.
    pub fn append(&self, file_name: &str) -> DbResult<BlockId> {
        let number = self.block_count(file_name)?;
        let block = BlockId::new(file_name, number);
        let file = self.file(file_name)?;
        file.write_all_at(&vec![0; self.block_size], self.offset(&block))?;
        file.sync_data()?;
        debug!(%block, "appended block");
        Ok(block)
    }

    pub fn block_count(&self, file_name: &str) -> DbResult<u64> {
        let file = self.file(file_name)?;
        Ok(file.metadata()?.len() / self.block_size as u64)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
