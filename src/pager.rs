// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Page buffer adapter.
//!
//! Pins fixed-size pages by block number and hands out latched views.
//! Latches are owned guards, so lock-coupling (acquire child, then release
//! parent) is expressible without borrowing from the pool. The adapter is
//! policy-free: frames stay resident, and the trees enforce their own lock
//! ordering on top.

use crate::error::corrupt;
use crate::page::{PageBuf, PAGE_SIZE};
use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock,
};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

/// Physical page number within the store file
pub type BlockNumber = u32;

/// Sentinel for "no block".
///
/// Block 0 always holds the metapage, so it can never appear as a sibling,
/// child or root link.
pub const INVALID_BLOCK: BlockNumber = 0;

type Frame = Arc<RwLock<PageBuf>>;

/// Resident set of page frames backed by a single store file
pub struct PageStore {
    path: PathBuf,
    frames: RwLock<Vec<Frame>>,
    free_list: Mutex<Vec<BlockNumber>>,
}

impl PageStore {
    /// Creates an empty store file, truncating any existing one.
    pub fn create<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.sync_all()?;

        log::debug!("created page store at {path:?}");

        Ok(Self {
            path,
            frames: RwLock::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
        })
    }

    /// Opens an existing store file and reads all page images.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();

        if len % (PAGE_SIZE as u64) != 0 {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("store file length {len} is not a multiple of the page size"),
            )));
        }

        #[allow(clippy::cast_possible_truncation)]
        let n_blocks = (len / (PAGE_SIZE as u64)) as BlockNumber;

        let mut frames = Vec::with_capacity(n_blocks as usize);
        for _ in 0..n_blocks {
            let mut buf = vec![0u8; PAGE_SIZE];
            file.read_exact(&mut buf)?;
            frames.push(Arc::new(RwLock::new(PageBuf::from_bytes(buf))));
        }

        log::debug!("opened page store at {path:?} with {n_blocks} blocks");

        Ok(Self {
            path,
            frames: RwLock::new(frames),
            free_list: Mutex::new(Vec::new()),
        })
    }

    /// Number of blocks in the store.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn block_count(&self) -> BlockNumber {
        self.frames.read().len() as BlockNumber
    }

    /// Pins a block, keeping its frame resident until the pin is dropped.
    pub fn pin(&self, blk: BlockNumber) -> crate::Result<PagePin> {
        let frames = self.frames.read();

        match frames.get(blk as usize) {
            Some(frame) => Ok(PagePin {
                blk,
                frame: Arc::clone(frame),
            }),
            None => corrupt(blk, "pin of block beyond end of store"),
        }
    }

    /// Allocates a page: reuses a freed block if one exists, else extends
    /// the store. The caller must format the page before unpinning it.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new_page(&self) -> crate::Result<(PagePin, BlockNumber)> {
        if let Some(blk) = self.free_list.lock().pop() {
            log::trace!("reusing freed block {blk}");
            return Ok((self.pin(blk)?, blk));
        }

        let mut frames = self.frames.write();
        let blk = frames.len() as BlockNumber;
        let frame = Arc::new(RwLock::new(PageBuf::new_zeroed()));
        frames.push(Arc::clone(&frame));

        log::trace!("extended store with block {blk}");

        Ok((PagePin { blk, frame }, blk))
    }

    /// Returns a block to the free list for reuse by [`PageStore::new_page`].
    pub fn free_page(&self, blk: BlockNumber) {
        debug_assert_ne!(INVALID_BLOCK, blk, "cannot free the metapage");
        self.free_list.lock().push(blk);
    }

    /// Drops the given latch and takes a shared latch on another block.
    pub fn release_and_share(
        &self,
        prev: SharedPage,
        blk: BlockNumber,
    ) -> crate::Result<SharedPage> {
        drop(prev);
        Ok(self.pin(blk)?.share())
    }

    /// Writes all dirty frames back to the store file.
    pub fn persist(&self) -> crate::Result<()> {
        let frames = self.frames.read();

        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len((frames.len() * PAGE_SIZE) as u64)?;

        let mut written = 0usize;

        for (blk, frame) in frames.iter().enumerate() {
            let mut page = frame.write();

            if page.dirty {
                file.seek(SeekFrom::Start((blk * PAGE_SIZE) as u64))?;
                file.write_all(page.bytes())?;
                page.dirty = false;
                written += 1;
            }
        }

        file.sync_all()?;

        log::debug!("persisted {written} dirty pages");

        Ok(())
    }
}

/// A pinned page; latch it with [`PagePin::share`] or [`PagePin::exclusive`]
pub struct PagePin {
    blk: BlockNumber,
    frame: Frame,
}

impl PagePin {
    /// The pinned block number.
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.blk
    }

    /// Takes a shared latch; concurrent shared readers are permitted.
    #[must_use]
    pub fn share(&self) -> SharedPage {
        SharedPage {
            blk: self.blk,
            guard: RwLock::read_arc(&self.frame),
        }
    }

    /// Takes an exclusive latch; the holder observes no concurrent
    /// modification.
    #[must_use]
    pub fn exclusive(&self) -> ExclusivePage {
        ExclusivePage {
            blk: self.blk,
            guard: RwLock::write_arc(&self.frame),
        }
    }
}

/// Shared latch on a pinned page
pub struct SharedPage {
    blk: BlockNumber,
    guard: ArcRwLockReadGuard<RawRwLock, PageBuf>,
}

impl SharedPage {
    /// The latched block number.
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.blk
    }
}

impl std::ops::Deref for SharedPage {
    type Target = PageBuf;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

/// Exclusive latch on a pinned page
///
/// Any mutable access marks the frame dirty.
pub struct ExclusivePage {
    blk: BlockNumber,
    guard: ArcRwLockWriteGuard<RawRwLock, PageBuf>,
}

impl ExclusivePage {
    /// The latched block number.
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.blk
    }
}

impl std::ops::Deref for ExclusivePage {
    type Target = PageBuf;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl std::ops::DerefMut for ExclusivePage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.dirty = true;
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::tag;
    use test_log::test;

    #[test]
    fn pager_new_page_extends() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = PageStore::create(dir.path().join("store"))?;

        let (_pin0, blk0) = store.new_page()?;
        let (_pin1, blk1) = store.new_page()?;

        assert_eq!(0, blk0);
        assert_eq!(1, blk1);
        assert_eq!(2, store.block_count());

        Ok(())
    }

    #[test]
    fn pager_free_list_reuse() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = PageStore::create(dir.path().join("store"))?;

        let (_m, _) = store.new_page()?;
        let (_a, blk) = store.new_page()?;

        store.free_page(blk);
        let (_b, reused) = store.new_page()?;

        assert_eq!(blk, reused);
        assert_eq!(2, store.block_count());

        Ok(())
    }

    #[test]
    fn pager_pin_out_of_range() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = PageStore::create(dir.path().join("store"))?;

        assert!(matches!(
            store.pin(7),
            Err(crate::Error::Corruption { block: 7, .. })
        ));

        Ok(())
    }

    #[test]
    fn pager_persist_and_reopen() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store");

        {
            let store = PageStore::create(&path)?;
            let (pin, _) = store.new_page()?;

            let mut page = pin.exclusive();
            page.format(24, tag::TREE);
            assert!(page.add_item(b"persist me"));
            drop(page);

            store.persist()?;
        }

        let store = PageStore::open(&path)?;
        assert_eq!(1, store.block_count());

        let pin = store.pin(0)?;
        let page = pin.share();
        assert_eq!(tag::TREE, page.page_tag());
        assert_eq!(b"persist me", page.item(0));

        Ok(())
    }

    #[test]
    fn pager_shared_latches_coexist() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = PageStore::create(dir.path().join("store"))?;

        let (pin, blk) = store.new_page()?;
        drop(pin);

        let pin_a = store.pin(blk)?;
        let pin_b = store.pin(blk)?;

        let a = pin_a.share();
        let b = pin_b.share();

        assert_eq!(a.block(), b.block());

        Ok(())
    }
}
