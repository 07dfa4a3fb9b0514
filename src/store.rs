use crate::error::StoreError;
use crate::flash::FlashDevice;
use crate::layout::{
    encode_record, RecordHeader, SwapHeader, MAX_VALUE_LENGTH, RECORD_HEADER_SIZE,
    SWAP_HEADER_SIZE, WORD_SIZE,
};
use log::{debug, info, warn};

/// Free-space bytes verified per flash read while sanitizing the tail.
const SCRUB_CHUNK: usize = 64;

/// Log-structured key-value store over a two-region flash swap area.
///
/// Every mutation appends a record to the active region; lookups linear-scan
/// from the region head. When the active region cannot take another record,
/// live records are compacted into the alternate region and the active
/// marker moves with a single bit clear. All on-flash transitions are
/// monotonic 1 -> 0 clears, so power loss at any write leaves a recoverable
/// image.
///
/// Keys are 16-bit identifiers holding a chain of values addressed by
/// ordinal. [`Store::set`] starts a fresh chain, [`Store::add`] appends to
/// it. The store assumes a single caller; embeddings with concurrent access
/// must serialize externally.
#[derive(Debug)]
pub struct Store<F> {
    flash: F,
    swap_size: u32,
    swap_header_size: u32,
    swap_index: u8,
    swap_used: u32,
    erase_counter: u16,
}

impl<F: FlashDevice> Store<F> {
    /// Initializes the platform flash and recovers store state from
    /// whatever the regions hold. A flash with no active region is wiped.
    pub fn open(mut flash: F) -> Result<Self, StoreError> {
        flash.init()?;
        let swap_size = flash.swap_size();
        assert!(
            swap_size % WORD_SIZE == 0 && swap_size >= SWAP_HEADER_SIZE + RECORD_HEADER_SIZE,
            "unusable swap region size {swap_size}"
        );

        let mut store = Self {
            flash,
            swap_size,
            swap_header_size: SWAP_HEADER_SIZE,
            swap_index: 0,
            swap_used: SWAP_HEADER_SIZE,
            erase_counter: 0,
        };

        let Some(region) = store.find_active_region()? else {
            info!("event=store_format reason=no_active_region");
            store.wipe()?;
            return Ok(store);
        };
        store.swap_index = region;
        store.recover_frontier()?;
        store.sanitize_free_space()?;
        info!(
            "event=store_open region={} used={} swap_size={}",
            store.swap_index, store.swap_used, store.swap_size
        );
        Ok(store)
    }

    /// Region currently holding the live log.
    pub fn swap_index(&self) -> u8 {
        self.swap_index
    }

    /// Byte offset of the write frontier within the active region.
    pub fn swap_used(&self) -> u32 {
        self.swap_used
    }

    /// Saturating count of region-0 erases since this store opened. Not
    /// persisted.
    pub fn erase_counter(&self) -> u16 {
        self.erase_counter
    }

    /// Returns the `index`-th value stored under `key`.
    ///
    /// Ordinals restart at 0 from the most recent chain head, so after a
    /// [`Store::set`] the newest value is always ordinal 0.
    pub fn get(&self, key: u16, index: usize) -> Result<Vec<u8>, StoreError> {
        let (offset, header) = self.locate(key, index)?.ok_or(StoreError::NotFound)?;
        let mut value = vec![0u8; header.length() as usize];
        self.flash
            .read(self.swap_index, offset + RECORD_HEADER_SIZE, &mut value)?;
        Ok(value)
    }

    /// Copies the `index`-th value under `key` into `buf`, truncating to the
    /// buffer, and returns the record's full length.
    pub fn get_into(&self, key: u16, index: usize, buf: &mut [u8]) -> Result<u16, StoreError> {
        let (offset, header) = self.locate(key, index)?.ok_or(StoreError::NotFound)?;
        let copied = buf.len().min(header.length() as usize);
        self.flash
            .read(self.swap_index, offset + RECORD_HEADER_SIZE, &mut buf[..copied])?;
        Ok(header.length())
    }

    /// Whether at least one value is stored under `key`.
    pub fn contains(&self, key: u16) -> Result<bool, StoreError> {
        Ok(self.locate(key, 0)?.is_some())
    }

    /// Stores `value` as the single logical value for `key`, shadowing any
    /// previous chain. The old records stay on flash until the next swap
    /// drops them.
    ///
    /// Panics if `value` exceeds [`MAX_VALUE_LENGTH`] bytes.
    pub fn set(&mut self, key: u16, value: &[u8]) -> Result<(), StoreError> {
        self.append(key, true, value)
    }

    /// Appends `value` to the chain for `key`. The first value ever stored
    /// under a key becomes the chain head.
    ///
    /// Panics if `value` exceeds [`MAX_VALUE_LENGTH`] bytes.
    pub fn add(&mut self, key: u16, value: &[u8]) -> Result<(), StoreError> {
        let first = !self.contains(key)?;
        self.append(key, first, value)
    }

    /// Tombstones the `index`-th value under `key`. Deleting ordinal 0 of a
    /// longer chain promotes the survivor at ordinal 1 to chain head.
    pub fn delete(&mut self, key: u16, index: usize) -> Result<(), StoreError> {
        self.delete_where(key, Some(index))
    }

    /// Tombstones every value stored under `key`.
    pub fn delete_all(&mut self, key: u16) -> Result<(), StoreError> {
        self.delete_where(key, None)
    }

    /// Erases region 0 and restarts the log there. Region 1 is left as-is;
    /// the next swap erases it.
    pub fn wipe(&mut self) -> Result<(), StoreError> {
        self.erase_region(0)?;
        self.flash.write(0, 0, &SwapHeader::active().encode())?;
        self.swap_index = 0;
        self.swap_header_size = SWAP_HEADER_SIZE;
        self.swap_used = SWAP_HEADER_SIZE;
        info!("event=store_wipe");
        Ok(())
    }

    fn find_active_region(&self) -> Result<Option<u8>, StoreError> {
        for region in 0..2u8 {
            let mut bytes = [0u8; SWAP_HEADER_SIZE as usize];
            self.flash.read(region, 0, &mut bytes)?;
            if SwapHeader::decode(bytes).is_active() {
                return Ok(Some(region));
            }
        }
        Ok(None)
    }

    /// Scans past every fully committed record to find the write frontier.
    fn recover_frontier(&mut self) -> Result<(), StoreError> {
        let mut used = self.swap_header_size;
        while used <= self.swap_size - RECORD_HEADER_SIZE {
            let header = self.read_header(self.swap_index, used)?;
            if !(header.write_started() && header.committed()) {
                break;
            }
            let size = header.total_size();
            if header.length() > MAX_VALUE_LENGTH || used + size > self.swap_size {
                warn!(
                    "event=frontier_halt reason=oversized_record offset={used} length={}",
                    header.length()
                );
                break;
            }
            used += size;
        }
        self.swap_used = used;
        Ok(())
    }

    /// Verifies the tail of the active region is erased and compacts if a
    /// torn write or stray data is parked there. Left in place, a later
    /// append over the same words would clear bits a second time and
    /// corrupt the record.
    fn sanitize_free_space(&mut self) -> Result<(), StoreError> {
        if self.swap_used % WORD_SIZE != 0 {
            warn!(
                "event=free_space_dirty reason=unaligned_frontier used={}",
                self.swap_used
            );
            return self.swap();
        }
        let mut buf = [0u8; SCRUB_CHUNK];
        let mut offset = self.swap_used;
        while offset < self.swap_size {
            let len = ((self.swap_size - offset) as usize).min(SCRUB_CHUNK);
            let chunk = &mut buf[..len];
            self.flash.read(self.swap_index, offset, chunk)?;
            if chunk.iter().any(|byte| *byte != 0xFF) {
                warn!("event=free_space_dirty reason=unerased_tail offset={offset}");
                return self.swap();
            }
            offset += len as u32;
        }
        Ok(())
    }

    fn read_header(&self, region: u8, offset: u32) -> Result<RecordHeader, StoreError> {
        let mut bytes = [0u8; RECORD_HEADER_SIZE as usize];
        self.flash.read(region, offset, &mut bytes)?;
        Ok(RecordHeader::decode(bytes))
    }

    /// Scans the whole log for the `index`-th valid record under `key`. A
    /// later record matching the ordinal wins, and a chain head resets both
    /// the ordinal count and any earlier hit.
    fn locate(&self, key: u16, index: usize) -> Result<Option<(u32, RecordHeader)>, StoreError> {
        let mut hit = None;
        let mut ordinal = 0usize;
        let mut offset = self.swap_header_size;
        while offset < self.swap_used {
            let header = self.read_header(self.swap_index, offset)?;
            if header.key() == key {
                if header.first() {
                    ordinal = 0;
                    hit = None;
                }
                if header.is_valid() {
                    if ordinal == index {
                        hit = Some((offset, header));
                    }
                    ordinal += 1;
                }
            }
            offset += header.total_size();
        }
        Ok(hit)
    }

    fn append(&mut self, key: u16, first: bool, value: &[u8]) -> Result<(), StoreError> {
        assert!(
            value.len() <= MAX_VALUE_LENGTH as usize,
            "value length {} exceeds {MAX_VALUE_LENGTH}",
            value.len()
        );
        let mut header = RecordHeader::begin(key, first, value.len() as u16);
        let record = encode_record(&header, value);
        let size = header.total_size();
        assert!(
            size <= self.swap_size - self.swap_header_size,
            "record of {size} bytes cannot fit an empty region"
        );

        if self.swap_used + size > self.swap_size {
            self.swap()?;
            if self.swap_used + size > self.swap_size {
                return Err(StoreError::NoSpace);
            }
        }

        let offset = self.swap_used;
        self.flash.write(self.swap_index, offset, &record)?;
        // Commit with a second header write that clears only the completion
        // bit.
        header.mark_committed();
        self.flash.write(self.swap_index, offset, &header.encode())?;
        self.swap_used += size;
        debug!(
            "event=record_append key={key:#06x} first={first} len={} offset={offset}",
            value.len()
        );
        Ok(())
    }

    fn delete_where(&mut self, key: u16, index: Option<usize>) -> Result<(), StoreError> {
        let mut found = false;
        let mut ordinal = 0usize;
        let mut offset = self.swap_header_size;
        while offset < self.swap_used {
            let mut header = self.read_header(self.swap_index, offset)?;
            let size = header.total_size();
            if header.key() == key {
                if header.first() {
                    ordinal = 0;
                    found = false;
                }
                if header.is_valid() {
                    if index.is_none() || index == Some(ordinal) {
                        header.mark_deleted();
                        self.flash.write(self.swap_index, offset, &header.encode())?;
                        found = true;
                        debug!("event=record_delete key={key:#06x} ordinal={ordinal}");
                    }
                    // The old head is gone; its survivor becomes the head.
                    // Power loss between the two writes leaves the chain
                    // without a head marker, which readers tolerate since
                    // ordinals always start at 0.
                    if index == Some(0) && ordinal == 1 {
                        header.mark_first();
                        self.flash.write(self.swap_index, offset, &header.encode())?;
                    }
                    ordinal += 1;
                }
            }
            offset += size;
        }
        if found {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    /// Compacts live records into the alternate region and makes it active.
    ///
    /// The destination header turns ACTIVE before the source turns INACTIVE,
    /// so no window exists without an active region. If power loss leaves
    /// both marked, recovery prefers region 0; either side holds every live
    /// record at that point.
    fn swap(&mut self) -> Result<(), StoreError> {
        let src = self.swap_index;
        let dst = 1 - src;
        self.erase_region(dst)?;

        let mut dst_offset = SWAP_HEADER_SIZE;
        let mut src_offset = self.swap_header_size;
        while src_offset < self.swap_used {
            let header = self.read_header(src, src_offset)?;
            if !header.write_started() {
                // Trailing torn write.
                break;
            }
            let size = header.total_size();
            if header.is_valid() && !self.shadowed(src_offset + size, header.key())? {
                let mut record = vec![0u8; size as usize];
                self.flash.read(src, src_offset, &mut record)?;
                self.flash.write(dst, dst_offset, &record)?;
                dst_offset += size;
            }
            src_offset += size;
        }

        self.flash.write(dst, 0, &SwapHeader::active().encode())?;
        self.flash.write(src, 0, &SwapHeader::inactive().encode())?;

        info!(
            "event=swap src={src} dst={dst} used_before={} used_after={dst_offset}",
            self.swap_used
        );
        self.swap_index = dst;
        self.swap_header_size = SWAP_HEADER_SIZE;
        self.swap_used = dst_offset;
        Ok(())
    }

    /// Shadowing predicate: true when a later valid chain head exists for
    /// `key`, which drops the earlier chain during compaction.
    fn shadowed(&self, mut offset: u32, key: u16) -> Result<bool, StoreError> {
        while offset < self.swap_used {
            let header = self.read_header(self.swap_index, offset)?;
            if header.is_valid() && header.first() && header.key() == key {
                return Ok(true);
            }
            offset += header.total_size();
        }
        Ok(false)
    }

    fn erase_region(&mut self, region: u8) -> Result<(), StoreError> {
        self.flash.erase(region)?;
        if region == 0 {
            self.erase_counter = self.erase_counter.saturating_add(1);
        }
        Ok(())
    }
}
