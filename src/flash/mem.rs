use crate::flash::{FlashDevice, FlashError};
use crate::layout::WORD_SIZE;
use parking_lot::Mutex;
use std::sync::Arc;

/// One physical flash operation, as captured by the write trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOp {
    Erase {
        region: u8,
    },
    Write {
        region: u8,
        offset: u32,
        bytes: Vec<u8>,
    },
}

/// Byte-for-byte copy of both regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    regions: [Vec<u8>; 2],
}

/// In-memory NOR model: regions erase to all-ones and a write can only
/// clear bits. With tracing enabled every erase and write is journaled, so
/// a harness can replay an arbitrary prefix to stand in for power loss.
#[derive(Debug)]
pub struct MemFlash {
    swap_size: u32,
    regions: [Vec<u8>; 2],
    trace: Option<Vec<FlashOp>>,
}

impl MemFlash {
    pub fn new(swap_size: u32) -> Self {
        assert!(
            swap_size % WORD_SIZE == 0,
            "swap size {swap_size} is not word-aligned"
        );
        let blank = vec![0xFF; swap_size as usize];
        Self {
            swap_size,
            regions: [blank.clone(), blank],
            trace: None,
        }
    }

    pub fn start_trace(&mut self) {
        self.trace = Some(Vec::new());
    }

    pub fn take_trace(&mut self) -> Vec<FlashOp> {
        self.trace.take().unwrap_or_default()
    }

    pub fn snapshot(&self) -> FlashImage {
        FlashImage {
            regions: self.regions.clone(),
        }
    }

    pub fn restore(&mut self, image: &FlashImage) {
        self.regions = image.regions.clone();
    }

    pub fn region(&self, region: u8) -> &[u8] {
        &self.regions[region as usize]
    }

    fn check_access(&self, region: u8, offset: u32, len: usize) -> Result<(), FlashError> {
        if region > 1 {
            return Err(FlashError::InvalidRegion(region));
        }
        if u64::from(offset) + len as u64 > u64::from(self.swap_size) {
            return Err(FlashError::OutOfBounds {
                offset,
                len,
                swap_size: self.swap_size,
            });
        }
        Ok(())
    }
}

impl FlashDevice for MemFlash {
    fn init(&mut self) -> Result<(), FlashError> {
        Ok(())
    }

    fn swap_size(&self) -> u32 {
        self.swap_size
    }

    fn erase(&mut self, region: u8) -> Result<(), FlashError> {
        self.check_access(region, 0, 0)?;
        self.regions[region as usize].fill(0xFF);
        if let Some(trace) = self.trace.as_mut() {
            trace.push(FlashOp::Erase { region });
        }
        Ok(())
    }

    fn read(&self, region: u8, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_access(region, offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.regions[region as usize][start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, region: u8, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if offset % WORD_SIZE != 0 || data.len() % WORD_SIZE as usize != 0 {
            return Err(FlashError::Misaligned {
                offset,
                len: data.len(),
            });
        }
        self.check_access(region, offset, data.len())?;
        let start = offset as usize;
        let cells = &mut self.regions[region as usize][start..start + data.len()];
        for (cell, byte) in cells.iter_mut().zip(data) {
            // Programming can only clear bits.
            *cell &= byte;
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.push(FlashOp::Write {
                region,
                offset,
                bytes: data.to_vec(),
            });
        }
        Ok(())
    }
}

/// Cloneable handle over a shared [`MemFlash`], letting a harness snapshot,
/// restore or inspect the image while a store owns the device.
#[derive(Debug, Clone)]
pub struct SharedMemFlash {
    inner: Arc<Mutex<MemFlash>>,
}

impl SharedMemFlash {
    pub fn new(swap_size: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemFlash::new(swap_size))),
        }
    }

    pub fn snapshot(&self) -> FlashImage {
        self.inner.lock().snapshot()
    }

    pub fn restore(&self, image: &FlashImage) {
        self.inner.lock().restore(image);
    }

    pub fn start_trace(&self) {
        self.inner.lock().start_trace();
    }

    pub fn take_trace(&self) -> Vec<FlashOp> {
        self.inner.lock().take_trace()
    }

    pub fn region(&self, region: u8) -> Vec<u8> {
        self.inner.lock().region(region).to_vec()
    }
}

impl FlashDevice for SharedMemFlash {
    fn init(&mut self) -> Result<(), FlashError> {
        self.inner.lock().init()
    }

    fn swap_size(&self) -> u32 {
        self.inner.lock().swap_size()
    }

    fn erase(&mut self, region: u8) -> Result<(), FlashError> {
        self.inner.lock().erase(region)
    }

    fn read(&self, region: u8, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.inner.lock().read(region, offset, buf)
    }

    fn write(&mut self, region: u8, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.inner.lock().write(region, offset, data)
    }
}
