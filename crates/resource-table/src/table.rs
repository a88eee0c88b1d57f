//! The Shared Resource Table proper: typed, lock-guarded access to the
//! per-GPU compute-unit mask slots in the shared region.

use crate::layout;
use crate::mutex::RawTableMutex;
use crate::region::ShmRegion;
use crate::TableError;

/// One handle onto the named table. The controller holds the creator
/// handle; consumer runtimes hold attacher handles. Only the creator may
/// destroy the region.
pub struct ResourceTable {
    region: ShmRegion,
    gpu_count: u32,
}

impl ResourceTable {
    /// Creates the named region sized for `gpu_count` GPUs, writes the
    /// count, fills every mask slot with the all-units-enabled default, and
    /// initializes the process-shared lock.
    pub fn create(name: &str, gpu_count: u32) -> Result<Self, TableError> {
        if gpu_count == 0 || gpu_count > layout::MAX_GPUS {
            return Err(TableError::InvalidGpuCount(gpu_count));
        }

        let region = ShmRegion::create(name, layout::region_size(gpu_count))?;
        let table = Self { region, gpu_count };

        // No attacher can race us here: the region only becomes useful to
        // consumers once the count, slots, and lock below are in place, and
        // consumers take the lock before reading anything.
        unsafe {
            table.count_ptr().write_volatile(gpu_count);
            for gpu_index in 0..gpu_count {
                let (word0, word1) = layout::DEFAULT_MASK;
                table.word_ptr(gpu_index, 0).write_volatile(word0);
                table.word_ptr(gpu_index, 1).write_volatile(word1);
            }
            RawTableMutex::init_at(table.lock_ptr());
        }

        tracing::info!(name, gpu_count, "created shared resource table");
        Ok(table)
    }

    /// Attaches to an existing region. The total size depends on the GPU
    /// count stored inside the region, so attachment is two-phase: map just
    /// the leading count field, read it, unmap, then remap at the computed
    /// full size.
    pub fn attach(name: &str) -> Result<Self, TableError> {
        let probe = ShmRegion::open(name, layout::SLOTS_OFFSET)?;
        let gpu_count = unsafe { (probe.as_ptr() as *const u32).read_volatile() };
        drop(probe);

        if gpu_count == 0 || gpu_count > layout::MAX_GPUS {
            return Err(TableError::Layout {
                name: name.to_string(),
                reason: format!("stored gpu_count {gpu_count} is implausible"),
            });
        }

        let region = ShmRegion::open(name, layout::region_size(gpu_count))?;
        let table = Self { region, gpu_count };

        // A previous writer may have died while holding the lock.
        table.lock_ref().cleanup_orphaned_holder();

        tracing::info!(name, gpu_count, "attached to shared resource table");
        Ok(table)
    }

    /// GPU count cached at create/attach time. The shared copy never
    /// changes after creation.
    pub fn gpu_count(&self) -> u32 {
        self.gpu_count
    }

    /// Reads the authoritative GPU count from the shared region, under the
    /// lock.
    pub fn read_gpu_count(&self) -> u32 {
        let _guard = self.lock_ref().lock();
        unsafe { self.count_ptr().read_volatile() }
    }

    /// Reads both mask words of the slot for `gpu_index`, under the lock.
    ///
    /// Callers must validate `gpu_index < gpu_count()` first; this is the
    /// dispatcher's job in the daemon.
    pub fn read_mask(&self, gpu_index: u32) -> (u32, u32) {
        assert!(gpu_index < self.gpu_count, "gpu_index out of range");
        let _guard = self.lock_ref().lock();
        unsafe {
            (
                self.word_ptr(gpu_index, 0).read_volatile(),
                self.word_ptr(gpu_index, 1).read_volatile(),
            )
        }
    }

    /// Writes both mask words of the slot for `gpu_index`, under the lock.
    pub fn write_mask(&self, gpu_index: u32, word0: u32, word1: u32) {
        assert!(gpu_index < self.gpu_count, "gpu_index out of range");
        let _guard = self.lock_ref().lock();
        unsafe {
            self.word_ptr(gpu_index, 0).write_volatile(word0);
            self.word_ptr(gpu_index, 1).write_volatile(word1);
        }
    }

    /// Restores the all-units-enabled default mask for `gpu_index`.
    pub fn reset_mask(&self, gpu_index: u32) {
        let (word0, word1) = layout::DEFAULT_MASK;
        self.write_mask(gpu_index, word0, word1);
    }

    pub fn is_creator(&self) -> bool {
        self.region.is_owner()
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Unmaps and closes this handle. Other attached processes are
    /// unaffected; the region itself stays alive.
    pub fn close(self) {
        tracing::debug!(name = %self.region.name(), "closed resource table handle");
    }

    /// Destroys the region: creator only. Unlinks the name so no future
    /// attach can find it, then unmaps and closes. Existing attachments in
    /// other processes stay mapped until they close.
    pub fn destroy(self) -> Result<(), TableError> {
        if !self.region.is_owner() {
            return Err(TableError::NotCreator);
        }
        self.region.unlink().map_err(|source| TableError::Allocation {
            name: self.region.name().to_string(),
            source,
        })?;
        tracing::info!(name = %self.region.name(), "destroyed shared resource table");
        Ok(())
    }

    fn count_ptr(&self) -> *mut u32 {
        unsafe { self.region.as_ptr().add(layout::COUNT_OFFSET) as *mut u32 }
    }

    fn word_ptr(&self, gpu_index: u32, word: usize) -> *mut u32 {
        unsafe { self.region.as_ptr().add(layout::word_offset(gpu_index, word)) as *mut u32 }
    }

    fn lock_ptr(&self) -> *mut RawTableMutex {
        unsafe { self.region.as_ptr().add(layout::lock_offset(self.gpu_count)) as *mut RawTableMutex }
    }

    fn lock_ref(&self) -> &RawTableMutex {
        unsafe { &*self.lock_ptr() }
    }
}
