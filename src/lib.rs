#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod config;
pub mod error;
pub mod platform;

mod checksum;
mod internal;
mod raw;
mod wear_level;

pub use config::{Config, ObjectDescriptor, PageDescriptor, PageType};
pub use error::Error;

use internal::{Validate, WriteSet};
use platform::Platform;
#[cfg(feature = "defmt")]
use defmt::trace;

/// Outcome of the startup scan.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitStatus {
    /// At least one page validated; the store is ready.
    Ok,
    /// The storage area validates but holds no pages. Call [`Nvm::erase_all`] and write
    /// initial data before reading.
    NoPages,
}

/// The page store. Owns the flash driver and the in-RAM wear-leveling history; everything
/// else lives in flash.
///
/// All operations take `&mut self`, which is the mutual-exclusion discipline: one caller
/// at a time, enforced by the borrow checker instead of a lock. No operation is
/// re-entrant except the static wear leveler's forced relocations, which run nested
/// inside a commit's erase step behind their own busy flag.
pub struct Nvm<'a, T: Platform> {
    pub(crate) hal: T,
    pub(crate) config: Config<'a>,
    pub(crate) leveler: wear_level::StaticWear,
    pub(crate) faulted: bool,
}

impl<'a, T: Platform> Nvm<'a, T> {
    /// Validate the configuration against the driver's geometry and build the store
    /// handle. Performs no flash access; call [`Nvm::init`] next.
    pub fn new(hal: T, config: Config<'a>) -> Result<Self, Error> {
        if T::READ_SIZE != 1 || T::WRITE_SIZE != 1 {
            return Err(Error::UnsupportedGranularity);
        }
        config.validate(T::ERASE_SIZE)?;

        let end = config.base_address as usize + usize::from(config.slots) * config.slot_size as usize;
        if end > hal.capacity() {
            return Err(Error::OutOfBounds);
        }

        Ok(Self {
            hal,
            config,
            leveler: wear_level::StaticWear::new(),
            faulted: false,
        })
    }

    /// Scan all physical slots, resolve commits that were interrupted by power loss, and
    /// report overall health. Run once at startup; running it again is equivalent to a
    /// power cycle.
    ///
    /// [`InitStatus::NoPages`] means a blank but healthy device: erase and write initial
    /// data. [`Error::InvalidStorage`] means a slot is corrupt beyond the reach of
    /// duplicate resolution; erasing loses data but makes the area usable again.
    pub fn init(&mut self) -> Result<InitStatus, Error> {
        #[cfg(feature = "defmt")]
        trace!("init: scanning {} slots", self.config.slots);
        self.leveler.reset();
        let result = self.scan_storage();
        self.latch(result)
    }

    /// Erase every slot. `erase_count` of `None` retains each slot's stored erase
    /// counter; `Some(n)` stamps all slots with `n` (useful when the counters themselves
    /// are suspect after an error).
    pub fn erase_all(&mut self, erase_count: Option<u32>) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::Flash);
        }
        let result = self.erase_all_inner(erase_count);
        self.latch(result)
    }

    fn erase_all_inner(&mut self, erase_count: Option<u32>) -> Result<(), Error> {
        for slot in 0..self.config.slots {
            let base = self.config.slot_address(slot);
            let count = match erase_count {
                Some(count) => count,
                None => self.read_u32(base + raw::UPDATE_ID_OFFSET)?,
            };
            self.hal
                .erase(base, base + self.config.slot_size)
                .map_err(|_| Error::Flash)?;
            // All ones is already the erased state; programming it would be a no-op.
            if count != raw::NEVER_PROGRAMMED {
                self.write_u32(base + raw::UPDATE_ID_OFFSET, count)?;
            }
        }
        Ok(())
    }

    /// Write one object. Unselected objects of the same page keep their previously
    /// committed bytes. `data` must be exactly the configured object size.
    ///
    /// For normal pages this commits a fresh copy of the whole page into the least-worn
    /// empty slot, unless the stored bytes already match, in which case flash is not
    /// touched at all. For wear pages the update is appended into the current slot and
    /// only spills into a relocation when the slot is full.
    pub fn write(&mut self, page_id: u16, object_id: u8, data: &[u8]) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::Flash);
        }
        let Some((_, desc)) = self.config.page(page_id) else {
            return Err(Error::PageNotFound);
        };
        let Some((_, object)) = desc.object_offset(object_id) else {
            return Err(Error::ObjectNotFound);
        };
        if data.len() != usize::from(object.size) {
            return Err(Error::SizeMismatch);
        }
        let result = self.commit(page_id, WriteSet::One { object_id, data });
        self.latch(result)
    }

    /// Write every object of a page: one buffer per configured object, in table order.
    pub fn write_page(&mut self, page_id: u16, objects: &[&[u8]]) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::Flash);
        }
        let Some((_, desc)) = self.config.page(page_id) else {
            return Err(Error::PageNotFound);
        };
        if objects.len() != desc.objects.len() {
            return Err(Error::SizeMismatch);
        }
        for (data, object) in objects.iter().zip(desc.objects) {
            if data.len() != usize::from(object.size) {
                return Err(Error::SizeMismatch);
            }
        }
        let result = self.commit(page_id, WriteSet::All(objects));
        self.latch(result)
    }

    /// Read one object into `buf`, which must be exactly the configured object size.
    /// Returns [`Error::PageNotFound`] when the page has never been committed and
    /// [`Error::CorruptedData`] when no valid copy exists.
    pub fn read(&mut self, page_id: u16, object_id: u8, buf: &mut [u8]) -> Result<(), Error> {
        let Some((_, desc)) = self.config.page(page_id) else {
            return Err(Error::PageNotFound);
        };
        let Some((offset, object)) = desc.object_offset(object_id) else {
            return Err(Error::ObjectNotFound);
        };
        if buf.len() != usize::from(object.size) {
            return Err(Error::SizeMismatch);
        }

        let result = self.read_inner(page_id, &desc, offset, object.size, buf);
        self.latch(result)
    }

    fn read_inner(
        &mut self,
        page_id: u16,
        desc: &PageDescriptor,
        offset: u32,
        size: u16,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let Some(slot) = self.find_slot(page_id)? else {
            return Err(Error::PageNotFound);
        };

        match desc.page_type {
            PageType::Wear => {
                let Some(index) = self.newest_valid_record(slot, desc)? else {
                    return Err(Error::CorruptedData);
                };
                let record_size = u32::from(size) + raw::RECORD_TRAILER_LEN;
                let address =
                    self.config.slot_address(slot) + raw::HEADER_SIZE + index * record_size;
                self.read_bytes(address, buf)
            }
            PageType::Normal => {
                match self.validate_slot(slot)? {
                    Validate::Ok | Validate::OkMarked => {}
                    Validate::WrongVersion | Validate::Invalid => {
                        return Err(Error::CorruptedData);
                    }
                }
                let address = self.config.slot_address(slot) + raw::HEADER_SIZE + offset;
                self.read_bytes(address, buf)
            }
        }
    }

    /// Read every object of a page: one buffer per configured object, in table order.
    pub fn read_page(&mut self, page_id: u16, bufs: &mut [&mut [u8]]) -> Result<(), Error> {
        let Some((_, desc)) = self.config.page(page_id) else {
            return Err(Error::PageNotFound);
        };
        if bufs.len() != desc.objects.len() {
            return Err(Error::SizeMismatch);
        }
        for (buf, object) in bufs.iter().zip(desc.objects) {
            if buf.len() != usize::from(object.size) {
                return Err(Error::SizeMismatch);
            }
        }

        let mut offset = 0u32;
        for (buf, object) in bufs.iter_mut().zip(desc.objects) {
            let result = self.read_inner(page_id, &desc, offset, object.size, buf);
            if let Err(error) = self.latch(result) {
                return Err(error);
            }
            offset += u32::from(object.size);
        }
        Ok(())
    }

    /// Highest erase count observed across all slots, a coarse health metric for the
    /// device. Counters that flash has never been programmed with are ignored.
    pub fn worst_wear_level(&mut self) -> Result<u32, Error> {
        let mut worst = 0u32;
        for slot in 0..self.config.slots {
            let base = self.config.slot_address(slot);
            let result = self.read_u32(base + raw::UPDATE_ID_OFFSET);
            let update_id = self.latch(result)?;
            if update_id != raw::NEVER_PROGRAMMED && update_id > worst {
                worst = update_id;
            }
        }
        Ok(worst)
    }

    /// Latch driver failures: once flash has misbehaved, mutating operations are refused
    /// until the store is reconstructed, so a half-trusted state is never extended.
    fn latch<V>(&mut self, result: Result<V, Error>) -> Result<V, Error> {
        if matches!(result, Err(Error::Flash)) {
            self.faulted = true;
        }
        result
    }
}
