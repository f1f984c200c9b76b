//! Engine internals: typed flash accessors, the page directory, the page validator, the
//! wear-slot allocator, the commit protocol and the recovery scan. Everything here works
//! through the [`crate::platform::Platform`] driver one small chunk at a time; no
//! slot-sized RAM buffer exists anywhere.

use crate::checksum::{self, CHECKSUM_INIT};
use crate::config::{ObjectDescriptor, PageDescriptor, PageType};
use crate::error::Error;
use crate::platform::Platform;
use crate::raw;
use crate::{InitStatus, Nvm};
#[cfg(feature = "defmt")]
use defmt::trace;

/// Chunk size for streamed copies, compares and checksums.
const CHUNK: usize = 16;

/// Outcome of validating one physical slot.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum Validate {
    /// Well-formed, current copy of its page.
    Ok,
    /// Well-formed, but its watermark carries the retire mark of an interrupted commit.
    OkMarked,
    /// Written by a different format version; never reused as data.
    WrongVersion,
    Invalid,
}

/// Which objects a commit takes from the caller. Objects not selected keep their
/// previously committed bytes.
pub(crate) enum WriteSet<'d> {
    /// One buffer per configured object, in table order.
    All(&'d [&'d [u8]]),
    One { object_id: u8, data: &'d [u8] },
    /// Pure relocation: copy everything from the old slot. Used by the static wear
    /// leveler.
    Relocate,
}

impl WriteSet<'_> {
    fn select(&self, index: usize, object: &ObjectDescriptor) -> Option<&[u8]> {
        match self {
            WriteSet::All(objects) => objects.get(index).copied(),
            WriteSet::One { object_id, data } if *object_id == object.object_id => Some(data),
            _ => None,
        }
    }
}

impl<'a, T: Platform> Nvm<'a, T> {
    // ---- typed flash accessors -------------------------------------------------------

    pub(crate) fn read_bytes(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.hal.read(address, buf).map_err(|_| Error::Flash)
    }

    pub(crate) fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> Result<(), Error> {
        self.hal.write(address, bytes).map_err(|_| Error::Flash)
    }

    pub(crate) fn read_u16(&mut self, address: u32) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        self.read_bytes(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub(crate) fn write_u16(&mut self, address: u32, value: u16) -> Result<(), Error> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    pub(crate) fn read_u32(&mut self, address: u32) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn write_u32(&mut self, address: u32, value: u32) -> Result<(), Error> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    /// Stream a flash region into a running checksum without an intermediate full buffer.
    fn checksum_region(&mut self, mut address: u32, mut len: u32, crc: &mut u16) -> Result<(), Error> {
        let mut buf = [0u8; CHUNK];
        while len > 0 {
            let n = len.min(CHUNK as u32) as usize;
            self.read_bytes(address, &mut buf[..n])?;
            *crc = checksum::accumulate(*crc, &buf[..n]);
            address += n as u32;
            len -= n as u32;
        }
        Ok(())
    }

    /// Copy a flash region to another slot while folding the source bytes into `crc`.
    fn copy_region(&mut self, mut src: u32, mut dst: u32, mut len: u32, mut crc: u16) -> Result<u16, Error> {
        let mut buf = [0u8; CHUNK];
        while len > 0 {
            let n = len.min(CHUNK as u32) as usize;
            self.read_bytes(src, &mut buf[..n])?;
            crc = checksum::accumulate(crc, &buf[..n]);
            self.write_bytes(dst, &buf[..n])?;
            src += n as u32;
            dst += n as u32;
            len -= n as u32;
        }
        Ok(crc)
    }

    fn region_matches(&mut self, mut address: u32, data: &[u8]) -> Result<bool, Error> {
        let mut buf = [0u8; CHUNK];
        for chunk in data.chunks(CHUNK) {
            self.read_bytes(address, &mut buf[..chunk.len()])?;
            if &buf[..chunk.len()] != chunk {
                return Ok(false);
            }
            address += chunk.len() as u32;
        }
        Ok(true)
    }

    // ---- page directory --------------------------------------------------------------

    /// Linear watermark scan for the slot currently holding `page_id`. A slot that is
    /// mid-retirement still matches; stale duplicates are cleaned up at commit and init
    /// time, not here.
    pub(crate) fn find_slot(&mut self, page_id: u16) -> Result<Option<u8>, Error> {
        for slot in 0..self.config.slots {
            let watermark = self.read_u16(self.config.slot_address(slot))?;
            if watermark == raw::live_watermark(page_id) || watermark == raw::marked_watermark(page_id) {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Dynamic wear leveling policy: of all empty slots, pick the one with the fewest
    /// erases. A never-programmed counter reads as all ones and so ranks last.
    pub(crate) fn find_best_scratch(&mut self) -> Result<Option<u8>, Error> {
        let mut best: Option<(u8, u32)> = None;
        for slot in 0..self.config.slots {
            let base = self.config.slot_address(slot);
            if self.read_u16(base + raw::WATERMARK_OFFSET)? != raw::EMPTY_WATERMARK {
                continue;
            }
            let update_id = self.read_u32(base + raw::UPDATE_ID_OFFSET)?;
            if best.is_none_or(|(_, count)| update_id < count) {
                best = Some((slot, update_id));
            }
        }
        Ok(best.map(|(slot, _)| slot))
    }

    // ---- wear-slot allocator ---------------------------------------------------------

    fn wear_record_size(object: &ObjectDescriptor) -> u32 {
        u32::from(object.size) + raw::RECORD_TRAILER_LEN
    }

    /// Records that fit into one wear slot.
    pub(crate) fn wear_record_count(&self, desc: &PageDescriptor) -> u32 {
        self.config.wear_capacity() / Self::wear_record_size(&desc.objects[0])
    }

    fn wear_record_address(&self, slot: u8, desc: &PageDescriptor, index: u32) -> u32 {
        self.config.slot_address(slot) + raw::HEADER_SIZE + index * Self::wear_record_size(&desc.objects[0])
    }

    /// First record whose trailer was never written (low bit still 1). Returns the record
    /// count when the slot is full.
    pub(crate) fn find_free_record(&mut self, slot: u8, desc: &PageDescriptor) -> Result<u32, Error> {
        let size = u32::from(desc.objects[0].size);
        let count = self.wear_record_count(desc);
        for index in 0..count {
            let trailer = self.read_u16(self.wear_record_address(slot, desc, index) + size)?;
            if trailer & raw::RECORD_MARK_MASK != trailer {
                return Ok(index);
            }
        }
        Ok(count)
    }

    /// Newest record whose trailer matches its recomputed checksum. Scans backward: the
    /// most recent append is always the highest written index, so this terminates almost
    /// immediately on a healthy slot.
    pub(crate) fn newest_valid_record(&mut self, slot: u8, desc: &PageDescriptor) -> Result<Option<u32>, Error> {
        let size = u32::from(desc.objects[0].size);
        for index in (0..self.wear_record_count(desc)).rev() {
            let address = self.wear_record_address(slot, desc, index);
            let trailer = self.read_u16(address + size)?;
            let mut crc = CHECKSUM_INIT;
            self.checksum_region(address, size, &mut crc)?;
            if trailer == crc & raw::RECORD_MARK_MASK {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    // ---- page validator --------------------------------------------------------------

    pub(crate) fn validate_slot(&mut self, slot: u8) -> Result<Validate, Error> {
        let base = self.config.slot_address(slot);
        let watermark = self.read_u16(base + raw::WATERMARK_OFFSET)?;
        if self.read_u16(base + raw::VERSION_OFFSET)? != raw::FORMAT_VERSION {
            return Ok(Validate::WrongVersion);
        }
        let Some((_, desc)) = self.config.page(watermark & raw::PAGE_ID_MASK) else {
            return Ok(Validate::Invalid);
        };

        match desc.page_type {
            PageType::Wear => {
                // A wear slot is only as good as its newest readable record.
                if self.newest_valid_record(slot, &desc)?.is_none() {
                    return Ok(Validate::Invalid);
                }
                if raw::is_marked(watermark) {
                    Ok(Validate::OkMarked)
                } else {
                    Ok(Validate::Ok)
                }
            }
            PageType::Normal => {
                let stored = self.read_u16(base + self.config.slot_size - raw::FOOTER_SIZE)?;
                let footer_watermark = self.read_u16(base + self.config.slot_size - 2)?;
                let mut result = if watermark == footer_watermark {
                    Validate::Ok
                } else if watermark | raw::LIVE_BIT == footer_watermark {
                    Validate::OkMarked
                } else {
                    Validate::Invalid
                };

                let mut crc = CHECKSUM_INIT;
                self.checksum_region(base + raw::HEADER_SIZE, desc.content_size(), &mut crc)?;
                if crc != stored {
                    result = Validate::Invalid;
                }
                Ok(result)
            }
        }
    }

    // ---- commit protocol -------------------------------------------------------------

    pub(crate) fn commit(&mut self, page_id: u16, set: WriteSet) -> Result<(), Error> {
        let Some((_, desc)) = self.config.page(page_id) else {
            return Err(Error::PageNotFound);
        };
        let old = self.find_slot(page_id)?;

        // Skip the flash entirely when the stored bytes already match. Bypassed while the
        // static wear leveler is working; its whole point is rewriting identical data.
        if desc.page_type == PageType::Normal
            && !self.leveler.working
            && !matches!(set, WriteSet::Relocate)
        {
            if let Some(slot) = old {
                if !self.rewrite_needed(slot, &desc, &set)? {
                    return Ok(());
                }
            }
        }

        if desc.page_type == PageType::Wear {
            let record = desc.objects[0];
            let data = set.select(0, &record).ok_or(Error::ObjectNotFound)?;
            let mark = checksum::accumulate(CHECKSUM_INIT, data) & raw::RECORD_MARK_MASK;

            if let Some(slot) = old {
                let index = self.find_free_record(slot, &desc)?;
                if index < self.wear_record_count(&desc) {
                    // In-place append; no erase, no relocation.
                    #[cfg(feature = "defmt")]
                    trace!("wear append: page {} slot {} record {}", page_id, slot, index);
                    let address = self.wear_record_address(slot, &desc, index);
                    self.write_bytes(address, data)?;
                    self.write_u16(address + u32::from(record.size), mark)?;

                    return match self.newest_valid_record(slot, &desc)? {
                        Some(newest) if newest == index => Ok(()),
                        _ => Err(Error::CorruptedData),
                    };
                }
            }
        }

        self.relocate(page_id, &desc, old, &set)
    }

    /// Byte-compare the selected objects against the stored copy.
    fn rewrite_needed(&mut self, slot: u8, desc: &PageDescriptor, set: &WriteSet) -> Result<bool, Error> {
        let content = self.config.slot_address(slot) + raw::HEADER_SIZE;
        let mut offset = 0u32;
        for (index, object) in desc.objects.iter().enumerate() {
            if let Some(data) = set.select(index, object) {
                if !self.region_matches(content + offset, data)? {
                    return Ok(true);
                }
            }
            offset += u32::from(object.size);
        }
        Ok(false)
    }

    /// Full commit: retire the old slot, write a fresh validated copy, erase the old one.
    /// A crash anywhere in between leaves either the marked old copy, or both copies, for
    /// the recovery scan to resolve.
    fn relocate(
        &mut self,
        page_id: u16,
        desc: &PageDescriptor,
        old: Option<u8>,
        set: &WriteSet,
    ) -> Result<(), Error> {
        if let Some(slot) = old {
            // The crash-safety pivot: a single in-place watermark write.
            self.write_u16(self.config.slot_address(slot), raw::marked_watermark(page_id))?;
        }

        let fresh = self.find_best_scratch()?.ok_or(Error::NoFreeSlot)?;
        #[cfg(feature = "defmt")]
        trace!("relocate: page {} -> slot {}", page_id, fresh);
        #[cfg(feature = "debug-logs")]
        println!("  relocate: page {page_id} {old:?} -> slot {fresh}");

        match self.write_page_image(fresh, page_id, desc, old, set) {
            Ok(()) => {
                if let Some(slot) = old {
                    self.erase_slot(slot)?;
                }
                Ok(())
            }
            Err(error) => {
                // Discard the half-written copy so recovery never sees two plausible
                // current slots.
                let _ = self.erase_slot(fresh);
                Err(error)
            }
        }
    }

    fn write_page_image(
        &mut self,
        fresh: u8,
        page_id: u16,
        desc: &PageDescriptor,
        old: Option<u8>,
        set: &WriteSet,
    ) -> Result<(), Error> {
        let base = self.config.slot_address(fresh);

        // Header: watermark and version only. The update id stays untouched so the slot
        // keeps its erase history.
        self.write_u16(base + raw::WATERMARK_OFFSET, raw::live_watermark(page_id))?;
        self.write_u16(base + raw::VERSION_OFFSET, raw::FORMAT_VERSION)?;

        let mut crc = CHECKSUM_INIT;
        let mut offset = 0u32;
        for (index, object) in desc.objects.iter().enumerate() {
            let size = u32::from(object.size);
            let dst = base + raw::HEADER_SIZE + offset;
            match set.select(index, object) {
                Some(data) => {
                    self.write_bytes(dst, data)?;
                    crc = checksum::accumulate(crc, data);
                }
                None => match old {
                    Some(slot) => {
                        let src = self.config.slot_address(slot) + raw::HEADER_SIZE + offset;
                        crc = self.copy_region(src, dst, size, crc)?;
                    }
                    None => {
                        // Never written before: the object stays erased and reads back
                        // as 0xFF, which the checksum has to cover.
                        let blank = [0xFFu8; CHUNK];
                        let mut rest = size;
                        while rest > 0 {
                            let n = rest.min(CHUNK as u32) as usize;
                            crc = checksum::accumulate(crc, &blank[..n]);
                            rest -= n as u32;
                        }
                    }
                },
            }
            offset += size;
        }

        match desc.page_type {
            PageType::Wear => {
                // The fresh slot starts over at record 0.
                self.write_u16(base + raw::HEADER_SIZE + offset, crc & raw::RECORD_MARK_MASK)?;
            }
            PageType::Normal => {
                self.write_u16(base + self.config.slot_size - raw::FOOTER_SIZE, crc)?;
                self.write_u16(base + self.config.slot_size - 2, raw::live_watermark(page_id))?;
            }
        }

        match self.validate_slot(fresh)? {
            Validate::Ok => Ok(()),
            _ => Err(Error::CorruptedData),
        }
    }

    /// Erase a slot, preserve and bump its erase counter, and report the vacated page to
    /// the static wear leveler (which may force further commits from inside this call).
    pub(crate) fn erase_slot(&mut self, slot: u8) -> Result<(), Error> {
        let base = self.config.slot_address(slot);
        let update_id = self.read_u32(base + raw::UPDATE_ID_OFFSET)?;
        let watermark = self.read_u16(base + raw::WATERMARK_OFFSET)?;

        #[cfg(feature = "defmt")]
        trace!("erase: slot {} watermark {=u16:#x}", slot, watermark);

        if watermark != raw::EMPTY_WATERMARK {
            self.note_page_erase(watermark & raw::PAGE_ID_MASK);
        }

        self.hal
            .erase(base, base + self.config.slot_size)
            .map_err(|_| Error::Flash)?;
        // A never-programmed counter reads all ones and wraps to zero here, exactly as if
        // the slot had been freshly formatted.
        self.write_u32(base + raw::UPDATE_ID_OFFSET, update_id.wrapping_add(1))
    }

    // ---- recovery --------------------------------------------------------------------

    /// Startup scan. Resolves interrupted commits first so a half-written twin is judged
    /// as part of its commit, not as free-standing corruption, then classifies what is
    /// left.
    pub(crate) fn scan_storage(&mut self) -> Result<InitStatus, Error> {
        for slot in 0..self.config.slots {
            let watermark = self.read_u16(self.config.slot_address(slot))?;
            if watermark == raw::EMPTY_WATERMARK || !raw::is_marked(watermark) {
                continue;
            }
            if matches!(self.validate_slot(slot)?, Validate::Ok | Validate::OkMarked) {
                self.resolve_duplicate(slot, watermark)?;
            }
        }

        let mut found = false;
        let mut corrupt = false;
        for slot in 0..self.config.slots {
            let watermark = self.read_u16(self.config.slot_address(slot))?;
            if watermark == raw::EMPTY_WATERMARK {
                continue;
            }
            match self.validate_slot(slot)? {
                Validate::Ok | Validate::OkMarked => found = true,
                Validate::WrongVersion | Validate::Invalid => corrupt = true,
            }
        }

        if corrupt {
            Err(Error::InvalidStorage)
        } else if found {
            Ok(InitStatus::Ok)
        } else {
            Ok(InitStatus::NoPages)
        }
    }

    /// A marked slot means a commit was interrupted between the retire mark and the old
    /// erase. Hunt for the live twin; whichever of the two fails validation is erased,
    /// the survivor becomes canonical.
    fn resolve_duplicate(&mut self, marked: u8, watermark: u16) -> Result<(), Error> {
        let live = watermark | raw::LIVE_BIT;
        for other in 0..self.config.slots {
            if other == marked {
                continue;
            }
            if self.read_u16(self.config.slot_address(other))? != live {
                continue;
            }

            let loser = match self.validate_slot(other)? {
                // The fresh copy is whole; the marked one is stale.
                Validate::Ok => marked,
                // The fresh copy never completed; keep the marked survivor.
                _ => other,
            };
            #[cfg(feature = "debug-logs")]
            println!("  recovery: page {} slots {marked}/{other}, erasing {loser}", watermark & raw::PAGE_ID_MASK);
            self.erase_slot(loser)?;
        }
        Ok(())
    }
}
