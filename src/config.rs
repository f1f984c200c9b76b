//! Compile-time storage layout: which pages exist, which objects they hold and where the
//! physical slots live. The table is supplied once at construction and is read-only
//! afterwards.

use crate::error::Error;
use crate::raw;

/// The behavior of a logical page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageType {
    /// Every update rewrites the whole page into a fresh slot.
    Normal,
    /// Updates are appended as records into the current slot; the slot is only replaced
    /// once it runs out of records.
    Wear,
}

/// One object within a page. Object data is passed in and out as byte slices of exactly
/// `size` bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ObjectDescriptor {
    /// Unique within the page.
    pub object_id: u8,
    pub size: u16,
}

/// A logical page: an ordered list of objects stored together in one physical slot.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PageDescriptor<'a> {
    /// Unique across the table. The high bit is reserved for the watermark encoding.
    pub page_id: u16,
    pub page_type: PageType,
    pub objects: &'a [ObjectDescriptor],
}

impl<'a> PageDescriptor<'a> {
    /// Total object bytes stored in a slot for this page.
    pub(crate) fn content_size(&self) -> u32 {
        self.objects.iter().map(|object| u32::from(object.size)).sum()
    }

    /// Byte offset of an object within the content region, in table order.
    pub(crate) fn object_offset(&self, object_id: u8) -> Option<(u32, ObjectDescriptor)> {
        let mut offset = 0u32;
        for object in self.objects {
            if object.object_id == object_id {
                return Some((offset, *object));
            }
            offset += u32::from(object.size);
        }
        None
    }
}

/// Storage area description handed to [`crate::Nvm::new`].
#[derive(Debug, Copy, Clone)]
pub struct Config<'a> {
    /// Total number of physical slots, including spares. At most 32.
    pub slots: u8,
    /// Size of one slot in bytes; must be a multiple of the driver's erase size.
    pub slot_size: u32,
    /// Flash offset of slot 0.
    pub base_address: u32,
    /// Static wear leveling kicks in once the erase-to-distinct-rewrite ratio exceeds
    /// this value. 100 is a reasonable default for typical NOR parts.
    pub static_wear_threshold: u16,
    /// The logical page table. Must be shorter than `slots` so a spare always exists.
    pub pages: &'a [PageDescriptor<'a>],
}

impl<'a> Config<'a> {
    pub(crate) fn slot_address(&self, slot: u8) -> u32 {
        self.base_address + u32::from(slot) * self.slot_size
    }

    /// Look up a page descriptor by id, with its table index.
    pub(crate) fn page(&self, page_id: u16) -> Option<(usize, PageDescriptor<'a>)> {
        self.pages
            .iter()
            .position(|page| page.page_id == page_id)
            .map(|index| (index, self.pages[index]))
    }

    /// Content capacity of a normal page slot.
    pub(crate) fn normal_capacity(&self) -> u32 {
        self.slot_size - raw::HEADER_SIZE - raw::FOOTER_SIZE
    }

    /// Content capacity of a wear page slot; no footer, records run to the end.
    pub(crate) fn wear_capacity(&self) -> u32 {
        self.slot_size - raw::HEADER_SIZE
    }

    /// Shape validation, run before any flash access so misconfiguration fails fast.
    pub(crate) fn validate(&self, erase_size: usize) -> Result<(), Error> {
        if usize::from(self.slots) > raw::MAX_SLOTS {
            return Err(Error::TooManySlots);
        }
        if self.pages.len() >= usize::from(self.slots) {
            return Err(Error::NoSpareSlot);
        }
        if self.slot_size == 0
            || erase_size == 0
            || !(self.slot_size as usize).is_multiple_of(erase_size)
            || self.slot_size <= raw::HEADER_SIZE + raw::FOOTER_SIZE
        {
            return Err(Error::InvalidSlotSize);
        }

        for (index, page) in self.pages.iter().enumerate() {
            if page.page_id & raw::LIVE_BIT != 0 || page.page_id == raw::PAGE_ID_MASK {
                return Err(Error::InvalidPageId(page.page_id));
            }
            if self.pages[..index].iter().any(|other| other.page_id == page.page_id) {
                return Err(Error::DuplicatePageId(page.page_id));
            }
            if page.objects.is_empty() {
                return Err(Error::EmptyPage(page.page_id));
            }
            if page.objects.iter().any(|object| object.size == 0) {
                return Err(Error::ZeroSizedObject(page.page_id));
            }
            for (i, object) in page.objects.iter().enumerate() {
                if page.objects[..i].iter().any(|other| other.object_id == object.object_id) {
                    return Err(Error::DuplicateObjectId(page.page_id));
                }
            }

            match page.page_type {
                PageType::Normal => {
                    if page.content_size() > self.normal_capacity() {
                        return Err(Error::PageTooLarge(page.page_id));
                    }
                }
                PageType::Wear => {
                    // The record stepping in the allocator only ever addresses object 0;
                    // anything else is a configuration mistake, not a silent restriction.
                    if page.objects.len() != 1 {
                        return Err(Error::WearPageShape(page.page_id));
                    }
                    if page.content_size() + raw::RECORD_TRAILER_LEN > self.wear_capacity() {
                        return Err(Error::PageTooLarge(page.page_id));
                    }
                }
            }
        }

        Ok(())
    }
}
