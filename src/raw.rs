//! Persisted byte layout. Every slot starts with an 8 byte header; normal pages end with a
//! 4 byte footer; wear pages fill the space in between with fixed-size records. All
//! multi-byte fields are little-endian.

/// Hard upper bound on physical slots; the wear-leveling history bitmap is sized for it.
pub(crate) const MAX_SLOTS: usize = 32;

/// Format version stored in every header. Slots written by a different version are never
/// reused as data.
pub(crate) const FORMAT_VERSION: u16 = 0x0002;

pub(crate) const HEADER_SIZE: u32 = 8;
pub(crate) const FOOTER_SIZE: u32 = 4;

pub(crate) const WATERMARK_OFFSET: u32 = 0;
pub(crate) const UPDATE_ID_OFFSET: u32 = 2;
pub(crate) const VERSION_OFFSET: u32 = 6;

/// Watermark of a slot in its erased state.
pub(crate) const EMPTY_WATERMARK: u16 = 0xFFFF;

/// Set on the watermark of a live page. Retiring a page clears this bit in place, which is
/// the only header mutation NOR flash allows without an erase.
pub(crate) const LIVE_BIT: u16 = 0x8000;
pub(crate) const PAGE_ID_MASK: u16 = 0x7FFF;

/// Wear record trailers store the checksum with the low bit forced to zero as the
/// written-mark; erased flash reads all ones.
pub(crate) const RECORD_MARK_MASK: u16 = 0xFFFE;
pub(crate) const RECORD_TRAILER_LEN: u32 = 2;

/// An `update_id` that flash has never been programmed with.
pub(crate) const NEVER_PROGRAMMED: u32 = 0xFFFF_FFFF;

#[inline]
pub(crate) const fn live_watermark(page_id: u16) -> u16 {
    page_id | LIVE_BIT
}

#[inline]
pub(crate) const fn marked_watermark(page_id: u16) -> u16 {
    page_id & PAGE_ID_MASK
}

#[inline]
pub(crate) const fn is_marked(watermark: u16) -> bool {
    watermark & LIVE_BIT == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retiring_only_clears_bits() {
        let live = live_watermark(0x0123);
        let marked = marked_watermark(0x0123);
        assert_eq!(live & marked, marked);
        assert!(!is_marked(live));
        assert!(is_marked(marked));
        assert_eq!(marked | LIVE_BIT, live);
    }

    #[test]
    fn empty_watermark_is_not_a_page() {
        assert_eq!(EMPTY_WATERMARK & PAGE_ID_MASK, PAGE_ID_MASK);
        assert!(!is_marked(EMPTY_WATERMARK));
    }
}
