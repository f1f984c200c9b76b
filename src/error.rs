use thiserror::Error;

/// Errors that can occur while configuring or operating the page store. The list is likely to
/// stay as is but marked as non-exhaustive to allow for future additions without breaking the
/// API. The configuration variants are only ever returned by [`crate::Nvm::new`].
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The driver must support single-byte reads and single-byte program operations.
    #[error("flash driver does not support byte granularity")]
    UnsupportedGranularity,

    /// The slot size must be a non-zero multiple of the driver's erase size and leave room
    /// for the page header and footer.
    #[error("invalid slot size")]
    InvalidSlotSize,

    /// The configured storage region does not fit into the driver's capacity.
    #[error("storage region out of bounds")]
    OutOfBounds,

    /// More physical slots configured than the engine supports.
    #[error("too many physical slots")]
    TooManySlots,

    /// At least one spare slot is required so a page can always be relocated.
    #[error("no spare slot in configuration")]
    NoSpareSlot,

    /// A page id must leave the high watermark bit free and not collide with the
    /// empty-slot sentinel.
    #[error("invalid page id {0}")]
    InvalidPageId(u16),

    /// Page ids must be unique across the configuration table.
    #[error("duplicate page id {0}")]
    DuplicatePageId(u16),

    /// Object ids must be unique within their page.
    #[error("duplicate object id in page {0}")]
    DuplicateObjectId(u16),

    /// A page must contain at least one object.
    #[error("page {0} has no objects")]
    EmptyPage(u16),

    /// Zero-sized objects cannot be stored.
    #[error("zero-sized object in page {0}")]
    ZeroSizedObject(u16),

    /// The page's objects do not fit into a slot's content region.
    #[error("page {0} does not fit a slot")]
    PageTooLarge(u16),

    /// A wear page holds exactly one object; its slot is subdivided into records of that
    /// object's size.
    #[error("wear page {0} must hold exactly one object")]
    WearPageShape(u16),

    /// The page id is not present in the configuration table, or no slot currently holds
    /// the page. It might not have been written yet.
    #[error("page not found")]
    PageNotFound,

    /// The object id is not present in the page's object table.
    #[error("object not found")]
    ObjectNotFound,

    /// A caller buffer does not match the configured object size, or a write-all call does
    /// not supply one buffer per configured object.
    #[error("buffer size mismatch")]
    SizeMismatch,

    /// Checksum or watermark validation failed and no valid copy of the data exists.
    #[error("corrupted data")]
    CorruptedData,

    /// No empty slot is available for a relocation. The caller should erase and rebuild
    /// the storage area.
    #[error("no free slot available")]
    NoFreeSlot,

    /// The startup scan found a slot that neither validates nor belongs to an interrupted
    /// commit that could be resolved.
    #[error("storage did not validate")]
    InvalidStorage,

    /// The error value returned from the flash driver. Once a write or erase has failed the
    /// engine refuses further mutations until it is reconstructed.
    #[error("internal flash error")]
    Flash,
}
