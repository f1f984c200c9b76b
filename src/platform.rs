use embedded_storage::nor_flash::NorFlash;

/// The flash driver backing the store. Any NOR-flash driver implementing the
/// `embedded-storage` traits qualifies, as long as it reads and programs with byte
/// granularity (`READ_SIZE == 1`, `WRITE_SIZE == 1`); this is checked once at
/// construction.
pub trait Platform: NorFlash {}

impl<T: NorFlash> Platform for T {}
