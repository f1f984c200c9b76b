#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use nvm_pages::{Config, ObjectDescriptor, PageDescriptor, PageType};

// Tiny erase units keep the wear tests fast; the engine never assumes more.
pub const SLOT_SIZE: usize = 64;
pub const WORD_SIZE: usize = 1;

// Standard layout used across the suite: two normal pages and one wear page, with one
// spare slot. The wear page holds a single u16, so a slot fits (64 - 8) / 4 = 14 records.
pub const SETTINGS: &[ObjectDescriptor] = &[
    ObjectDescriptor { object_id: 1, size: 4 },
    ObjectDescriptor { object_id: 2, size: 8 },
];
pub const CALIBRATION: &[ObjectDescriptor] = &[ObjectDescriptor { object_id: 1, size: 16 }];
pub const COUNTER: &[ObjectDescriptor] = &[ObjectDescriptor { object_id: 1, size: 2 }];

pub const PAGES: &[PageDescriptor] = &[
    PageDescriptor { page_id: 1, page_type: PageType::Normal, objects: SETTINGS },
    PageDescriptor { page_id: 2, page_type: PageType::Normal, objects: CALIBRATION },
    PageDescriptor { page_id: 3, page_type: PageType::Wear, objects: COUNTER },
];

pub const WEAR_RECORDS_PER_SLOT: usize = (SLOT_SIZE - 8) / 4;

pub fn config_with_threshold(static_wear_threshold: u16) -> Config<'static> {
    Config {
        slots: 4,
        slot_size: SLOT_SIZE as u32,
        base_address: 0,
        static_wear_threshold,
        pages: PAGES,
    }
}

pub fn config() -> Config<'static> {
    config_with_threshold(100)
}

/// Physical slot currently carrying `watermark`, straight from the raw image.
pub fn slot_of(buf: &[u8], watermark: u16) -> Option<usize> {
    buf.chunks(SLOT_SIZE)
        .position(|slot| u16::from_le_bytes([slot[0], slot[1]]) == watermark)
}

#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    /// Every operation from this index on fails, modelling power loss.
    pub fail_after_operation: usize,
    /// Exactly this operation fails, modelling a transient driver error.
    pub fail_at_operation: Option<usize>,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(slots: usize) -> Self {
        Self {
            buf: vec![0xffu8; SLOT_SIZE * slots],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(slots: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; SLOT_SIZE * slots],
            fail_after_operation,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.fail_at_operation = None;
    }

    fn faulting(&mut self) -> bool {
        if self.fail_at_operation == Some(self.operations.len()) {
            self.fail_at_operation = None;
            return true;
        }
        self.operations.len() >= self.fail_after_operation
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if self.faulting() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = SLOT_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as u32));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as u32));

        if self.faulting() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(!bytes.is_empty());

        if self.faulting() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR programming can only flip bits from 1 to 0.
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}
