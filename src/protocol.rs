
/// Signature found at register offset 0 of a device in bootloader mode
pub const SIGNATURE: [u8; 4] = *b"BOOT";

/// Default 7-bit bus address of the bootloader
pub const DEFAULT_ADDRESS: u8 = 0x6c;

/// Maximum payload bytes per bus transaction
pub const MAX_CHUNK: usize = 32;

/// Size of the data window exposed by the bootloader
pub const MAX_DATA_LEN: usize = 128;

/// Size of the local page staging buffer, bounding the supported page size
pub const MAX_PAGE_SIZE: usize = 4096;

/// Length of the descriptor header read at handshake
pub const HEADER_LEN: usize = 17;

/// Register offsets in the bootloader address space
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Register {
    /// ASCII signature marker, 4 bytes
    Marker = 0,

    /// Chip identifier, 4 bytes LE
    McuId = 4,

    /// Page size in bytes, 2 bytes LE
    PageSize = 8,

    /// Flash size in kilobytes, 2 bytes LE
    FlashSize = 10,

    /// Application flash start offset, 4 bytes LE
    ProgStart = 12,

    /// Bootloader version, 1 byte
    Version = 16,

    /// Error status of the last flash operation, non-zero on failure
    ErrorStatus = 18,

    /// Program operation code, cleared by the device on completion
    ProgOp = 19,

    /// Flash target address, 4 bytes LE
    Address = 20,

    /// Page data window
    Data = 24,
}

impl Register {
    pub fn offset(self) -> u8 {
        self as u8
    }
}

/// Program operations, written to [`Register::ProgOp`]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProgOp {
    /// Idle, reported by the device once an operation completes
    None = 0,

    /// Erases the page at the target address
    ErasePage = 1,

    /// Loads one page at the cursor into the data window
    Read = 2,

    /// Programs the data window into the page at the cursor
    Write = 3,

    /// Leaves bootloader mode
    Exit = 4,
}

impl ProgOp {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl core::fmt::Display for ProgOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} (0x{:02x})", self, self.code())
    }
}
