use core::fmt;

/// A 32-bit router word (key, mask or packed route) printed as fixed-width
/// hexadecimal.
#[derive(Clone, Copy)]
pub struct HexWord(u32);

impl fmt::Display for HexWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::Debug for HexWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    fn hex(&self) -> HexWord;
}

impl HexDisplayExt for u32 {
    fn hex(&self) -> HexWord {
        HexWord(*self)
    }
}
