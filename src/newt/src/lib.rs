pub mod bitflags;
pub mod num_enum;

pub use bitflags::{BitFlagRange, RawBitFlagRange};
pub use num_enum::{NumEnum, NumEnumMap};
