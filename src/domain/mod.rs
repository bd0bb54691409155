pub mod alarm;
pub mod meter;
pub mod snapshot;
pub mod units;

pub use alarm::*;
pub use meter::*;
pub use snapshot::*;

/// Advance a diagnostic counter, wrapping back to zero at 255.
pub fn bump_counter(value: u8) -> u8 {
    ((u16::from(value) + 1) % 255) as u8
}
