//! Wire discriminators.
//!
//! Value tags live in `0x01..=0x3F`, marker tags in `0x80..`. A top-level
//! value message is written as a bare value, so the first byte alone decides
//! whether a message is a value or a marker. All integers are little-endian
//! and fixed-width; lengths and counts are `u32`.

pub const NONE: u8 = 0x01;
pub const FALSE: u8 = 0x02;
pub const TRUE: u8 = 0x03;
pub const INT: u8 = 0x04;
pub const FLOAT: u8 = 0x05;
pub const STR: u8 = 0x06;
pub const BYTES: u8 = 0x07;
pub const LIST: u8 = 0x08;
pub const MAP: u8 = 0x09;
pub const REF: u8 = 0x0A;

pub const SYNC: u8 = 0x80;
pub const RESULT: u8 = 0x81;
pub const ERROR: u8 = 0x82;
pub const BIND: u8 = 0x83;
pub const EXT_BIND: u8 = 0x84;
pub const DELETE: u8 = 0x85;
pub const THREAD_SWITCH: u8 = 0x86;
pub const STACKTRACE: u8 = 0x87;
pub const CHECKPOINT: u8 = 0x88;
pub const MONITOR: u8 = 0x89;

/// Payload kind following a BIND handle.
pub const BIND_DATA: u8 = 0x00;
pub const BIND_PROXY: u8 = 0x01;

pub fn is_value_tag(tag: u8) -> bool {
    (NONE..=REF).contains(&tag)
}

pub fn is_marker_tag(tag: u8) -> bool {
    (SYNC..=MONITOR).contains(&tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_and_marker_tags_never_alias() {
        for tag in 0u8..=255 {
            assert!(!(is_value_tag(tag) && is_marker_tag(tag)), "tag {:#x}", tag);
        }
        assert!(is_value_tag(REF));
        assert!(is_marker_tag(MONITOR));
        assert!(!is_value_tag(0x00));
    }
}
