//! Property tests for string descriptor handling
//!
//! Run with: `cargo test -p protocol --test descriptor_props`

use protocol::descriptor::DT_STRING;
use protocol::{DriverError, StringDescriptor};
use proptest::prelude::*;

fn encode(s: &str) -> Vec<u8> {
    let mut buf = vec![0u8, DT_STRING];
    for unit in s.encode_utf16() {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf[0] = buf.len() as u8;
    buf
}

proptest! {
    #[test]
    fn parse_never_exceeds_reply(index in any::<u8>(), buf in proptest::collection::vec(any::<u8>(), 0..255)) {
        match StringDescriptor::parse(index, &buf) {
            Ok(desc) => {
                prop_assert!(desc.len() <= buf.len());
                prop_assert_eq!(desc.as_bytes(), &buf[..desc.len()]);
            }
            Err(e) => prop_assert_eq!(e, DriverError::NoData),
        }
    }

    #[test]
    fn ascii_strings_decode(s in "[ -~]{0,120}") {
        let desc = StringDescriptor::parse(1, &encode(&s)).unwrap();
        prop_assert_eq!(desc.to_string_lossy(), s);
    }
}

#[test]
fn test_empty_reply_is_no_data() {
    assert_eq!(StringDescriptor::parse(0, &[]), Err(DriverError::NoData));
}
