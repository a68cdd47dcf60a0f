#![no_main]

use libfuzzer_sys::fuzz_target;

use rtsp_core::codec::annexb::{annexb_marshal, annexb_unmarshal, avcc_marshal, avcc_unmarshal};

fuzz_target!(|data: &[u8]| {
    if let Ok(nalus) = annexb_unmarshal(data) {
        if let Ok(marshaled) = annexb_marshal(&nalus) {
            let reunmarshaled = annexb_unmarshal(&marshaled).expect("re-parse of our own marshal must succeed");
            assert_eq!(nalus, reunmarshaled);
        }
    }

    // AVCC framing is a distinct length-prefixed encoding over the same NALU
    // lists; exercise it with the same input interpreted as length-prefixed.
    if let Ok(nalus) = avcc_unmarshal(data) {
        if let Ok(marshaled) = avcc_marshal(&nalus) {
            let reunmarshaled = avcc_unmarshal(&marshaled).expect("re-parse of our own marshal must succeed");
            assert_eq!(nalus, reunmarshaled);
        }
    }
});
