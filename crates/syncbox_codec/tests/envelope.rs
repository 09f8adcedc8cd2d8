//! Envelope properties across the compression threshold and inline ceiling.

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use syncbox_codec::{
    decode, encode, inspect_header, Algorithm, AssetStager, EnvelopeOptions, Payload,
    DEFAULT_INLINE_CEILING,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Attachment {
    object_id: String,
    creation: i64,
    modified: i64,
    removed: bool,
    name: String,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

fn attachment(data: Vec<u8>) -> Attachment {
    Attachment {
        object_id: "att-1".into(),
        creation: 1_700_000_000_000,
        modified: 1_700_000_000_500,
        removed: false,
        name: "photo.png".into(),
        data,
    }
}

fn arb_attachment(max_len: usize) -> impl Strategy<Value = Attachment> {
    (
        "[a-z0-9-]{1,36}",
        any::<i64>(),
        any::<i64>(),
        any::<bool>(),
        ".{0,40}",
        prop::collection::vec(any::<u8>(), 0..max_len),
    )
        .prop_map(|(object_id, creation, modified, removed, name, data)| Attachment {
            object_id,
            creation,
            modified,
            removed,
            name,
            data,
        })
}

proptest! {
    #[test]
    fn roundtrip_any_size(value in arb_attachment(4096)) {
        let bytes = encode(&value, &EnvelopeOptions::default()).unwrap();
        prop_assert_eq!(decode::<Attachment>(&bytes).unwrap(), value);
    }

    #[test]
    fn roundtrip_repetitive_bodies(byte in any::<u8>(), len in 0usize..8192) {
        let value = attachment(vec![byte; len]);
        let bytes = encode(&value, &EnvelopeOptions::default()).unwrap();
        prop_assert_eq!(decode::<Attachment>(&bytes).unwrap(), value);
    }
}

#[test]
fn fifty_kilobyte_attachment_is_staged_out_of_line() {
    let dir = tempfile::tempdir().unwrap();
    let stager = AssetStager::new(dir.path()).unwrap();

    // A repeating pattern compresses, so make the data incompressible.
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    let data: Vec<u8> = (0..50 * 1024)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            (state >> 33) as u8
        })
        .collect();
    let value = attachment(data);

    let bytes = encode(&value, &EnvelopeOptions::default()).unwrap();
    assert!(bytes.len() > DEFAULT_INLINE_CEILING);
    // Compression triggered but did not help: algorithm byte stays zero.
    assert_eq!(inspect_header(&bytes).unwrap().algorithm, Algorithm::None);

    let payload = Payload::prepare(bytes, DEFAULT_INLINE_CEILING, &stager).unwrap();
    let asset = payload.staged().cloned().expect("payload should be staged");

    let read_back = payload.read().unwrap();
    assert_eq!(decode::<Attachment>(&read_back).unwrap(), value);

    stager.release(&asset).unwrap();
    assert!(!asset.path().exists());
}

#[test]
fn compressible_attachment_sets_algorithm_byte() {
    let value = attachment(vec![0xAB; 50 * 1024]);
    let bytes = encode(&value, &EnvelopeOptions::default()).unwrap();

    assert_eq!(inspect_header(&bytes).unwrap().algorithm, Algorithm::Lz4);
    assert!(bytes.len() < 50 * 1024);
    assert_eq!(decode::<Attachment>(&bytes).unwrap(), value);
}

#[test]
fn below_threshold_is_never_compressed() {
    let value = attachment(vec![0; 16]);
    let bytes = encode(&value, &EnvelopeOptions::default()).unwrap();
    assert_eq!(inspect_header(&bytes).unwrap().algorithm, Algorithm::None);
}
