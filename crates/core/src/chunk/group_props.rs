//! Property tests for chunk layout.

use proptest::prelude::*;

use super::backoff::NoBackoff;
use super::group::ChunkGroup;
use crate::request::{UploadProps, UploadRequest};

proptest! {
    #[test]
    fn chunk_count_is_ceiling_of_size_over_chunk(size in 1u64..10_000_000, chunk in 1u64..2_000_000) {
        let mut req = UploadRequest::from_bytes(UploadProps::new("p", size), Vec::new());
        let group = ChunkGroup::new(&mut req, chunk, Box::new(NoBackoff), false, std::env::temp_dir());

        prop_assert_eq!(group.num() as u64, size.div_ceil(chunk));
    }

    #[test]
    fn chunks_cover_the_upload_exactly(size in 0u64..5_000_000, chunk in 0u64..1_000_000) {
        let mut req = UploadRequest::from_bytes(UploadProps::new("p", size), Vec::new());
        let mut group = ChunkGroup::new(&mut req, chunk, Box::new(NoBackoff), false, std::env::temp_dir());

        let mut expected_start = 0u64;
        let mut indexes = Vec::new();
        while group.next() {
            let info = group.info().unwrap();
            prop_assert_eq!(info.start, expected_start);
            prop_assert!(info.length <= group.chunk_size() || group.chunk_size() == 0);
            expected_start += info.length;
            indexes.push(info.index);
        }

        prop_assert_eq!(expected_start, size);
        prop_assert_eq!(indexes, (0..group.num()).collect::<Vec<_>>());
    }
}
