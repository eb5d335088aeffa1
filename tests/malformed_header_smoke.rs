use canopy::format::{IndexHeader, FORMAT_VERSION, HEADER_SIZE, MAGIC};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn malformed_bytes_do_not_panic_header_parsing() {
    let mut rng = StdRng::seed_from_u64(42);
    for round in 0..2_000 {
        let len = rng.gen_range(0..256usize);
        let mut data = vec![0u8; len];
        rng.fill(data.as_mut_slice());
        // Half the inputs get past the magic and version checks
        if round % 2 == 0 && len >= 12 {
            data[..MAGIC.len()].copy_from_slice(&MAGIC);
            data[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        }

        if let Ok(header) = IndexHeader::from_bytes(&data) {
            assert!(data.len() >= HEADER_SIZE);
            let _ = header.file_size();
        }
    }
}
