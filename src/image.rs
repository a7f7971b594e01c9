//! Builds the binary image programmed into QSPI flash before a verification
//! run. The image is the LFSR word stream for a seed; the board later
//! regenerates the same stream from the same seed and compares while reading
//! the flash back.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::info;

use crate::prng::{lfsr_next, Lfsr};

/// Words per image. One page burst per poll cycle keeps the board-side read
/// under a second; the flash part itself holds 1024 * 1024 words.
pub const IMAGE_WORDS: usize = 1024 * 128;

/// Size of the generated file in bytes.
pub const IMAGE_BYTES: usize = IMAGE_WORDS * 4;

/// Write the verification image for `seed` to `path`, overwriting any
/// previous image. The first word of the file is `lfsr_next(seed)`; words
/// are stored little-endian.
pub fn write_verify_image(path: &Path, seed: u32) -> io::Result<()> {
    info!(
        "Writing {} with random data (seed={:#010x}, expected first word {:#010x})",
        path.display(),
        seed,
        lfsr_next(seed)
    );
    let mut out = BufWriter::new(File::create(path)?);
    let mut lfsr = Lfsr::new(seed);
    for _ in 0..IMAGE_WORDS {
        out.write_all(&lfsr.next_word().to_le_bytes())?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn image_has_exact_size_and_leading_word() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("random_data.bin");
        write_verify_image(&path, 0x1234_5678).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), IMAGE_BYTES);
        assert_eq!(bytes[..4], lfsr_next(0x1234_5678).to_le_bytes());
    }

    #[test]
    fn same_seed_writes_identical_images() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.bin");
        let second = dir.path().join("b.bin");
        write_verify_image(&first, 42).unwrap();
        write_verify_image(&second, 42).unwrap();
        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn different_seeds_diverge() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.bin");
        let second = dir.path().join("b.bin");
        write_verify_image(&first, 1).unwrap();
        write_verify_image(&second, 2).unwrap();
        assert_ne!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }
}
