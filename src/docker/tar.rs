//! Minimal uncompressed tar writer for the build context.
//!
//! The daemon's `/build` endpoint takes a tar archive; ours always contains
//! exactly one entry (the recipe, named `Dockerfile`), so the full tar
//! format is unnecessary. USTAR layout: 512-byte header with octal fields
//! and a space-seeded checksum, payload padded to 512, two zero blocks as
//! the trailer.

const BLOCK: usize = 512;

/// Build a single-entry uncompressed tar archive.
pub fn single_file_archive(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut header = [0u8; BLOCK];

    write_field(&mut header[0..100], name.as_bytes());
    write_octal(&mut header[100..108], 0o644);       // mode
    write_octal(&mut header[108..116], 0);           // uid
    write_octal(&mut header[116..124], 0);           // gid
    write_octal12(&mut header[124..136], contents.len() as u64);
    write_octal12(&mut header[136..148], 0);         // mtime
    header[148..156].copy_from_slice(b"        ");   // checksum seed
    header[156] = b'0';                              // typeflag: regular file
    header[257..263].copy_from_slice(b"ustar\0");
    header[263..265].copy_from_slice(b"00");

    let checksum: u64 = header.iter().map(|&b| b as u64).sum();
    let chksum_text = format!("{:06o}\0 ", checksum);
    header[148..156].copy_from_slice(chksum_text.as_bytes());

    let padded_len = contents.len().div_ceil(BLOCK) * BLOCK;
    let mut archive = Vec::with_capacity(BLOCK + padded_len + 2 * BLOCK);
    archive.extend_from_slice(&header);
    archive.extend_from_slice(contents);
    archive.resize(BLOCK + padded_len, 0);
    archive.resize(BLOCK + padded_len + 2 * BLOCK, 0);
    archive
}

fn write_field(dest: &mut [u8], value: &[u8]) {
    let len = value.len().min(dest.len());
    dest[..len].copy_from_slice(&value[..len]);
}

fn write_octal(dest: &mut [u8], value: u64) {
    // 7 octal digits + NUL.
    let text = format!("{:07o}\0", value);
    dest.copy_from_slice(text.as_bytes());
}

fn write_octal12(dest: &mut [u8], value: u64) {
    // 11 octal digits + NUL.
    let text = format!("{:011o}\0", value);
    dest.copy_from_slice(text.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_layout() {
        let archive = single_file_archive("Dockerfile", b"FROM node:20\n");
        // Header + one data block + two trailer blocks.
        assert_eq!(archive.len(), 4 * BLOCK);
        assert_eq!(&archive[0..10], b"Dockerfile");
        assert_eq!(archive[10], 0);
        // Payload starts at the second block.
        assert_eq!(&archive[BLOCK..BLOCK + 13], b"FROM node:20\n");
        // Padding and trailer are zeroed.
        assert!(archive[BLOCK + 13..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_size_field_is_octal() {
        let archive = single_file_archive("Dockerfile", &[b'x'; 13]);
        let size_field = std::str::from_utf8(&archive[124..135]).unwrap();
        assert_eq!(size_field, "00000000015"); // 13 decimal = 15 octal
    }

    #[test]
    fn test_checksum_validates() {
        let archive = single_file_archive("Dockerfile", b"FROM scratch\n");
        let header = &archive[..BLOCK];
        let stored = std::str::from_utf8(&header[148..154]).unwrap();
        let stored = u64::from_str_radix(stored, 8).unwrap();
        // Recompute with the checksum field treated as spaces.
        let mut sum: u64 = 0;
        for (i, &b) in header.iter().enumerate() {
            sum += if (148..156).contains(&i) { b' ' as u64 } else { b as u64 };
        }
        assert_eq!(stored, sum);
    }

    #[test]
    fn test_ustar_magic() {
        let archive = single_file_archive("Dockerfile", b"");
        assert_eq!(&archive[257..263], b"ustar\0");
        assert_eq!(&archive[263..265], b"00");
        assert_eq!(archive[156], b'0');
    }

    #[test]
    fn test_exact_block_payload_has_no_extra_padding() {
        let archive = single_file_archive("Dockerfile", &[b'a'; BLOCK]);
        // Header + exactly one data block + trailer.
        assert_eq!(archive.len(), BLOCK + BLOCK + 2 * BLOCK);
    }

    #[test]
    fn test_empty_payload() {
        let archive = single_file_archive("Dockerfile", b"");
        assert_eq!(archive.len(), BLOCK + 2 * BLOCK);
    }
}
