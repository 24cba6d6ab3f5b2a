//! The `.note.gnu.build-id` section. The note header and name are written
//! with the rest of the image; the digest itself can only be computed after
//! the whole image exists, so `write_build_id` runs as the final pass.

use crate::config::BuildIdKind;
use crate::config::Config;
use crate::context::WriteCx;
use crate::elf::GNU_NOTE_NAME;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::EntropySourceFailure;
use crate::error::Result;
use crate::section::SectionBase;
use crate::section::SyntheticSection;
use anyhow::Context as _;
use md5::Digest as _;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSliceMut;

/// Hash inputs are split into chunks of this size so the digest pass can use
/// every core: each chunk is hashed independently and the concatenated chunk
/// digests are hashed once more.
const HASH_CHUNK_SIZE: usize = 1024 * 1024;

pub struct BuildIdSection {
    pub base: SectionBase,
    hash_size: usize,
}

impl BuildIdSection {
    pub fn new() -> Self {
        BuildIdSection {
            base: SectionBase::new(
                secnames::NOTE_GNU_BUILD_ID_SECTION_NAME,
                sht::NOTE,
                shf::ALLOC,
                4,
            ),
            hash_size: 0,
        }
    }

    pub fn finalize(&mut self, config: &Config) {
        if self.base.finalized {
            return;
        }
        self.base.finalized = true;
        self.hash_size = config.build_id.hash_size();
        self.base.size = if self.hash_size == 0 {
            0
        } else {
            // Note header, "GNU\0", then the digest.
            12 + GNU_NOTE_NAME.len() as u64 + self.hash_size as u64
        };
    }

    /// Offset of the digest bytes within the section.
    fn hash_offset(&self) -> usize {
        12 + GNU_NOTE_NAME.len()
    }

    /// Fills in the digest. `image` is the complete output image;
    /// `section_file_offset` is where this section's bytes live in it.
    pub fn write_build_id(
        &self,
        image: &mut [u8],
        section_file_offset: usize,
        config: &Config,
    ) -> Result {
        if self.hash_size == 0 {
            return Ok(());
        }
        let hash_at = section_file_offset + self.hash_offset();
        let digest = match &config.build_id {
            BuildIdKind::None => return Ok(()),
            BuildIdKind::Fast => {
                chunked_hash(image, 8, |chunk| {
                    xxhash_rust::xxh64::xxh64(chunk, 0).to_le_bytes().to_vec()
                })
            }
            BuildIdKind::Md5 => chunked_hash(image, 16, |chunk| {
                md5::Md5::digest(chunk).to_vec()
            }),
            BuildIdKind::Sha1 => chunked_hash(image, 20, |chunk| {
                use sha1::Digest as _;
                sha1::Sha1::digest(chunk).to_vec()
            }),
            BuildIdKind::Uuid => {
                let mut bytes = [0u8; 16];
                getrandom::fill(&mut bytes)
                    .map_err(|_| EntropySourceFailure)
                    .context("failed to generate UUID build ID")?;
                uuid::Builder::from_random_bytes(bytes)
                    .into_uuid()
                    .into_bytes()
                    .to_vec()
            }
            BuildIdKind::Hex(bytes) => bytes.clone(),
        };
        image[hash_at..hash_at + digest.len()].copy_from_slice(&digest);
        Ok(())
    }
}

/// Computes a digest of `data`: hash 1 MiB chunks in parallel, then hash the
/// concatenation of the chunk digests.
fn chunked_hash(data: &[u8], hash_size: usize, hash_fn: impl Fn(&[u8]) -> Vec<u8> + Sync) -> Vec<u8> {
    let chunks: Vec<&[u8]> = data.chunks(HASH_CHUNK_SIZE).collect();
    let mut hashes = vec![0u8; chunks.len() * hash_size];
    chunks
        .par_iter()
        .zip(hashes.par_chunks_mut(hash_size))
        .for_each(|(chunk, out)| {
            out.copy_from_slice(&hash_fn(chunk));
        });
    hash_fn(&hashes)
}

impl SyntheticSection for BuildIdSection {
    fn base(&self) -> &SectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SectionBase {
        &mut self.base
    }

    fn write_to(&self, cx: &WriteCx, buf: &mut [u8]) -> Result {
        if self.hash_size == 0 {
            return Ok(());
        }
        let format = cx.config.format;
        format.write_u32(buf, 0, 4); // name size
        format.write_u32(buf, 4, self.hash_size as u32); // content size
        format.write_u32(buf, 8, object::elf::NT_GNU_BUILD_ID);
        buf[12..16].copy_from_slice(GNU_NOTE_NAME);
        // The digest area is filled by write_build_id once the image is
        // complete.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_hash_matches_the_two_level_scheme() {
        // Two 1 MiB chunks of zeros: hash each, concatenate the two equal
        // digests, hash again.
        let data = vec![0u8; 2 * HASH_CHUNK_SIZE];
        let chunk_digest = xxhash_rust::xxh64::xxh64(&data[..HASH_CHUNK_SIZE], 0);
        let mut concatenated = Vec::new();
        concatenated.extend_from_slice(&chunk_digest.to_le_bytes());
        concatenated.extend_from_slice(&chunk_digest.to_le_bytes());
        let expected = xxhash_rust::xxh64::xxh64(&concatenated, 0).to_le_bytes();

        let got = chunked_hash(&data, 8, |chunk| {
            xxhash_rust::xxh64::xxh64(chunk, 0).to_le_bytes().to_vec()
        });
        assert_eq!(got, expected);
    }

    #[test]
    fn deterministic_kinds_are_deterministic() {
        let data = vec![0x5au8; 3 * HASH_CHUNK_SIZE + 17];
        let a = chunked_hash(&data, 16, |chunk| md5::Md5::digest(chunk).to_vec());
        let b = chunked_hash(&data, 16, |chunk| md5::Md5::digest(chunk).to_vec());
        assert_eq!(a, b);
    }
}
