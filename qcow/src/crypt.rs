// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-sector AES-128-CBC used by encrypted images.
//!
//! Every 512-byte sector is an independent CBC stream whose IV is the little-endian sector
//! number followed by eight zero bytes. There is no integrity check: decrypting with the
//! wrong key silently yields garbage.

use std::fmt::{self, Debug, Formatter};

use aes::cipher::consts::U16;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use aes::Aes128;

use crate::SECTOR_SIZE;

pub const KEY_SIZE: usize = 16;
const BLOCK_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES key schedule derived from a passphrase.
#[derive(Clone)]
pub struct SectorCipher {
    cipher: Aes128,
}

impl SectorCipher {
    /// The passphrase is truncated or zero padded to 16 bytes.
    pub fn new(passphrase: &[u8]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        let len = passphrase.len().min(KEY_SIZE);
        key[..len].copy_from_slice(&passphrase[..len]);
        SectorCipher {
            cipher: Aes128::new(&GenericArray::from(key)),
        }
    }

    fn iv(sector: u64) -> GenericArray<u8, U16> {
        let mut iv = [0u8; BLOCK_SIZE];
        iv[..8].copy_from_slice(&sector.to_le_bytes());
        GenericArray::from(iv)
    }

    /// Encrypts `buf` in place. `buf` holds whole sectors, the first one being `sector`.
    pub fn encrypt_sectors(&self, mut sector: u64, buf: &mut [u8]) {
        for data in buf.chunks_exact_mut(SECTOR_SIZE as usize) {
            let mut encryptor = Aes128CbcEnc::inner_iv_init(self.cipher.clone(), &Self::iv(sector));
            for block in data.chunks_exact_mut(BLOCK_SIZE) {
                encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            sector += 1;
        }
    }

    /// Decrypts `buf` in place. `buf` holds whole sectors, the first one being `sector`.
    pub fn decrypt_sectors(&self, mut sector: u64, buf: &mut [u8]) {
        for data in buf.chunks_exact_mut(SECTOR_SIZE as usize) {
            let mut decryptor = Aes128CbcDec::inner_iv_init(self.cipher.clone(), &Self::iv(sector));
            for block in data.chunks_exact_mut(BLOCK_SIZE) {
                decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            sector += 1;
        }
    }
}

impl Debug for SectorCipher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn first_block_matches_fips_197() {
        let key: Vec<u8> = (0u8..16).collect();
        let cipher = SectorCipher::new(&key);
        // Sector 0 has an all-zero IV, so the first block is plain AES.
        let mut buf = hex("00112233445566778899aabbccddeeff").repeat(32);
        cipher.encrypt_sectors(0, &mut buf);
        assert_eq!(buf[..16], hex("69c4e0d86a7b0430d8cdb78070b4c55a")[..]);
    }

    #[test]
    fn iv_is_little_endian_sector_number() {
        let key: Vec<u8> = (0u8..16).collect();
        let cipher = SectorCipher::new(&key);
        let mut buf = vec![0u8; 1024];
        cipher.encrypt_sectors(0, &mut buf);
        // The second sector is encrypted with the IV of sector 1.
        assert_eq!(buf[512..528], hex("e37cd363dd7c87a09aff0e3e60e09c82")[..]);
        assert_eq!(buf[528..544], hex("4c2a00ebf9374a6ea4784775870112fb")[..]);
    }

    #[test]
    fn short_passphrase_is_zero_padded() {
        let cipher = SectorCipher::new(b"secret");
        let mut buf = vec![0x55u8; 512];
        cipher.encrypt_sectors(10, &mut buf);
        assert_eq!(buf[..16], hex("139ec6213aaa3fec21b8e27ad99b5f00")[..]);
        assert_eq!(buf[496..], hex("118a1c2168c1168e70055fabc32c42ba")[..]);

        cipher.decrypt_sectors(10, &mut buf);
        assert_eq!(buf, vec![0x55u8; 512]);
    }

    #[test]
    fn long_passphrase_is_truncated() {
        let a = SectorCipher::new(b"0123456789abcdefIGNORED");
        let b = SectorCipher::new(b"0123456789abcdef");
        let mut x = vec![7u8; 512];
        let mut y = x.clone();
        a.encrypt_sectors(3, &mut x);
        b.encrypt_sectors(3, &mut y);
        assert_eq!(x, y);
    }

    #[test]
    fn wrong_key_yields_garbage() {
        let mut buf = vec![0x55u8; 512];
        SectorCipher::new(b"secret").encrypt_sectors(10, &mut buf);
        SectorCipher::new(b"other").decrypt_sectors(10, &mut buf);
        assert_ne!(buf, vec![0x55u8; 512]);
    }
}
