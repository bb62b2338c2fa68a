//! Page codec: AES-128-CBC over exactly one `BLCKSZ` page.
//!
//! The key and IV are process-wide constants, as in the original enclave
//! build. A static IV is insecure against a chosen-plaintext multi-page
//! attacker; it is preserved here because the surrounding protocol (real
//! block numbers recovered from decrypted special areas, dummy re-inits on
//! eviction) is specified against this exact contract.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;

use crate::common::BLCKSZ;
use crate::error::{Result, SoeError};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const KEY: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x10, 0x11, 0x12, 0x13, 0x14,
    0x15,
];

const IV: [u8; 16] = [
    0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa, 0x99, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11,
    0x00,
];

/// Encrypt one page. `plaintext` and `ciphertext` must both be `BLCKSZ`
/// bytes; either the full ciphertext is produced or the call fails.
pub fn page_encryption(plaintext: &[u8], ciphertext: &mut [u8]) -> Result<()> {
    if plaintext.len() != BLCKSZ || ciphertext.len() != BLCKSZ {
        return Err(SoeError::CryptoFault(format!(
            "page codec requires {} byte buffers, got {}/{}",
            BLCKSZ,
            plaintext.len(),
            ciphertext.len()
        )));
    }
    Aes128CbcEnc::new(&KEY.into(), &IV.into())
        .encrypt_padded_b2b_mut::<NoPadding>(plaintext, ciphertext)
        .map_err(|e| SoeError::CryptoFault(format!("cbc encrypt: {e}")))?;
    Ok(())
}

/// Decrypt one page; the exact inverse of [`page_encryption`].
pub fn page_decryption(ciphertext: &[u8], plaintext: &mut [u8]) -> Result<()> {
    if ciphertext.len() != BLCKSZ || plaintext.len() != BLCKSZ {
        return Err(SoeError::CryptoFault(format!(
            "page codec requires {} byte buffers, got {}/{}",
            BLCKSZ,
            ciphertext.len(),
            plaintext.len()
        )));
    }
    Aes128CbcDec::new(&KEY.into(), &IV.into())
        .decrypt_padded_b2b_mut::<NoPadding>(ciphertext, plaintext)
        .map_err(|e| SoeError::CryptoFault(format!("cbc decrypt: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let mut plain = vec![0u8; BLCKSZ];
        for (i, b) in plain.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let mut cipher = vec![0u8; BLCKSZ];
        let mut back = vec![0u8; BLCKSZ];
        page_encryption(&plain, &mut cipher).unwrap();
        assert_ne!(plain, cipher);
        page_decryption(&cipher, &mut back).unwrap();
        assert_eq!(plain, back);
    }

    #[test]
    fn test_rejects_short_buffers() {
        let plain = vec![0u8; 16];
        let mut cipher = vec![0u8; BLCKSZ];
        assert!(page_encryption(&plain, &mut cipher).is_err());
    }

    #[test]
    fn test_encryption_is_deterministic() {
        // Fixed key and IV: identical plaintexts encrypt identically. This
        // is the documented (weak) contract, not an accident.
        let plain = vec![0xABu8; BLCKSZ];
        let mut c1 = vec![0u8; BLCKSZ];
        let mut c2 = vec![0u8; BLCKSZ];
        page_encryption(&plain, &mut c1).unwrap();
        page_encryption(&plain, &mut c2).unwrap();
        assert_eq!(c1, c2);
    }
}
