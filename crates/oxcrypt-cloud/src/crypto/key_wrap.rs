#![forbid(unsafe_code)]

//! AES key wrapping (RFC 3394) with a 256-bit key encryption key.
//!
//! Master key files store the AES and MAC keys wrapped under a KEK derived
//! from the vault password. An unwrap with the wrong KEK fails the integrity
//! check, which is how a wrong password is detected.

use aes::Aes256;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use generic_array::GenericArray;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// Default initial value from RFC 3394 section 2.2.3.1.
const DEFAULT_IV: [u8; 8] = [0xA6; 8];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WrapError {
    #[error("Plaintext length must be a non-zero multiple of 64 bits")]
    InvalidPlaintextLength,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UnwrapError {
    #[error("Ciphertext length must be a multiple of 64 bits")]
    InvalidCiphertextLength,
    #[error("Ciphertext must hold at least two 64-bit blocks")]
    CiphertextTooShort,
    #[error("Integrity check failed")]
    InvalidIntegrityCheck,
}

/// Wrap `plaintext` under `kek`.
///
/// The output is 8 bytes longer than the input.
pub fn wrap_key(plaintext: &[u8], kek: &[u8; 32]) -> Result<Vec<u8>, WrapError> {
    if plaintext.is_empty() || plaintext.len() % 8 != 0 {
        return Err(WrapError::InvalidPlaintextLength);
    }

    let cipher = Aes256::new(GenericArray::from_slice(kek));
    let n = plaintext.len() / 8;
    let mut a = DEFAULT_IV;
    let mut registers = Zeroizing::new(plaintext.to_vec());
    let mut block = GenericArray::from([0u8; 16]);

    for j in 0..6 {
        for (i, r) in registers.chunks_exact_mut(8).enumerate() {
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(r);
            cipher.encrypt_block(&mut block);

            let t = ((n * j) + i + 1) as u64;
            a.copy_from_slice(&block[..8]);
            for (a_byte, t_byte) in a.iter_mut().zip(t.to_be_bytes()) {
                *a_byte ^= t_byte;
            }
            r.copy_from_slice(&block[8..]);
        }
    }

    let mut out = Vec::with_capacity(plaintext.len() + 8);
    out.extend_from_slice(&a);
    out.extend_from_slice(&registers);
    Ok(out)
}

/// Unwrap `ciphertext` under `kek`.
///
/// A wrong KEK surfaces as [`UnwrapError::InvalidIntegrityCheck`].
pub fn unwrap_key(ciphertext: &[u8], kek: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>, UnwrapError> {
    if ciphertext.len() % 8 != 0 {
        return Err(UnwrapError::InvalidCiphertextLength);
    }
    if ciphertext.len() < 16 {
        return Err(UnwrapError::CiphertextTooShort);
    }

    let cipher = Aes256::new(GenericArray::from_slice(kek));
    let n = ciphertext.len() / 8 - 1;
    let mut a = [0u8; 8];
    a.copy_from_slice(&ciphertext[..8]);
    let mut registers = Zeroizing::new(ciphertext[8..].to_vec());
    let mut block = GenericArray::from([0u8; 16]);

    for j in (0..6).rev() {
        for (i, r) in registers.chunks_exact_mut(8).enumerate().rev() {
            let t = ((n * j) + i + 1) as u64;
            for (a_byte, t_byte) in a.iter_mut().zip(t.to_be_bytes()) {
                *a_byte ^= t_byte;
            }
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(r);
            cipher.decrypt_block(&mut block);

            a.copy_from_slice(&block[..8]);
            r.copy_from_slice(&block[8..]);
        }
    }

    if bool::from(a[..].ct_eq(&DEFAULT_IV[..])) {
        Ok(registers)
    } else {
        Err(UnwrapError::InvalidIntegrityCheck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const KEK: [u8; 32] = hex!("000102030405060708090A0B0C0D0E0F101112131415161718191A1B1C1D1E1F");

    #[test]
    fn test_wrap_128_key_with_256_kek() {
        let key_data = hex!("00112233445566778899AABBCCDDEEFF");
        let expected = hex!("64E8C3F9CE0F5BA2 63E9777905818A2A 93C8191E7D6E8AE7");

        assert_eq!(wrap_key(&key_data, &KEK).unwrap(), expected);
        assert_eq!(unwrap_key(&expected, &KEK).unwrap().as_slice(), key_data);
    }

    #[test]
    fn test_wrap_192_key_with_256_kek() {
        let key_data = hex!("00112233445566778899AABBCCDDEEFF0001020304050607");
        let expected = hex!("A8F9BC1612C68B3F F6E6F4FBE30E71E4 769C8B80A32CB895 8CD5D17D6B254DA1");

        assert_eq!(wrap_key(&key_data, &KEK).unwrap(), expected);
        assert_eq!(unwrap_key(&expected, &KEK).unwrap().as_slice(), key_data);
    }

    #[test]
    fn test_wrap_256_key_with_256_kek() {
        let key_data = hex!("00112233445566778899AABBCCDDEEFF000102030405060708090A0B0C0D0E0F");
        let expected = hex!(
            "28C9F404C4B810F4 CBCCB35CFB87F826 3F5786E2D80ED326 CBC7F0E71A99F43B FB988B9B7A02DD21"
        );

        assert_eq!(wrap_key(&key_data, &KEK).unwrap(), expected);
        assert_eq!(unwrap_key(&expected, &KEK).unwrap().as_slice(), key_data);
    }

    #[test]
    fn test_unwrap_with_wrong_kek() {
        let wrong_kek = hex!("36b0144a13d0b5c1950c435762ff47789ab64258763f6f980f66dc00c11697cd");
        let wrapped = hex!("A8F9BC1612C68B3F F6E6F4FBE30E71E4 769C8B80A32CB895 8CD5D17D6B254DA1");

        assert_eq!(
            unwrap_key(&wrapped, &wrong_kek).unwrap_err(),
            UnwrapError::InvalidIntegrityCheck
        );
    }

    #[test]
    fn test_invalid_lengths() {
        assert_eq!(
            wrap_key(&hex!("00112233445566778899AABBCCDDEEFFF123"), &KEK).unwrap_err(),
            WrapError::InvalidPlaintextLength
        );
        assert_eq!(
            unwrap_key(&hex!("A8F9BC1612C68B3F F6E6F4FBE30E"), &KEK).unwrap_err(),
            UnwrapError::InvalidCiphertextLength
        );
        assert_eq!(
            unwrap_key(&hex!("A8F9BC1612C68B3F"), &KEK).unwrap_err(),
            UnwrapError::CiphertextTooShort
        );
    }
}
