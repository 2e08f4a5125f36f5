//! Authenticated encryption for enclave secrets
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use aes_gcm_siv::aead::generic_array::GenericArray;
use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
use aes_gcm_siv::{Aes128GcmSiv, Aes256GcmSiv};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::Error;

/// AEAD used to protect snapshots and the snapshot key
pub trait Cryptor: Send + Sync {

    /// Encrypt and authenticate
    ///
    /// # Inputs
    /// * 'key' selects the algorithm by its length
    /// * 'associated_data' is authenticated but not encrypted
    /// * 'plaintext' is the data to protect
    ///
    /// # Returns
    ///
    /// (nonce, ciphertext) on success

    fn seal(&self, key: &[u8], associated_data: &[u8], plaintext: &[u8])
            -> Result<(Vec<u8>, Vec<u8>), Error>;

    /// Authenticate and decrypt what `seal` produced
    fn open(&self, key: &[u8], associated_data: &[u8], ciphertext: &[u8], nonce: &[u8])
            -> Result<Vec<u8>, Error>;
}

/// AES-GCM-SIV: 128-bit keys select AES-128-GCM-SIV, 256-bit keys
/// AES-256-GCM-SIV. A repeated nonce only reveals whether two messages are
/// equal.
#[derive(Copy, Clone, Debug, Default)]
pub struct AesGcmSivCryptor;

impl AesGcmSivCryptor {
    pub const NONCE_SIZE: usize = 12;
}

fn seal_with<C: Aead + KeyInit>(key: &[u8], aad: &[u8], plaintext: &[u8], nonce: &[u8])
                                -> Result<Vec<u8>, Error> {
    let cipher = C::new_from_slice(key).map_err(|_| Error::Crypto("bad key length".into()))?;
    cipher.encrypt(GenericArray::from_slice(nonce), Payload{msg: plaintext, aad: aad})
          .map_err(|_| Error::Crypto("seal failed".into()))
}

fn open_with<C: Aead + KeyInit>(key: &[u8], aad: &[u8], ciphertext: &[u8], nonce: &[u8])
                                -> Result<Vec<u8>, Error> {
    let cipher = C::new_from_slice(key).map_err(|_| Error::Crypto("bad key length".into()))?;
    cipher.decrypt(GenericArray::from_slice(nonce), Payload{msg: ciphertext, aad: aad})
          .map_err(|_| Error::Crypto("authentication failed".into()))
}

impl Cryptor for AesGcmSivCryptor {

    fn seal(&self, key: &[u8], associated_data: &[u8], plaintext: &[u8])
            -> Result<(Vec<u8>, Vec<u8>), Error> {
        let mut nonce = vec![0u8; Self::NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = match key.len() {
            16 => seal_with::<Aes128GcmSiv>(key, associated_data, plaintext, &nonce)?,
            32 => seal_with::<Aes256GcmSiv>(key, associated_data, plaintext, &nonce)?,
            n  => return Err(Error::InvalidArgument(format!("{}-byte key", n))),
        };
        Ok((nonce, ciphertext))
    }

    fn open(&self, key: &[u8], associated_data: &[u8], ciphertext: &[u8], nonce: &[u8])
            -> Result<Vec<u8>, Error> {
        if nonce.len() != Self::NONCE_SIZE {
            return Err(Error::Crypto(format!("{}-byte nonce", nonce.len())));
        }

        return match key.len() {
            16 => open_with::<Aes128GcmSiv>(key, associated_data, ciphertext, nonce),
            32 => open_with::<Aes256GcmSiv>(key, associated_data, ciphertext, nonce),
            n  => Err(Error::InvalidArgument(format!("{}-byte key", n))),
        };
    }
}
