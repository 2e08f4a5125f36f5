//! Encrypted snapshots of enclave memory and the snapshot key handshake
//!
//! A snapshot seals every memory region with a fresh key that never leaves
//! the enclave in the clear. The forked child gets the key from the parent
//! over a socket pair: both sides exchange X25519 public keys, derive a
//! transfer key with SHA3-256 and the parent sends the snapshot key sealed
//! under it. Frames on the socket are a little-endian u32 length followed
//! by the bytes.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use curve25519_dalek::constants::X25519_BASEPOINT;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use edge::alloc::HostBuffer;
use edge::snapshot::{MemoryLayout, SnapshotEntry, SnapshotEntryRef, SnapshotLayout};
use log::debug;
use rand::RngCore;
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};
use zeroize::{Zeroize, Zeroizing};

use crate::Error;
use crate::crypto::Cryptor;
use crate::ocall::{errno, HostCalls};

/// Size of snapshot keys
pub const SNAPSHOT_KEY_SIZE: usize = 32;

/// Largest handshake frame
pub const FRAME_MAX: usize = 4096;

const TRANSFER_LABEL: &[u8] = b"enclave snapshot key transfer v1";
const ACK: u8 = 1;

/// Fresh random snapshot key
pub fn generate_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; SNAPSHOT_KEY_SIZE]);
    OsRng.fill_bytes(&mut key);
    key
}

/// Seal every region of `layout`
///
/// # Safety
///
/// Every region of `layout` must be mapped and readable.
///
/// # Returns
///
/// The snapshot, with ciphertexts and nonces in host buffers

pub unsafe fn take_snapshot(layout: &MemoryLayout, cryptor: &dyn Cryptor, key: &[u8])
                            -> Result<SnapshotLayout, Error> {
    let mut snapshot = SnapshotLayout::default();
    for region in layout.regions() {
        let plaintext = core::slice::from_raw_parts(region.base as *const u8, region.size);
        let (nonce, ciphertext) = cryptor.seal(key, &region.associated_data(), plaintext)?;
        snapshot.entries.push(SnapshotEntry{region:     *region,
                                            ciphertext: HostBuffer::from_slice(&ciphertext)?,
                                            nonce:      HostBuffer::from_slice(&nonce)?});
    }

    debug!("snapshot of {} regions taken", snapshot.entries.len());
    Ok(snapshot)
}

/// Decrypt a snapshot and write it back into memory
///
/// Nothing is written unless every region authenticates and matches
/// `layout`.
///
/// # Safety
///
/// Every region of `layout` must be mapped and writable, and nothing else
/// may access it during the call.

pub unsafe fn restore(layout: &MemoryLayout,
                      cryptor: &dyn Cryptor,
                      key: &[u8],
                      entries: &[SnapshotEntryRef])
                      -> Result<(), Error> {

    if entries.len() != layout.regions().len() {
        return Err(Error::Malformed(format!("snapshot has {} regions, enclave has {}",
                                            entries.len(), layout.regions().len())));
    }

    let mut plaintexts = Vec::with_capacity(entries.len());
    for region in layout.regions() {
        let entry = entries.iter()
                           .find(|e| e.region == *region)
                           .ok_or_else(|| Error::Malformed(
                               format!("snapshot has no {:?} region at {:#x}",
                                       region.kind, region.base)))?;
        let plaintext = Zeroizing::new(
            cryptor.open(key, &region.associated_data(), entry.ciphertext, entry.nonce)?);
        if plaintext.len() != region.size {
            return Err(Error::Malformed(format!("{:?} region size changed", region.kind)));
        }
        plaintexts.push((*region, plaintext));
    }

    for (region, plaintext) in &plaintexts {
        core::ptr::copy_nonoverlapping(plaintext.as_ptr(), region.base as *mut u8, region.size);
    }

    debug!("{} regions restored", plaintexts.len());
    Ok(())
}

/// Reliable byte stream for the handshake
pub trait Channel {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Fill `buf` completely
    fn receive(&mut self, buf: &mut [u8]) -> Result<(), Error>;
}

/// Host socket reached through host calls
pub struct HostSocket<'a> {
    host: &'a HostCalls,
    fd:   i32,
}

impl<'a> HostSocket<'a> {
    pub fn new(host: &'a HostCalls, fd: i32) -> Self {
        Self{host: host, fd: fd}
    }
}

fn retry(errno: i32) -> bool {
    errno == libc::EINTR || errno == libc::EAGAIN
}

impl<'a> Channel for HostSocket<'a> {

    fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let mut sent = 0;
        while sent < bytes.len() {
            let rc = self.host.write(self.fd, &bytes[sent ..]);
            if rc < 0 {
                let err = errno();
                if retry(err) {
                    continue;
                }
                return Err(Error::posix(err, "key transfer write"));
            }
            sent += rc as usize;
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut received = 0;
        while received < buf.len() {
            let rc = self.host.read(self.fd, &mut buf[received ..]);
            if rc < 0 {
                let err = errno();
                if retry(err) {
                    continue;
                }
                return Err(Error::posix(err, "key transfer read"));
            }
            if rc == 0 {
                return Err(Error::ConnectionClosed);
            }
            received += rc as usize;
        }
        Ok(())
    }
}

fn send_frame(channel: &mut dyn Channel, bytes: &[u8]) -> Result<(), Error> {
    if bytes.len() > FRAME_MAX {
        return Err(Error::InvalidArgument(format!("{}-byte frame", bytes.len())));
    }
    channel.send(&(bytes.len() as u32).to_le_bytes())?;
    channel.send(bytes)
}

fn receive_frame(channel: &mut dyn Channel) -> Result<Vec<u8>, Error> {
    let mut len = [0u8; 4];
    channel.receive(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > FRAME_MAX {
        return Err(Error::Malformed(format!("{}-byte frame", len)));
    }

    let mut bytes = vec![0u8; len];
    channel.receive(&mut bytes)?;
    Ok(bytes)
}

/* One side's ephemeral key pair */
struct Ephemeral {
    secret: Scalar,
    public: MontgomeryPoint,
}

impl Ephemeral {
    fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let secret = Scalar::from_bytes_mod_order(bytes);
        bytes.zeroize();
        let public = &X25519_BASEPOINT * &secret;
        Self{secret: secret, public: public}
    }
}

/* Exchange public keys and derive the transfer key */
fn agree(channel: &mut dyn Channel, is_parent: bool) -> Result<Zeroizing<Vec<u8>>, Error> {
    let own = Ephemeral::generate();
    send_frame(channel, own.public.as_bytes())?;

    let peer = receive_frame(channel)?;
    if peer.len() != 32 {
        return Err(Error::Malformed(format!("{}-byte public key", peer.len())));
    }
    let mut peer_bytes = [0u8; 32];
    peer_bytes.copy_from_slice(&peer);
    let peer = MontgomeryPoint(peer_bytes);

    let mut shared = (&peer * &own.secret).to_bytes();
    if shared.iter().all(|b| *b == 0) {
        return Err(Error::Crypto("degenerate peer public key".into()));
    }

    let (parent, child) = if is_parent { (own.public, peer) } else { (peer, own.public) };
    let mut hasher = Sha3_256::new();
    hasher.update(TRANSFER_LABEL);
    hasher.update(&shared);
    hasher.update(parent.as_bytes());
    hasher.update(child.as_bytes());
    shared.zeroize();
    Ok(Zeroizing::new(hasher.finalize().to_vec()))
}

/// Parent side of the handshake: send `key` to the child
pub fn send_key(channel: &mut dyn Channel, cryptor: &dyn Cryptor, key: &[u8])
                -> Result<(), Error> {
    let transfer = agree(channel, true)?;
    let (nonce, ciphertext) = cryptor.seal(&transfer, TRANSFER_LABEL, key)?;
    send_frame(channel, &nonce)?;
    send_frame(channel, &ciphertext)?;

    let ack = receive_frame(channel)?;
    if ack != [ACK] {
        return Err(Error::Malformed("child did not acknowledge the key".into()));
    }
    Ok(())
}

/// Child side of the handshake: receive the snapshot key
pub fn receive_key(channel: &mut dyn Channel, cryptor: &dyn Cryptor)
                   -> Result<Zeroizing<Vec<u8>>, Error> {
    let transfer = agree(channel, false)?;
    let nonce = receive_frame(channel)?;
    let ciphertext = receive_frame(channel)?;
    let key = Zeroizing::new(cryptor.open(&transfer, TRANSFER_LABEL, &ciphertext, &nonce)?);
    send_frame(channel, &[ACK])?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;

    use edge::message::MessageWriter;
    use edge::snapshot::RegionKind;

    use crate::application::tests::Image;
    use crate::crypto::AesGcmSivCryptor;

    struct Stream(UnixStream);

    impl Channel for Stream {
        fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
            self.0.write_all(bytes).map_err(|_| Error::ConnectionClosed)
        }

        fn receive(&mut self, buf: &mut [u8]) -> Result<(), Error> {
            self.0.read_exact(buf).map_err(|_| Error::ConnectionClosed)
        }
    }

    fn borrowed(snapshot: &SnapshotLayout) -> Vec<SnapshotEntryRef<'_>> {
        let mut writer = MessageWriter::new();
        snapshot.lend(&mut writer);
        let mut reader = writer.into();
        unsafe { edge::snapshot::borrow_entries(&mut reader).unwrap() }
    }

    #[test]
    fn restore_brings_back_every_region() {
        let mut image = Image::new(16);
        let memory = image.memory();
        for (i, b) in image.bytes().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let original = image.bytes().to_vec();

        let key = generate_key();
        let snapshot = unsafe { take_snapshot(&memory, &AesGcmSivCryptor, &key).unwrap() };
        assert_eq!(snapshot.entries.len(), RegionKind::ALL.len());

        image.bytes().fill(0);
        unsafe { restore(&memory, &AesGcmSivCryptor, &key, &borrowed(&snapshot)).unwrap() };
        assert_eq!(image.bytes(), &original[..]);
    }

    #[test]
    fn wrong_key_leaves_memory_untouched() {
        let mut image = Image::new(8);
        let memory = image.memory();
        image.bytes().fill(0x5a);

        let snapshot = unsafe { take_snapshot(&memory, &AesGcmSivCryptor, &generate_key()).unwrap() };
        image.bytes().fill(0x11);
        let result = unsafe { restore(&memory, &AesGcmSivCryptor, &generate_key(), &borrowed(&snapshot)) };
        assert!(matches!(result, Err(Error::Crypto(_))));
        assert!(image.bytes().iter().all(|b| *b == 0x11));
    }

    #[test]
    fn snapshot_of_another_layout_is_rejected() {
        let first = Image::new(8);
        let second = Image::new(8);
        let key = generate_key();
        let snapshot = unsafe { take_snapshot(&first.memory(), &AesGcmSivCryptor, &key).unwrap() };
        let result = unsafe { restore(&second.memory(), &AesGcmSivCryptor, &key, &borrowed(&snapshot)) };
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[test]
    fn key_reaches_the_child() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (parent, child) = UnixStream::pair().unwrap();
        let key = generate_key();
        let sent = key.to_vec();

        let receiver = thread::spawn(move || receive_key(&mut Stream(child), &AesGcmSivCryptor));
        send_key(&mut Stream(parent), &AesGcmSivCryptor, &key).unwrap();
        let received = receiver.join().unwrap().unwrap();
        assert_eq!(&received[..], &sent[..]);
    }

    #[test]
    fn closed_peer_fails_the_handshake() {
        let (parent, child) = UnixStream::pair().unwrap();
        drop(child);
        let result = send_key(&mut Stream(parent), &AesGcmSivCryptor, &generate_key());
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[test]
    fn oversized_frames_are_refused() {
        let (mut parent, child) = UnixStream::pair().unwrap();
        parent.write_all(&((FRAME_MAX + 1) as u32).to_le_bytes()).unwrap();
        let result = receive_frame(&mut Stream(child));
        assert!(matches!(result, Err(Error::Malformed(_))));
    }
}
