#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]

//! Cross-module scenario tests: binary packet protocol round-trips for
//! every cipher/MAC pairing, tamper detection, and key swaps across a
//! simulated rekey boundary.

use crate::cipher::{self, OpeningKey, SealingKey, CIPHERS};
use crate::mac::{self, MACS};
use crate::sshbuffer::SSHBuffer;
use crate::Error;

fn test_init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn make_pair(
    cipher_name: cipher::Name,
    mac_name: mac::Name,
    seed: u8,
) -> (Box<dyn SealingKey + Send>, Box<dyn OpeningKey + Send>) {
    let algo = CIPHERS.get(&cipher_name).unwrap();
    let mac_algo = MACS.get(&mac_name).unwrap();
    let key = vec![seed; algo.key_len().max(1)];
    let iv = vec![seed.wrapping_add(1); algo.nonce_len().max(1)];
    let mac_key = vec![seed.wrapping_add(2); mac_algo.key_len().max(1)];
    let seal = algo
        .make_sealing_key(
            &key[..algo.key_len()],
            &iv[..algo.nonce_len()],
            &mac_key[..mac_algo.key_len()],
            *mac_algo,
        )
        .unwrap();
    let open = algo
        .make_opening_key(
            &key[..algo.key_len()],
            &iv[..algo.nonce_len()],
            &mac_key[..mac_algo.key_len()],
            *mac_algo,
        )
        .unwrap();
    (seal, open)
}

fn payloads() -> Vec<Vec<u8>> {
    vec![
        vec![0x15], // a one-byte message (NEWKEYS)
        b"hello world".to_vec(),
        (0..300u32).map(|i| i as u8).collect(),
        (0..5000u32).map(|i| (i % 251) as u8).collect(),
    ]
}

async fn roundtrip(cipher_name: cipher::Name, mac_name: mac::Name) {
    let (mut seal, mut open) = make_pair(cipher_name, mac_name, 9);

    let mut wbuf = SSHBuffer::new();
    for p in payloads() {
        seal.write(&p, &mut wbuf);
    }

    let mut rbuf = SSHBuffer::new();
    let mut stream = &wbuf.buffer[..];
    for (i, p) in payloads().iter().enumerate() {
        let n = cipher::read(&mut stream, &mut rbuf, &mut *open)
            .await
            .unwrap_or_else(|e| panic!("{cipher_name:?}/{mac_name:?} packet {i}: {e:?}"));
        assert_eq!(&rbuf.buffer[5..n], &p[..], "{cipher_name:?}/{mac_name:?}");
    }
    assert!(stream.is_empty(), "{cipher_name:?} trailing wire bytes");
    // Both sides count one sequence number per packet.
    assert_eq!(wbuf.seqn, rbuf.seqn);
    assert_eq!(wbuf.seqn.0 as usize, payloads().len());
    assert_eq!(wbuf.packets as usize, payloads().len());
}

#[tokio::test]
async fn framing_roundtrip_all_ciphers() {
    test_init();
    roundtrip(cipher::CLEAR, mac::NONE).await;
    roundtrip(cipher::AES_128_CTR, mac::HMAC_SHA1).await;
    roundtrip(cipher::AES_192_CTR, mac::HMAC_SHA256).await;
    roundtrip(cipher::AES_256_CTR, mac::HMAC_SHA512).await;
    roundtrip(cipher::AES_256_CTR, mac::HMAC_SHA256_ETM).await;
    roundtrip(cipher::AES_128_CBC, mac::HMAC_SHA1).await;
    roundtrip(cipher::AES_256_CBC, mac::HMAC_SHA512_ETM).await;
    roundtrip(cipher::AES_128_GCM, mac::NONE).await;
    roundtrip(cipher::AES_256_GCM, mac::NONE).await;
    roundtrip(cipher::CHACHA20_POLY1305, mac::NONE).await;
}

#[tokio::test]
async fn etm_leaves_the_length_field_clear() {
    test_init();
    let (mut seal, _) = make_pair(cipher::AES_256_CTR, mac::HMAC_SHA256_ETM, 4);
    let mut wbuf = SSHBuffer::new();
    seal.write(b"ping", &mut wbuf);
    // First four bytes are the cleartext packet length.
    let len = u32::from_be_bytes(wbuf.buffer[..4].try_into().unwrap()) as usize;
    assert_eq!(len + 4 + seal.tag_len(), wbuf.buffer.len());

    // Whereas the classic mode encrypts it.
    let (mut seal, _) = make_pair(cipher::AES_256_CTR, mac::HMAC_SHA256, 4);
    let mut wbuf2 = SSHBuffer::new();
    seal.write(b"ping", &mut wbuf2);
    let enc_len = u32::from_be_bytes(wbuf2.buffer[..4].try_into().unwrap()) as usize;
    assert_ne!(enc_len + 4 + seal.tag_len(), wbuf2.buffer.len());
}

async fn tamper(cipher_name: cipher::Name, mac_name: mac::Name) {
    let (mut seal, mut open) = make_pair(cipher_name, mac_name, 23);
    let mut wbuf = SSHBuffer::new();
    seal.write(b"some channel data in flight", &mut wbuf);

    // Flip one bit somewhere inside the packet.
    let mid = wbuf.buffer.len() / 2;
    wbuf.buffer[mid] ^= 0x10;

    let mut rbuf = SSHBuffer::new();
    let mut stream = &wbuf.buffer[..];
    let r = cipher::read(&mut stream, &mut rbuf, &mut *open).await;
    assert!(
        matches!(
            r,
            Err(Error::PacketAuth) | Err(Error::DecryptionError) | Err(Error::PacketSize(_))
        ),
        "{cipher_name:?}/{mac_name:?} accepted a tampered packet: {r:?}"
    );
}

#[tokio::test]
async fn tampered_packets_are_rejected() {
    test_init();
    tamper(cipher::AES_128_CTR, mac::HMAC_SHA1).await;
    tamper(cipher::AES_256_CTR, mac::HMAC_SHA256_ETM).await;
    tamper(cipher::AES_256_GCM, mac::NONE).await;
    tamper(cipher::CHACHA20_POLY1305, mac::NONE).await;
}

/// Keys swap at a packet boundary and the byte stream keeps decoding, with
/// sequence numbers carrying straight through, exactly what a rekey does.
#[tokio::test]
async fn key_swap_at_packet_boundary_is_transparent() {
    test_init();
    let (mut seal1, mut open1) = make_pair(cipher::CHACHA20_POLY1305, mac::NONE, 1);
    let (mut seal2, mut open2) = make_pair(cipher::AES_256_GCM, mac::NONE, 2);

    let before = b"written before the rekey".to_vec();
    let after = b"written after the rekey".to_vec();

    let mut wbuf = SSHBuffer::new();
    seal1.write(&before, &mut wbuf);
    let boundary = wbuf.buffer.len();
    seal2.write(&after, &mut wbuf);

    let mut rbuf = SSHBuffer::new();
    let mut stream = &wbuf.buffer[..boundary];
    let n = cipher::read(&mut stream, &mut rbuf, &mut *open1).await.unwrap();
    assert_eq!(&rbuf.buffer[5..n], &before[..]);

    // NEWKEYS boundary: same buffers, fresh cipher, continuous counters.
    let mut stream = &wbuf.buffer[boundary..];
    rbuf.buffer.clear();
    rbuf.len = 0;
    let n = cipher::read(&mut stream, &mut rbuf, &mut *open2).await.unwrap();
    assert_eq!(&rbuf.buffer[5..n], &after[..]);

    assert_eq!(rbuf.seqn.0, 2);
    assert_eq!(wbuf.seqn.0, 2);
}

/// Packets longer than the protocol maximum are refused outright.
#[tokio::test]
async fn oversized_packet_length_is_rejected() {
    test_init();
    let (_, mut open) = make_pair(cipher::CLEAR, mac::NONE, 0);
    let mut wire = Vec::new();
    wire.extend_from_slice(&(1024u32 * 1024).to_be_bytes());
    wire.extend_from_slice(&[0; 64]);
    let mut rbuf = SSHBuffer::new();
    let mut stream = &wire[..];
    let r = cipher::read(&mut stream, &mut rbuf, &mut *open).await;
    assert!(matches!(r, Err(Error::PacketSize(_))));
}
