//! Shared helpers: build SQLCipher-4 encrypted databases in memory.

#![allow(dead_code)]

use wcdb_crypto_core::kdf::{derive_with_iterations, SALT_LEN};
use wcdb_crypto_core::page::{PageCodec, DEFAULT_PAGE_SIZE, RESERVE_SIZE, SQLITE_HEADER};
use wcdb_transcode::{CipherParams, TranscodeOptions};

/// Cheap KDF so tests stay fast; production default is 256 000.
pub const TEST_KDF_ITER: u32 = 2;

pub const KEY: [u8; 32] = [
    0x4f, 0x21, 0x9a, 0x03, 0xd7, 0x5e, 0x88, 0x10, 0x6b, 0xc2, 0x39, 0xf4, 0x0e, 0x77, 0xa5,
    0x1c, 0x92, 0x3d, 0xe8, 0x56, 0x0a, 0xbf, 0x64, 0x2e, 0xc1, 0x7a, 0x15, 0xd0, 0x49, 0x83,
    0xfe, 0x36,
];

pub const SALT: [u8; SALT_LEN] = [
    0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xab, 0xac, 0xad, 0xae, 0xaf,
];

pub fn key_hex() -> String {
    data_encoding::HEXLOWER.encode(&KEY)
}

pub fn options() -> TranscodeOptions {
    options_with_page_size(DEFAULT_PAGE_SIZE)
}

pub fn options_with_page_size(page_size: usize) -> TranscodeOptions {
    TranscodeOptions {
        params: CipherParams {
            page_size,
            kdf_iterations: TEST_KDF_ITER,
        },
        ..TranscodeOptions::default()
    }
}

/// Plain SQLite-shaped database: magic on page 0, patterned payload, zeroed
/// reserve on every page.
pub fn plaintext_db(pages: usize, page_size: usize) -> Vec<u8> {
    let mut db = vec![0u8; pages * page_size];
    for (i, page) in db.chunks_exact_mut(page_size).enumerate() {
        for (j, b) in page[..page_size - RESERVE_SIZE].iter_mut().enumerate() {
            *b = ((j * 7 + i * 13) & 0xff) as u8;
        }
    }
    db[..SALT_LEN].copy_from_slice(SQLITE_HEADER);
    db
}

/// Encrypt `plain` the way SQLCipher 4 lays pages out on disk.
pub fn encrypt_db(plain: &[u8], page_size: usize, key: &[u8; 32], salt: &[u8; SALT_LEN]) -> Vec<u8> {
    let keys = derive_with_iterations(key, salt, TEST_KDF_ITER).unwrap();
    let codec = PageCodec::with_page_size(&keys, page_size).unwrap();
    plain
        .chunks_exact(page_size)
        .enumerate()
        .flat_map(|(i, page)| {
            let iv = [(i as u8) ^ 0x5a; 16];
            codec.encrypt_page(page, i as u32, &iv, Some(salt)).unwrap()
        })
        .collect()
}

/// `(plaintext, ciphertext)` for a `pages`-page database at the default page size.
pub fn sample_db(pages: usize) -> (Vec<u8>, Vec<u8>) {
    let plain = plaintext_db(pages, DEFAULT_PAGE_SIZE);
    let enc = encrypt_db(&plain, DEFAULT_PAGE_SIZE, &KEY, &SALT);
    (plain, enc)
}
