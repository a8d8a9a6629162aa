//! Helper functions for secret-key encrypted blobs
//! that contain Zstd encrypted data

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use zstd::stream::{decode_all as zstd_decode, encode_all as zstd_encode};

use sodiumoxide::crypto::box_ as publicbox;
use sodiumoxide::crypto::sealedbox;
use sodiumoxide::crypto::secretbox::xsalsa20poly1305 as secretbox;

pub use sodiumoxide::crypto::box_::{
    gen_keypair, PublicKey, SecretKey, PUBLICKEYBYTES, SECRETKEYBYTES,
};
pub use sodiumoxide::crypto::secretbox::xsalsa20poly1305::{gen_key, Key, KEYBYTES};

/// Size overhead of a sealed box: an ephemeral public key plus a MAC.
pub const SEALBYTES: usize = sealedbox::SEALBYTES;

pub fn open(cryptoblob: &[u8], key: &Key) -> Result<Vec<u8>> {
    use secretbox::{Nonce, NONCEBYTES};

    if cryptoblob.len() < NONCEBYTES {
        return Err(anyhow!("Cyphertext too short"));
    }

    // Decrypt -> get Zstd data
    let nonce = Nonce::from_slice(&cryptoblob[..NONCEBYTES]).ok_or(anyhow!("Invalid nonce"))?;
    let zstdblob = secretbox::open(&cryptoblob[NONCEBYTES..], &nonce, key)
        .map_err(|_| anyhow!("Could not decrypt blob"))?;

    // Decompress zstd data
    let mut reader = &zstdblob[..];
    let data = zstd_decode(&mut reader)?;

    Ok(data)
}

pub fn seal(plainblob: &[u8], key: &Key) -> Result<Vec<u8>> {
    use secretbox::{gen_nonce, NONCEBYTES};

    // Compress data using zstd
    let mut reader = plainblob;
    let zstdblob = zstd_encode(&mut reader, 0)?;

    // Encrypt
    let nonce = gen_nonce();
    let cryptoblob = secretbox::seal(&zstdblob, &nonce, key);

    let mut res = Vec::with_capacity(NONCEBYTES + cryptoblob.len());
    res.extend(nonce.as_ref());
    res.extend(cryptoblob);

    Ok(res)
}

pub fn open_deserialize<T: for<'de> Deserialize<'de>>(cryptoblob: &[u8], key: &Key) -> Result<T> {
    let blob = open(cryptoblob, key)?;

    Ok(rmp_serde::decode::from_read_ref::<_, T>(&blob)?)
}

pub fn seal_serialize<T: Serialize>(obj: T, key: &Key) -> Result<Vec<u8>> {
    let mut wr = Vec::with_capacity(128);
    let mut se = rmp_serde::Serializer::new(&mut wr)
        .with_struct_map()
        .with_string_variants();
    obj.serialize(&mut se)?;

    seal(&wr, key)
}

/// Anonymously encrypts `plain` for the owner of `pk`.
pub fn seal_for(plain: &[u8], pk: &PublicKey) -> Vec<u8> {
    sealedbox::seal(plain, pk)
}

pub fn open_sealed(cipher: &[u8], pk: &PublicKey, sk: &SecretKey) -> Result<Vec<u8>> {
    sealedbox::open(cipher, pk, sk).map_err(|_| anyhow!("Could not open sealed box"))
}

// ---- Account keys ----

/// The key material of an account: a symmetric master key sealing every
/// row and blob, and a keypair the incoming drop queue is encrypted for.
#[derive(Clone, Debug)]
pub struct CryptoKeys {
    pub master: Key,
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl CryptoKeys {
    pub fn init() -> Self {
        let (public, secret) = publicbox::gen_keypair();
        Self {
            master: gen_key(),
            secret,
            public,
        }
    }

    pub fn from_b64(master_b64: &str, secret_b64: &str) -> Result<Self> {
        let master = Key::from_slice(&b64_decode(master_b64).context("master_key")?)
            .ok_or(anyhow!("master_key must be {} bytes", KEYBYTES))?;
        let secret = SecretKey::from_slice(&b64_decode(secret_b64).context("secret_key")?)
            .ok_or(anyhow!("secret_key must be {} bytes", SECRETKEYBYTES))?;
        let public = secret.public_key();
        Ok(Self {
            master,
            secret,
            public,
        })
    }

    pub fn master_b64(&self) -> String {
        b64_encode(self.master.as_ref())
    }

    pub fn secret_b64(&self) -> String {
        b64_encode(self.secret.as_ref())
    }

    pub fn public_b64(&self) -> String {
        b64_encode(self.public.as_ref())
    }
}

pub fn b64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn b64_decode(data: &str) -> Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_row_cannot_be_opened_with_another_key() {
        let k1 = gen_key();
        let k2 = gen_key();
        let blob = seal_serialize(vec!["\\Seen".to_string()], &k1).unwrap();

        let flags: Vec<String> = open_deserialize(&blob, &k1).unwrap();
        assert_eq!(flags, vec!["\\Seen".to_string()]);
        assert!(open_deserialize::<Vec<String>>(&blob, &k2).is_err());
        assert!(open(&blob[..4], &k1).is_err());
    }

    #[test]
    fn keys_survive_base64() {
        let keys = CryptoKeys::init();
        let back = CryptoKeys::from_b64(&keys.master_b64(), &keys.secret_b64()).unwrap();
        assert_eq!(back.master, keys.master);
        assert_eq!(back.public, keys.public);
        assert!(CryptoKeys::from_b64("AAAA", &keys.secret_b64()).is_err());
    }
}
