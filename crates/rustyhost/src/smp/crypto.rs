//! Cryptographic functions for the Security Manager Protocol
//!
//! The [`SmpCrypto`] trait exposes the security toolbox of BT Core Spec
//! Vol 3, Part H, 2.2. Implementors supply the primitives (AES-128,
//! AES-CMAC, P-256 key generation and Diffie-Hellman, randomness); the
//! derived functions c1, s1, f4, f5, f6, g2, h6 and h7 are provided on top
//! of them.
//!
//! The primitives work on most-significant-octet-first values, the order
//! published test vectors use. The derived functions take and return values in
//! SMP wire order (least significant octet first), which is how the pairing
//! engine stores everything it sends and receives.

use super::constants::*;
use super::types::*;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

/// f5 key derivation salt, wire order
const F5_SALT: [u8; 16] = [
    0xbe, 0x83, 0x60, 0x5a, 0xdb, 0x0b, 0x37, 0x60, 0x38, 0xa5, 0xf5, 0xaa, 0x91, 0x83, 0x88, 0x6c,
];
/// "btle", wire order
const F5_KEY_ID: [u8; 4] = [0x65, 0x6c, 0x74, 0x62];
/// Length of the derived f5 keys in bits, wire order
const F5_LENGTH: [u8; 2] = [0x00, 0x01];

/// Local P-256 key pair
///
/// The public coordinates are kept in wire order, ready for a Pairing
/// Public Key command.
#[derive(Clone)]
pub struct EcdhKeyPair {
    secret: [u8; 32],
    pub public_x: [u8; 32],
    pub public_y: [u8; 32],
}

impl EcdhKeyPair {
    pub fn new(secret: [u8; 32], public_x: [u8; 32], public_y: [u8; 32]) -> Self {
        Self {
            secret,
            public_x,
            public_y,
        }
    }

    /// Private scalar, most significant octet first
    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl fmt::Debug for EcdhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcdhKeyPair")
            .field("public_x", &hex::encode(self.public_x))
            .finish_non_exhaustive()
    }
}

/// Reverse the octet order of a fixed-size value
pub fn swap<const N: usize>(value: &[u8; N]) -> [u8; N] {
    let mut out = *value;
    out.reverse();
    out
}

fn xor(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// Trusted provider of the SMP cryptographic toolbox
pub trait SmpCrypto: Send + Sync {
    /// Fill `out` with cryptographically secure random octets
    fn random_bytes(&self, out: &mut [u8]);

    /// AES-128 block encryption, MSB first
    fn aes_128(&self, key: &[u8; 16], block: &[u8; 16]) -> [u8; 16];

    /// AES-CMAC with a 128-bit key, MSB first
    fn aes_cmac(&self, key: &[u8; 16], message: &[u8]) -> [u8; 16];

    /// Fresh P-256 key pair
    fn generate_keypair(&self) -> SmpResult<EcdhKeyPair>;

    /// Diffie-Hellman shared secret with the peer's public key, all values
    /// in wire order. Fails if the peer key is not a valid curve point.
    fn dhkey(&self, local: &EcdhKeyPair, peer_x: &[u8; 32], peer_y: &[u8; 32])
        -> SmpResult<[u8; 32]>;

    fn random_128(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        self.random_bytes(&mut out);
        out
    }

    /// Six digit passkey
    fn passkey(&self) -> u32 {
        let mut out = [0u8; 4];
        self.random_bytes(&mut out);
        u32::from_le_bytes(out) % (SMP_PASSKEY_MAX + 1)
    }

    /// Security function e, wire order
    fn e(&self, key: &[u8; 16], data: &[u8; 16]) -> [u8; 16] {
        swap(&self.aes_128(&swap(key), &swap(data)))
    }

    /// AES-CMAC, wire order
    fn cmac_le(&self, key: &[u8; 16], message: &[u8]) -> [u8; 16] {
        let mut msb: Vec<u8> = message.to_vec();
        msb.reverse();
        swap(&self.aes_cmac(&swap(key), &msb))
    }

    /// Legacy confirm value generation
    #[allow(clippy::too_many_arguments)]
    fn c1(
        &self,
        tk: &[u8; 16],
        rand: &[u8; 16],
        preq: &[u8; 7],
        pres: &[u8; 7],
        iat: u8,
        ia: &[u8; 6],
        rat: u8,
        ra: &[u8; 6],
    ) -> [u8; 16] {
        // p1 = pres || preq || rat || iat
        let mut p1 = [0u8; 16];
        p1[0] = iat;
        p1[1] = rat;
        p1[2..9].copy_from_slice(preq);
        p1[9..16].copy_from_slice(pres);

        // p2 = padding || ia || ra
        let mut p2 = [0u8; 16];
        p2[0..6].copy_from_slice(ra);
        p2[6..12].copy_from_slice(ia);

        let res = self.e(tk, &xor(rand, &p1));
        self.e(tk, &xor(&res, &p2))
    }

    /// Legacy STK generation
    fn s1(&self, tk: &[u8; 16], r1: &[u8; 16], r2: &[u8; 16]) -> [u8; 16] {
        let mut r = [0u8; 16];
        r[0..8].copy_from_slice(&r2[0..8]);
        r[8..16].copy_from_slice(&r1[0..8]);
        self.e(tk, &r)
    }

    /// Secure Connections confirm value generation
    fn f4(&self, u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], z: u8) -> [u8; 16] {
        let mut m = [0u8; 65];
        m[0] = z;
        m[1..33].copy_from_slice(v);
        m[33..65].copy_from_slice(u);
        self.cmac_le(x, &m)
    }

    /// Secure Connections key generation; returns (MacKey, LTK)
    fn f5(
        &self,
        w: &[u8; 32],
        n1: &[u8; 16],
        n2: &[u8; 16],
        a1: &[u8; 7],
        a2: &[u8; 7],
    ) -> ([u8; 16], [u8; 16]) {
        let t = self.cmac_le(&F5_SALT, w);

        let mut m = [0u8; 53];
        m[0..2].copy_from_slice(&F5_LENGTH);
        m[2..9].copy_from_slice(a2);
        m[9..16].copy_from_slice(a1);
        m[16..32].copy_from_slice(n2);
        m[32..48].copy_from_slice(n1);
        m[48..52].copy_from_slice(&F5_KEY_ID);

        m[52] = 0;
        let mac_key = self.cmac_le(&t, &m);
        m[52] = 1;
        let ltk = self.cmac_le(&t, &m);
        (mac_key, ltk)
    }

    /// Secure Connections check value generation
    #[allow(clippy::too_many_arguments)]
    fn f6(
        &self,
        w: &[u8; 16],
        n1: &[u8; 16],
        n2: &[u8; 16],
        r: &[u8; 16],
        io_cap: &[u8; 3],
        a1: &[u8; 7],
        a2: &[u8; 7],
    ) -> [u8; 16] {
        let mut m = [0u8; 65];
        m[0..7].copy_from_slice(a2);
        m[7..14].copy_from_slice(a1);
        m[14..17].copy_from_slice(io_cap);
        m[17..33].copy_from_slice(r);
        m[33..49].copy_from_slice(n2);
        m[49..65].copy_from_slice(n1);
        self.cmac_le(w, &m)
    }

    /// Secure Connections numeric comparison value
    fn g2(&self, u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], y: &[u8; 16]) -> u32 {
        let mut m = [0u8; 80];
        m[0..16].copy_from_slice(y);
        m[16..48].copy_from_slice(v);
        m[48..80].copy_from_slice(u);
        let tmp = self.cmac_le(x, &m);
        u32::from_le_bytes([tmp[0], tmp[1], tmp[2], tmp[3]]) % (SMP_PASSKEY_MAX + 1)
    }

    /// Link key conversion
    fn h6(&self, w: &[u8; 16], key_id: &[u8; 4]) -> [u8; 16] {
        self.cmac_le(w, key_id)
    }

    /// Link key conversion with a salt, used when both sides set CT2
    fn h7(&self, salt: &[u8; 16], w: &[u8; 16]) -> [u8; 16] {
        self.cmac_le(salt, w)
    }
}

/// Salt for h7 built from a four octet key id
pub fn h7_salt(key_id: &[u8; 4]) -> [u8; 16] {
    let mut salt = [0u8; 16];
    salt[0..4].copy_from_slice(key_id);
    salt
}

/// [`SmpCrypto`] backed by the RustCrypto `aes`, `cmac` and `p256` crates
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareCrypto;

impl SoftwareCrypto {
    pub fn new() -> Self {
        Self
    }
}

impl SmpCrypto for SoftwareCrypto {
    fn random_bytes(&self, out: &mut [u8]) {
        OsRng.fill_bytes(out);
    }

    fn aes_128(&self, key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        let mut block = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut block);
        let mut out = [0u8; 16];
        out.copy_from_slice(&block);
        out
    }

    fn aes_cmac(&self, key: &[u8; 16], message: &[u8]) -> [u8; 16] {
        let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
        mac.update(message);
        let mut out = [0u8; 16];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    fn generate_keypair(&self) -> SmpResult<EcdhKeyPair> {
        let secret = SecretKey::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let (x, y) = match (point.x(), point.y()) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                return Err(SmpError::CryptoError(
                    "public key has no affine coordinates".to_string(),
                ))
            }
        };

        let mut public_x = [0u8; 32];
        let mut public_y = [0u8; 32];
        public_x.copy_from_slice(x);
        public_y.copy_from_slice(y);
        public_x.reverse();
        public_y.reverse();

        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&secret.to_bytes());
        Ok(EcdhKeyPair::new(scalar, public_x, public_y))
    }

    fn dhkey(
        &self,
        local: &EcdhKeyPair,
        peer_x: &[u8; 32],
        peer_y: &[u8; 32],
    ) -> SmpResult<[u8; 32]> {
        let mut sec1 = [0u8; 65];
        sec1[0] = 0x04;
        sec1[1..33].copy_from_slice(&swap(peer_x));
        sec1[33..65].copy_from_slice(&swap(peer_y));
        let peer = PublicKey::from_sec1_bytes(&sec1)
            .map_err(|_| SmpError::CryptoError("peer public key is not on P-256".to_string()))?;
        let secret = SecretKey::from_slice(local.secret())
            .map_err(|_| SmpError::CryptoError("invalid local private key".to_string()))?;

        let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
        let mut dhkey = [0u8; 32];
        dhkey.copy_from_slice(shared.raw_secret_bytes());
        dhkey.reverse();
        Ok(dhkey)
    }
}
