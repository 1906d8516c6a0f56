use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    sign::{Signer, Verifier},
};

use crate::key_pair::{CryptoError, KeyAlgorithm, KeyPair};

type Result<T> = std::result::Result<T, CryptoError>;

/// 定義 JWS 簽名演算法的介面。
trait SignatureAlgorithmT {
    /// 使用金鑰對資料簽名，回傳 JWS 所要求的原始簽名位元組。
    fn sign(&self, data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>>;

    /// 以公鑰驗證簽名。
    fn verify(&self, data: &[u8], signature: &[u8], key_pair: &KeyPair) -> Result<bool>;
}

/// RS256：RSASSA-PKCS1-v1_5 搭配 SHA-256。
struct Rs256;

impl SignatureAlgorithmT for Rs256 {
    fn sign(&self, data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>> {
        sha256_sign(data, key_pair)
    }

    fn verify(&self, data: &[u8], signature: &[u8], key_pair: &KeyPair) -> Result<bool> {
        sha256_verify(data, signature, key_pair)
    }
}

/// ES256：P-256 上的 ECDSA 搭配 SHA-256，簽名格式為固定長度的 `r || s`。
struct Es256;

impl Es256 {
    const COORDINATE_LEN: i32 = 32;
}

impl SignatureAlgorithmT for Es256 {
    fn sign(&self, data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>> {
        // OpenSSL 產生的是 DER 編碼，JWS 需要 r 與 s 各自補齊 32 位元組後串接
        let der = sha256_sign(data, key_pair)?;
        let sig = EcdsaSig::from_der(&der).map_err(CryptoError::Sign)?;
        let mut raw = sig
            .r()
            .to_vec_padded(Self::COORDINATE_LEN)
            .map_err(CryptoError::Sign)?;
        raw.extend(
            sig.s()
                .to_vec_padded(Self::COORDINATE_LEN)
                .map_err(CryptoError::Sign)?,
        );
        Ok(raw)
    }

    fn verify(&self, data: &[u8], signature: &[u8], key_pair: &KeyPair) -> Result<bool> {
        let half = Self::COORDINATE_LEN as usize;
        if signature.len() != half * 2 {
            return Ok(false);
        }
        let r = BigNum::from_slice(&signature[..half]).map_err(CryptoError::Sign)?;
        let s = BigNum::from_slice(&signature[half..]).map_err(CryptoError::Sign)?;
        let der = EcdsaSig::from_private_components(r, s)
            .and_then(|sig| sig.to_der())
            .map_err(CryptoError::Sign)?;
        sha256_verify(data, &der, key_pair)
    }
}

fn sha256_sign(data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>> {
    let mut signer =
        Signer::new(MessageDigest::sha256(), &key_pair.pri_key).map_err(CryptoError::Sign)?;
    signer.update(data).map_err(CryptoError::Sign)?;
    signer.sign_to_vec().map_err(CryptoError::Sign)
}

fn sha256_verify(data: &[u8], signature: &[u8], key_pair: &KeyPair) -> Result<bool> {
    let mut verifier =
        Verifier::new(MessageDigest::sha256(), &key_pair.pub_key).map_err(CryptoError::Sign)?;
    verifier.update(data).map_err(CryptoError::Sign)?;
    verifier.verify(signature).map_err(CryptoError::Sign)
}

fn algorithm_for(key_pair: &KeyPair) -> Box<dyn SignatureAlgorithmT> {
    match key_pair.algorithm {
        KeyAlgorithm::Rsa => Box::new(Rs256),
        KeyAlgorithm::Ec => Box::new(Es256),
    }
}

/// 對 JWS signing input 簽名，演算法依金鑰類型決定（RSA → RS256，EC → ES256）。
pub fn sign(data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>> {
    algorithm_for(key_pair).sign(data, key_pair)
}

/// 驗證 [`sign`] 產生的簽名。
pub fn verify(data: &[u8], signature: &[u8], key_pair: &KeyPair) -> Result<bool> {
    algorithm_for(key_pair).verify(data, signature, key_pair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rs256_signatures_verify() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa, Some(2048)).unwrap();
        let input = b"eyJhbGciOiJSUzI1NiJ9.e30";

        let first = sign(input, &key).unwrap();
        let second = sign(input, &key).unwrap();
        assert_eq!(first.len(), 256);
        assert!(verify(input, &first, &key).unwrap());
        assert!(verify(input, &second, &key).unwrap());
        assert!(!verify(b"tampered", &first, &key).unwrap());
    }

    #[test]
    fn test_es256_signature_is_raw_and_verifies() {
        let key = KeyPair::generate(KeyAlgorithm::Ec, None).unwrap();
        let input = b"header.payload";

        let first = sign(input, &key).unwrap();
        let second = sign(input, &key).unwrap();
        assert_eq!(first.len(), 64);
        assert!(verify(input, &first, &key).unwrap());
        assert!(verify(input, &second, &key).unwrap());
    }
}
