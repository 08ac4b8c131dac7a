//! Per-value payload encryption.
//!
//! A tag's (value, quality) pair is serialized to JSON and sealed with
//! AES-256-CBC under a fresh random IV. The sealed form carries the key
//! identifier so consumers can route to the right key during rotation.
//! When encryption is disabled the same API passes values through
//! unchanged, so callers never branch on the deployment configuration.

use aes::Aes256;
use base64::{engine::general_purpose, Engine as _};
use block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use fieldgate_core::config::SecuritySettings;
use fieldgate_core::{ConfigError, GatewayError, Quality, Result, TagValue};
use rand::RngCore;
use serde::{Deserialize, Serialize};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// A tag value as it leaves the gateway: plain or sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SealedValue {
    Plain {
        value: TagValue,
        quality: Quality,
    },
    Encrypted {
        key_id: String,
        /// Base64-encoded initialization vector
        iv: String,
        /// Base64-encoded ciphertext
        ciphertext: String,
    },
}

/// The (value, quality) pair that round-trips through the cipher.
#[derive(Serialize, Deserialize)]
struct ClearValue {
    value: TagValue,
    quality: Quality,
}

/// Value encryption as configured for this deployment.
pub enum ValueCipher {
    /// Passthrough: `seal` returns the value unchanged
    Disabled,
    Aes256Cbc { key_id: String, key: [u8; 32] },
}

impl ValueCipher {
    /// Builds the cipher from validated gateway settings.
    pub fn from_settings(settings: &SecuritySettings) -> Result<Self> {
        if !settings.value_encryption_enabled {
            return Ok(Self::Disabled);
        }
        let hex_key = settings.value_encryption_key.as_deref().ok_or_else(|| {
            ConfigError::MissingField {
                field: "security.value_encryption_key".to_string(),
            }
        })?;
        let raw = hex::decode(hex_key).map_err(|_| {
            ConfigError::invalid_value("security.value_encryption_key", "not valid hex")
        })?;
        let key: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            ConfigError::invalid_value(
                "security.value_encryption_key",
                "must decode to 32 bytes",
            )
        })?;
        Ok(Self::Aes256Cbc {
            key_id: settings.value_encryption_key_id.clone(),
            key,
        })
    }

    pub fn enabled(&self) -> bool {
        !matches!(self, ValueCipher::Disabled)
    }

    /// Seals a (value, quality) pair for transport.
    pub fn seal(&self, value: &TagValue, quality: Quality) -> Result<SealedValue> {
        match self {
            ValueCipher::Disabled => Ok(SealedValue::Plain {
                value: value.clone(),
                quality,
            }),
            ValueCipher::Aes256Cbc { key_id, key } => {
                let clear = serde_json::to_vec(&ClearValue {
                    value: value.clone(),
                    quality,
                })
                .map_err(|e| GatewayError::Internal(format!("value serialization: {e}")))?;

                let mut iv = [0u8; 16];
                rand::rngs::OsRng.fill_bytes(&mut iv);
                let ciphertext = Aes256CbcEnc::new(key.into(), (&iv).into())
                    .encrypt_padded_vec_mut::<Pkcs7>(&clear);

                Ok(SealedValue::Encrypted {
                    key_id: key_id.clone(),
                    iv: general_purpose::STANDARD.encode(iv),
                    ciphertext: general_purpose::STANDARD.encode(ciphertext),
                })
            }
        }
    }

    /// Restores the exact (value, quality) pair a `seal` call captured.
    pub fn open(&self, sealed: &SealedValue) -> Result<(TagValue, Quality)> {
        match sealed {
            SealedValue::Plain { value, quality } => Ok((value.clone(), *quality)),
            SealedValue::Encrypted {
                key_id,
                iv,
                ciphertext,
            } => {
                let ValueCipher::Aes256Cbc {
                    key_id: own_key_id,
                    key,
                } = self
                else {
                    return Err(GatewayError::Internal(
                        "received an encrypted value but encryption is disabled".to_string(),
                    ));
                };
                if key_id != own_key_id {
                    return Err(GatewayError::Internal(format!(
                        "no key material for key id '{key_id}'"
                    )));
                }
                let iv: [u8; 16] = general_purpose::STANDARD
                    .decode(iv)
                    .ok()
                    .and_then(|raw| raw.try_into().ok())
                    .ok_or_else(|| {
                        GatewayError::Internal("sealed value carries a malformed IV".to_string())
                    })?;
                let ciphertext = general_purpose::STANDARD.decode(ciphertext).map_err(|e| {
                    GatewayError::Internal(format!("sealed value is not base64: {e}"))
                })?;

                let clear = Aes256CbcDec::new(key.into(), (&iv).into())
                    .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
                    .map_err(|_| {
                        GatewayError::Internal("sealed value failed to decrypt".to_string())
                    })?;
                let parsed: ClearValue = serde_json::from_slice(&clear).map_err(|e| {
                    GatewayError::Internal(format!("decrypted value is not valid JSON: {e}"))
                })?;
                Ok((parsed.value, parsed.quality))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_cipher() -> ValueCipher {
        let settings = SecuritySettings {
            value_encryption_enabled: true,
            value_encryption_key: Some("11".repeat(32)),
            value_encryption_key_id: "k1".to_string(),
            ..SecuritySettings::default()
        };
        ValueCipher::from_settings(&settings).unwrap()
    }

    #[test]
    fn seal_open_is_identity_when_enabled() {
        let cipher = enabled_cipher();
        for (value, quality) in [
            (TagValue::Float(25.5), Quality::Good),
            (TagValue::Int(-40), Quality::Bad),
            (TagValue::Bool(true), Quality::Stale),
            (TagValue::Text("running".into()), Quality::Good),
        ] {
            let sealed = cipher.seal(&value, quality).unwrap();
            assert!(matches!(sealed, SealedValue::Encrypted { .. }));
            assert_eq!(cipher.open(&sealed).unwrap(), (value, quality));
        }
    }

    #[test]
    fn fresh_iv_per_seal() {
        let cipher = enabled_cipher();
        let a = cipher.seal(&TagValue::Float(1.0), Quality::Good).unwrap();
        let b = cipher.seal(&TagValue::Float(1.0), Quality::Good).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn disabled_cipher_is_passthrough() {
        let cipher = ValueCipher::Disabled;
        let sealed = cipher.seal(&TagValue::Float(25.5), Quality::Good).unwrap();
        assert_eq!(
            sealed,
            SealedValue::Plain {
                value: TagValue::Float(25.5),
                quality: Quality::Good
            }
        );
        assert_eq!(
            cipher.open(&sealed).unwrap(),
            (TagValue::Float(25.5), Quality::Good)
        );
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = enabled_cipher();
        let sealed = cipher.seal(&TagValue::Float(25.5), Quality::Good).unwrap();
        let SealedValue::Encrypted { key_id, iv, .. } = sealed else {
            unreachable!()
        };
        let forged = SealedValue::Encrypted {
            key_id,
            iv,
            ciphertext: general_purpose::STANDARD.encode(b"garbage garbage!"),
        };
        assert!(cipher.open(&forged).is_err());
    }

    #[test]
    fn unknown_key_id_is_rejected() {
        let cipher = enabled_cipher();
        let sealed = cipher.seal(&TagValue::Int(1), Quality::Good).unwrap();
        let SealedValue::Encrypted { iv, ciphertext, .. } = sealed else {
            unreachable!()
        };
        let rotated = SealedValue::Encrypted {
            key_id: "k9".to_string(),
            iv,
            ciphertext,
        };
        assert!(cipher.open(&rotated).is_err());
    }
}
