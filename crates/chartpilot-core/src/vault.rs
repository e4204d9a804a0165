//! 凭据保管接口

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{PilotError, Result};

/// 凭据加解密接口，具体加密算法由外部实现提供
pub trait SecretsVault: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, blob: &str) -> Result<String>;
}

/// 开发用实现：仅做 base64 包装，不提供任何保密性
#[derive(Debug, Default, Clone)]
pub struct PlaintextVault;

impl SecretsVault for PlaintextVault {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(STANDARD.encode(plaintext.as_bytes()))
    }

    fn decrypt(&self, blob: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(blob.trim())
            .map_err(|e| PilotError::Validation(format!("malformed credential blob: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| PilotError::Validation(format!("credential blob is not utf-8: {}", e)))
    }
}
