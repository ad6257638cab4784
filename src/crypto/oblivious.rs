// src/crypto/oblivious.rs
//
// HPKE 风格的封装加密：临时 X25519 做密钥协商，HKDF-SHA256 派生
// 请求/响应两把 AEAD 密钥，ChaCha20-Poly1305 封口。会话 id 进 AAD，
// 不同会话的密文互不可用。
//
// 请求信封: [magic "ASDQ"][version 1B][key_id 1B][临时公钥 32B][nonce 12B][密文]
// 响应信封: [magic "ASDP"][version 1B][nonce 12B][密文]
//
// seal 在本地留下一份会话上下文（响应密钥），open 用它解开响应并在
// 成功后移除 —— 重放不在这一层防（调用方约定每会话只 open 一次）。

use std::collections::HashMap;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::{ExchangeError, ExchangeResult};
use crate::keys::EncryptionKey;

const REQUEST_MAGIC: &[u8; 4] = b"ASDQ";
const RESPONSE_MAGIC: &[u8; 4] = b"ASDP";
const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HKDF_SALT: &[u8] = b"asdx-ohttp-v1";
const REQUEST_INFO: &[u8] = b"asdx request key";
const RESPONSE_INFO: &[u8] = b"asdx response key";

const REQUEST_HEADER_LEN: usize = 4 + 1 + 1 + 32 + NONCE_LEN;
const RESPONSE_HEADER_LEN: usize = 4 + 1 + NONCE_LEN;
const AEAD_TAG_LEN: usize = 16;

/// seal 在明文之外新增的字节数（请求信封头 + AEAD tag），出站体积
/// 预算要把它算进去
pub const SEAL_OVERHEAD_BYTES: usize = REQUEST_HEADER_LEN + AEAD_TAG_LEN;

struct DerivedKeys {
    request_key: [u8; KEY_LEN],
    response_key: [u8; KEY_LEN],
}

/// 双方公钥都参与派生，篡改任意一侧都会导致解密失败
fn derive_keys(
    shared_secret: &[u8],
    ephemeral_public: &[u8; 32],
    server_public: &[u8; 32],
) -> ExchangeResult<DerivedKeys> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
    let mut request_key = [0u8; KEY_LEN];
    let mut response_key = [0u8; KEY_LEN];
    let request_info = [REQUEST_INFO, ephemeral_public, server_public].concat();
    let response_info = [RESPONSE_INFO, ephemeral_public, server_public].concat();
    hk.expand(&request_info, &mut request_key)
        .and_then(|_| hk.expand(&response_info, &mut response_key))
        .map_err(|_| ExchangeError::internal("hkdf expansion failed"))?;
    Ok(DerivedKeys {
        request_key,
        response_key,
    })
}

fn session_aad(session_id: u64) -> [u8; 8] {
    session_id.to_be_bytes()
}

#[derive(Clone)]
struct SessionContext {
    key_id: u8,
    response_key: [u8; KEY_LEN],
}

/// 竞价载荷加密器（设备侧）
///
/// 每次 seal 都会为该会话登记一份上下文；open 消耗这份上下文。
pub struct ObliviousEncryptor {
    contexts: Mutex<HashMap<u64, SessionContext>>,
}

impl Default for ObliviousEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl ObliviousEncryptor {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// 用协调方公钥封装出站载荷，并登记会话上下文
    pub fn seal(
        &self,
        plaintext: &[u8],
        session_id: u64,
        key: &EncryptionKey,
    ) -> ExchangeResult<Vec<u8>> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let server_public = PublicKey::from(key.public_key);
        let shared = ephemeral.diffie_hellman(&server_public);
        let keys = derive_keys(shared.as_bytes(), ephemeral_public.as_bytes(), &key.public_key)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.request_key));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &session_aad(session_id),
                },
            )
            .map_err(|_| ExchangeError::internal("request encryption failed"))?;

        self.contexts.lock().insert(
            session_id,
            SessionContext {
                key_id: key.key_id,
                response_key: keys.response_key,
            },
        );

        let mut envelope =
            Vec::with_capacity(REQUEST_HEADER_LEN + ciphertext.len());
        envelope.extend_from_slice(REQUEST_MAGIC);
        envelope.push(VERSION);
        envelope.push(key.key_id);
        envelope.extend_from_slice(ephemeral_public.as_bytes());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// 解开竞价服务端的响应；成功后移除会话上下文
    pub fn open(&self, ciphertext: &[u8], session_id: u64) -> ExchangeResult<Vec<u8>> {
        if ciphertext.len() < RESPONSE_HEADER_LEN || &ciphertext[..4] != RESPONSE_MAGIC {
            return Err(ExchangeError::Decryption(
                "malformed response envelope".to_string(),
            ));
        }
        if ciphertext[4] != VERSION {
            return Err(ExchangeError::Decryption(format!(
                "unsupported envelope version {}",
                ciphertext[4]
            )));
        }

        let context = self
            .contexts
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| {
                ExchangeError::Decryption(format!(
                    "no encryption context for ad selection id {session_id}"
                ))
            })?;

        let nonce = &ciphertext[5..5 + NONCE_LEN];
        let body = &ciphertext[RESPONSE_HEADER_LEN..];
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&context.response_key));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: body,
                    aad: &session_aad(session_id),
                },
            )
            .map_err(|_| {
                ExchangeError::Decryption(format!(
                    "response decryption failed for ad selection id {session_id}"
                ))
            })?;

        self.contexts.lock().remove(&session_id);
        Ok(plaintext)
    }

    #[cfg(test)]
    pub fn has_context(&self, session_id: u64) -> bool {
        self.contexts.lock().contains_key(&session_id)
    }
}

/// 网关侧打开请求后留下的上下文，封装响应时使用
pub struct GatewayContext {
    response_key: [u8; KEY_LEN],
}

/// 网关（竞价服务端）侧：打开设备的请求信封
///
/// mock 竞价服务端与端到端测试使用；真实部署中这一侧在远端。
pub fn gateway_open_request(
    envelope: &[u8],
    session_id: u64,
    server_secret: &StaticSecret,
    expected_key_id: u8,
) -> ExchangeResult<(Vec<u8>, GatewayContext)> {
    if envelope.len() < REQUEST_HEADER_LEN || &envelope[..4] != REQUEST_MAGIC {
        return Err(ExchangeError::Decryption(
            "malformed request envelope".to_string(),
        ));
    }
    if envelope[4] != VERSION {
        return Err(ExchangeError::Decryption(format!(
            "unsupported envelope version {}",
            envelope[4]
        )));
    }
    if envelope[5] != expected_key_id {
        return Err(ExchangeError::Decryption(format!(
            "unknown key id {}",
            envelope[5]
        )));
    }

    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(&envelope[6..38]);
    let nonce = &envelope[38..38 + NONCE_LEN];
    let body = &envelope[REQUEST_HEADER_LEN..];

    let server_public = PublicKey::from(server_secret);
    let shared = server_secret.diffie_hellman(&PublicKey::from(ephemeral_public));
    let keys = derive_keys(shared.as_bytes(), &ephemeral_public, server_public.as_bytes())?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.request_key));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: body,
                aad: &session_aad(session_id),
            },
        )
        .map_err(|_| ExchangeError::Decryption("request decryption failed".to_string()))?;

    Ok((
        plaintext,
        GatewayContext {
            response_key: keys.response_key,
        },
    ))
}

/// 网关侧：用请求上下文封装响应
pub fn gateway_seal_response(
    plaintext: &[u8],
    session_id: u64,
    context: &GatewayContext,
) -> ExchangeResult<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&context.response_key));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &session_aad(session_id),
            },
        )
        .map_err(|_| ExchangeError::internal("response encryption failed"))?;

    let mut envelope = Vec::with_capacity(RESPONSE_HEADER_LEN + ciphertext.len());
    envelope.extend_from_slice(RESPONSE_MAGIC);
    envelope.push(VERSION);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}
