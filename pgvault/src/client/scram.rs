//! Client-side SCRAM-SHA-256 (RFC 5802/7677) as spoken inside the
//! PostgreSQL SASL exchange.

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::digest::FixedOutput;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
const GS2_HEADER: &str = "n,,";

#[derive(Debug, thiserror::Error)]
pub enum ScramError {
    #[error("malformed server message: {0}")]
    Malformed(String),
    #[error("server rejected authentication: {0}")]
    Rejected(String),
    #[error("server signature verification failed")]
    BadServerSignature,
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
}

enum State {
    Initial,
    SentClientFirst,
    SentClientFinal {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

/// One SCRAM exchange. Drive it client-first → server-first →
/// client-final → server-final.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    state: State,
}

impl ScramClient {
    /// PostgreSQL sends the empty username in `client-first-message` (the
    /// startup packet already named the role).
    pub fn new(username: &str, password: &str) -> ScramClient {
        let client_nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_nonce(username, password, client_nonce)
    }

    pub fn with_nonce(username: &str, password: &str, client_nonce: String) -> ScramClient {
        ScramClient {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            state: State::Initial,
        }
    }

    pub fn client_first_message(&mut self) -> String {
        self.state = State::SentClientFirst;
        format!("{GS2_HEADER}{}", self.client_first_bare())
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// Consume `server-first-message`, produce `client-final-message`.
    pub fn handle_server_first(&mut self, server_first: &str) -> Result<String, ScramError> {
        if !matches!(self.state, State::SentClientFirst) {
            return Err(ScramError::Malformed("out-of-order server-first".to_string()));
        }
        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for field in server_first.split(',') {
            match field.split_once('=') {
                Some(("r", v)) => server_nonce = Some(v.to_string()),
                Some(("s", v)) => {
                    salt = Some(
                        base64::decode(v)
                            .map_err(|_| ScramError::Malformed("bad salt".to_string()))?,
                    )
                }
                Some(("i", v)) => {
                    iterations = Some(
                        v.parse::<u32>()
                            .map_err(|_| ScramError::Malformed("bad iteration count".to_string()))?,
                    )
                }
                _ => {}
            }
        }
        let server_nonce =
            server_nonce.ok_or_else(|| ScramError::Malformed("missing nonce".to_string()))?;
        let salt = salt.ok_or_else(|| ScramError::Malformed("missing salt".to_string()))?;
        let iterations =
            iterations.ok_or_else(|| ScramError::Malformed("missing iterations".to_string()))?;
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::default()
            .chain_update(client_key)
            .finalize_fixed()
            .into();

        let channel_binding = base64::encode(GS2_HEADER.as_bytes());
        let client_final_without_proof = format!("c={channel_binding},r={server_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut client_proof = client_key;
        for (proof, signature) in client_proof.iter_mut().zip(client_signature) {
            *proof ^= signature;
        }

        self.state = State::SentClientFinal {
            salted_password,
            auth_message,
        };
        Ok(format!(
            "{client_final_without_proof},p={}",
            base64::encode(client_proof)
        ))
    }

    /// Verify `server-final-message` (the `v=` signature).
    pub fn verify_server_final(&mut self, server_final: &str) -> Result<(), ScramError> {
        let State::SentClientFinal {
            salted_password,
            auth_message,
        } = &self.state
        else {
            return Err(ScramError::Malformed("out-of-order server-final".to_string()));
        };
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::Rejected(err.to_string()));
        }
        let verifier = server_final
            .strip_prefix("v=")
            .and_then(|v| base64::decode(v).ok())
            .ok_or_else(|| ScramError::Malformed("missing verifier".to_string()))?;

        let server_key = hmac_sha256(salted_password, b"Server Key");
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
        if verifier != server_signature {
            return Err(ScramError::BadServerSignature);
        }
        self.state = State::Done;
        Ok(())
    }
}

/// `Hi(str, salt, i)`: PBKDF2-HMAC-SHA-256 with one block.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(password).expect("hmac accepts any key length");
    mac.update(salt);
    mac.update(&[0, 0, 0, 1]);
    let mut prev: [u8; 32] = mac.finalize().into_bytes().into();
    let mut result = prev;
    for _ in 1..iterations {
        prev = hmac_sha256(password, &prev);
        for (acc, next) in result.iter_mut().zip(prev) {
            *acc ^= next;
        }
    }
    result
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}
