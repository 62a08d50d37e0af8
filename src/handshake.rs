//! SCRAM-SHA-256 connection handshake.
//!
//! After the TCP (and optional TLS) connect, client and server exchange
//! NUL-terminated JSON messages until a mutually signed session exists. The
//! state machine here is pure: [`Handshake::next_message`] consumes the
//! previous server message (if any) and produces the next client message,
//! so the same machine drives blocking and async transports alike.
//!
//! The exchange follows RFC 7677 without channel binding: the client sends
//! the protocol magic plus its `client-first-message`, receives the salt and
//! iteration-count challenge, answers with a proof derived from the
//! PBKDF2-salted password, and finally verifies the server's signature.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{ReqlDriverError, ReqlError, Result};
use crate::proto::{HANDSHAKE_MAGIC, PROTOCOL_VERSION};

type HmacSha256 = Hmac<Sha256>;

/// Progress of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
  Initial,
  WaitFirstResponse,
  WaitFinalResponse,
  Done,
}

/// Client side of the V1_0 handshake.
pub struct Handshake {
  host: String,
  port: u16,
  username: String,
  password: String,
  state: HandshakeState,
  client_nonce: String,
  client_first_bare: String,
  server_signature: [u8; 32],
}

impl Handshake {
  pub fn new(
    host: impl Into<String>,
    port: u16,
    username: &str,
    password: impl Into<String>,
  ) -> Self {
    let mut nonce = [0u8; 18];
    OsRng.fill_bytes(&mut nonce);
    Self::with_nonce(host, port, username, password, BASE64_STANDARD.encode(nonce))
  }

  /// Deterministic construction for tests and reconnects.
  pub(crate) fn with_nonce(
    host: impl Into<String>,
    port: u16,
    username: &str,
    password: impl Into<String>,
    client_nonce: String,
  ) -> Self {
    Self {
      host: host.into(),
      port,
      // Usernames ride inside a comma-separated SCRAM attribute list.
      username: username.replace('=', "=3D").replace(',', "=2C"),
      password: password.into(),
      state: HandshakeState::Initial,
      client_nonce,
      client_first_bare: String::new(),
      server_signature: [0; 32],
    }
  }

  pub fn state(&self) -> HandshakeState {
    self.state
  }

  /// Start over with a fresh nonce, e.g. before a reconnect.
  pub fn reset(&mut self) {
    let mut nonce = [0u8; 18];
    OsRng.fill_bytes(&mut nonce);
    self.client_nonce = BASE64_STANDARD.encode(nonce);
    self.client_first_bare.clear();
    self.server_signature = [0; 32];
    self.state = HandshakeState::Initial;
  }

  /// Advance the state machine: feed it the last server message (or `None`
  /// at the start) and get the next client message. `Ok(None)` means the
  /// handshake completed.
  pub fn next_message(&mut self, response: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
    match self.state {
      HandshakeState::Initial => {
        if response.is_some() {
          return Err(ReqlError::driver("Unexpected response before the handshake began."));
        }
        let message = self.initial_message();
        self.state = HandshakeState::WaitFirstResponse;
        Ok(Some(message))
      }
      HandshakeState::WaitFirstResponse => {
        let response = self.decode_response(response)?;
        self.check_protocol_range(&response)?;
        let message = self.answer_challenge(&response)?;
        self.state = HandshakeState::WaitFinalResponse;
        Ok(Some(message))
      }
      HandshakeState::WaitFinalResponse => {
        let response = self.decode_response(response)?;
        self.verify_server_signature(&response)?;
        self.state = HandshakeState::Done;
        Ok(None)
      }
      HandshakeState::Done => Err(ReqlError::Driver(ReqlDriverError::InvalidHandshakeState(
        "The handshake is already complete.".to_string(),
      ))),
    }
  }

  fn initial_message(&mut self) -> Vec<u8> {
    self.client_first_bare = format!("n={},r={}", self.username, self.client_nonce);

    let payload = json!({
      "protocol_version": PROTOCOL_VERSION,
      "authentication_method": "SCRAM-SHA-256",
      "authentication": format!("n,,{}", self.client_first_bare),
    });

    let mut message = HANDSHAKE_MAGIC.to_le_bytes().to_vec();
    message.extend_from_slice(payload.to_string().as_bytes());
    message.push(0);
    message
  }

  fn decode_response(&self, response: Option<&[u8]>) -> Result<Value> {
    let raw = response
      .ok_or_else(|| ReqlError::driver("Expected a handshake response, got none."))?;
    let response: Value = serde_json::from_slice(raw)
      .map_err(|e| ReqlError::driver(format!("Invalid handshake response: {e}.")))?;

    if response.get("success").and_then(Value::as_bool) != Some(true) {
      let message = response
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("Handshake failed.")
        .to_string();
      let code = response.get("error_code").and_then(Value::as_i64).unwrap_or(-1);
      if (10..=20).contains(&code) {
        return Err(ReqlError::Driver(ReqlDriverError::auth_at(
          message, &self.host, self.port,
        )));
      }
      return Err(ReqlError::driver(message));
    }

    Ok(response)
  }

  fn check_protocol_range(&self, response: &Value) -> Result<()> {
    let ours = PROTOCOL_VERSION as i64;
    let min = response
      .get("min_protocol_version")
      .and_then(Value::as_i64)
      .unwrap_or(ours);
    let max = response
      .get("max_protocol_version")
      .and_then(Value::as_i64)
      .unwrap_or(ours);

    if !(min..=max).contains(&ours) {
      return Err(ReqlError::driver(format!(
        "Unsupported protocol version {ours}, expected between {min} and {max}"
      )));
    }
    Ok(())
  }

  fn answer_challenge(&mut self, response: &Value) -> Result<Vec<u8>> {
    let server_first = response
      .get("authentication")
      .and_then(Value::as_str)
      .ok_or_else(|| ReqlError::driver("Handshake response is missing \"authentication\"."))?;

    let attributes = scram_attributes(server_first);
    let server_nonce = attributes
      .iter()
      .find(|(k, _)| *k == "r")
      .map(|(_, v)| *v)
      .ok_or_else(|| ReqlError::driver("SCRAM challenge is missing the nonce."))?;
    let salt_b64 = attributes
      .iter()
      .find(|(k, _)| *k == "s")
      .map(|(_, v)| *v)
      .ok_or_else(|| ReqlError::driver("SCRAM challenge is missing the salt."))?;
    let iterations: u32 = attributes
      .iter()
      .find(|(k, _)| *k == "i")
      .and_then(|(_, v)| v.parse().ok())
      .filter(|i| *i > 0)
      .ok_or_else(|| ReqlError::driver("SCRAM challenge has an invalid iteration count."))?;

    if !server_nonce.starts_with(&self.client_nonce) {
      return Err(ReqlError::Driver(ReqlDriverError::auth_at(
        "Invalid nonce from server",
        &self.host,
        self.port,
      )));
    }

    let salt = BASE64_STANDARD
      .decode(salt_b64)
      .map_err(|_| ReqlError::driver("SCRAM salt is not valid base64."))?;

    let salted_password =
      pbkdf2_hmac_array::<Sha256, 32>(self.password.as_bytes(), &salt, iterations);

    let client_final_no_proof = format!("c=biws,r={server_nonce}");
    let auth_message = format!(
      "{},{},{}",
      self.client_first_bare, server_first, client_final_no_proof
    );

    let client_key = hmac_sha256(&salted_password, b"Client Key")?;
    let stored_key = Sha256::digest(client_key);
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;

    let mut proof = [0u8; 32];
    for (out, (key, sig)) in proof
      .iter_mut()
      .zip(client_key.iter().zip(client_signature.iter()))
    {
      *out = key ^ sig;
    }

    let server_key = hmac_sha256(&salted_password, b"Server Key")?;
    self.server_signature = hmac_sha256(&server_key, auth_message.as_bytes())?;

    let payload = json!({
      "authentication": format!("{client_final_no_proof},p={}", BASE64_STANDARD.encode(proof)),
    });

    let mut message = payload.to_string().into_bytes();
    message.push(0);
    Ok(message)
  }

  fn verify_server_signature(&self, response: &Value) -> Result<()> {
    let authentication = response
      .get("authentication")
      .and_then(Value::as_str)
      .ok_or_else(|| ReqlError::driver("Handshake response is missing \"authentication\"."))?;

    let signature_b64 = scram_attributes(authentication)
      .into_iter()
      .find(|(k, _)| *k == "v")
      .map(|(_, v)| v)
      .ok_or_else(|| ReqlError::driver("Server verifier is missing the signature."))?;

    let signature = BASE64_STANDARD
      .decode(signature_b64)
      .map_err(|_| ReqlError::driver("Server signature is not valid base64."))?;

    if !constant_time_eq(&signature, &self.server_signature) {
      return Err(ReqlError::Driver(ReqlDriverError::auth_at(
        "Invalid server signature",
        &self.host,
        self.port,
      )));
    }
    Ok(())
  }
}

/// Split a SCRAM message into `key=value` attributes. Values may contain
/// `=`, so only the first one per attribute separates.
fn scram_attributes(message: &str) -> Vec<(&str, &str)> {
  message
    .split(',')
    .filter_map(|part| part.split_once('='))
    .collect()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
  let mut mac = HmacSha256::new_from_slice(key)
    .map_err(|_| ReqlError::driver("HMAC key initialization failed."))?;
  mac.update(data);
  Ok(mac.finalize().into_bytes().into())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
  if a.len() != b.len() {
    return false;
  }
  a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
  use super::*;

  // RFC 7677 §3 example exchange.
  const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
  const SERVER_FIRST: &str =
    "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
  const CLIENT_PROOF: &str = "dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
  const SERVER_SIGNATURE: &str = "6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

  fn rfc_handshake() -> Handshake {
    Handshake::with_nonce("localhost", 28015, "user", "pencil", CLIENT_NONCE.to_string())
  }

  fn first_response() -> Vec<u8> {
    json!({
      "success": true,
      "min_protocol_version": 0,
      "max_protocol_version": 0,
      "authentication": SERVER_FIRST,
    })
    .to_string()
    .into_bytes()
  }

  #[test]
  fn test_initial_message_layout() {
    let mut handshake = rfc_handshake();
    let message = handshake.next_message(None).unwrap().unwrap();

    assert_eq!(&message[..4], &[0xc3, 0xbd, 0xc2, 0x34]);
    assert_eq!(*message.last().unwrap(), 0);

    let payload: Value = serde_json::from_slice(&message[4..message.len() - 1]).unwrap();
    assert_eq!(payload["protocol_version"], json!(0));
    assert_eq!(payload["authentication_method"], json!("SCRAM-SHA-256"));
    assert_eq!(
      payload["authentication"],
      json!(format!("n,,n=user,r={CLIENT_NONCE}"))
    );
    assert_eq!(handshake.state(), HandshakeState::WaitFirstResponse);
  }

  #[test]
  fn test_proof_matches_the_rfc_7677_vector() {
    let mut handshake = rfc_handshake();
    handshake.next_message(None).unwrap();

    let message = handshake.next_message(Some(&first_response())).unwrap().unwrap();
    let payload: Value = serde_json::from_slice(&message[..message.len() - 1]).unwrap();
    assert_eq!(
      payload["authentication"],
      json!(format!(
        "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p={CLIENT_PROOF}"
      ))
    );
    assert_eq!(handshake.state(), HandshakeState::WaitFinalResponse);
  }

  #[test]
  fn test_server_signature_verifies() {
    let mut handshake = rfc_handshake();
    handshake.next_message(None).unwrap();
    handshake.next_message(Some(&first_response())).unwrap();

    let final_response = json!({
      "success": true,
      "authentication": format!("v={SERVER_SIGNATURE}"),
    })
    .to_string();
    let done = handshake.next_message(Some(final_response.as_bytes())).unwrap();
    assert!(done.is_none());
    assert_eq!(handshake.state(), HandshakeState::Done);
  }

  #[test]
  fn test_stepping_past_done_fails() {
    let mut handshake = rfc_handshake();
    handshake.next_message(None).unwrap();
    handshake.next_message(Some(&first_response())).unwrap();
    let final_response = json!({
      "success": true,
      "authentication": format!("v={SERVER_SIGNATURE}"),
    })
    .to_string();
    handshake.next_message(Some(final_response.as_bytes())).unwrap();

    let err = handshake.next_message(Some(b"{}")).unwrap_err();
    assert!(matches!(
      err,
      ReqlError::Driver(ReqlDriverError::InvalidHandshakeState(_))
    ));
  }

  #[test]
  fn test_wrong_password_fails_verification() {
    let mut handshake =
      Handshake::with_nonce("localhost", 28015, "user", "wrong", CLIENT_NONCE.to_string());
    handshake.next_message(None).unwrap();
    handshake.next_message(Some(&first_response())).unwrap();

    // The server's signature was computed over the correct password.
    let final_response = json!({
      "success": true,
      "authentication": format!("v={SERVER_SIGNATURE}"),
    })
    .to_string();
    let err = handshake.next_message(Some(final_response.as_bytes())).unwrap_err();
    assert!(matches!(err, ReqlError::Driver(ReqlDriverError::Auth(_))));
  }

  #[test]
  fn test_auth_error_codes_map_to_auth_errors() {
    let mut handshake = rfc_handshake();
    handshake.next_message(None).unwrap();

    let response = json!({"success": false, "error_code": 12, "error": "Wrong password"});
    let err = handshake
      .next_message(Some(response.to_string().as_bytes()))
      .unwrap_err();
    let ReqlError::Driver(ReqlDriverError::Auth(message)) = err else {
      panic!("expected an auth error, got {err:?}");
    };
    assert_eq!(message, "Could not connect to localhost:28015, Wrong password");
  }

  #[test]
  fn test_other_error_codes_map_to_driver_errors() {
    let mut handshake = rfc_handshake();
    handshake.next_message(None).unwrap();

    let response = json!({"success": false, "error_code": 30, "error": "boom"});
    let err = handshake
      .next_message(Some(response.to_string().as_bytes()))
      .unwrap_err();
    assert!(matches!(err, ReqlError::Driver(ReqlDriverError::Other(_))));
  }

  #[test]
  fn test_unsupported_protocol_range_is_rejected() {
    let mut handshake = rfc_handshake();
    handshake.next_message(None).unwrap();

    let response = json!({
      "success": true,
      "min_protocol_version": 1,
      "max_protocol_version": 2,
      "authentication": SERVER_FIRST,
    });
    assert!(handshake
      .next_message(Some(response.to_string().as_bytes()))
      .is_err());
  }

  #[test]
  fn test_foreign_server_nonce_is_rejected() {
    let mut handshake = rfc_handshake();
    handshake.next_message(None).unwrap();

    let response = json!({
      "success": true,
      "min_protocol_version": 0,
      "max_protocol_version": 0,
      "authentication": "r=somebodyelse,s=QSXCR+Q6sek8bf92,i=4096",
    });
    let err = handshake
      .next_message(Some(response.to_string().as_bytes()))
      .unwrap_err();
    assert!(matches!(err, ReqlError::Driver(ReqlDriverError::Auth(_))));
  }

  #[test]
  fn test_usernames_escape_scram_separators() {
    let mut handshake =
      Handshake::with_nonce("localhost", 28015, "a=b,c", "", CLIENT_NONCE.to_string());
    let message = handshake.next_message(None).unwrap().unwrap();
    let payload: Value = serde_json::from_slice(&message[4..message.len() - 1]).unwrap();
    assert_eq!(
      payload["authentication"],
      json!(format!("n,,n=a=3Db=2Cc,r={CLIENT_NONCE}"))
    );
  }

  #[test]
  fn test_unexpected_initial_response() {
    let mut handshake = rfc_handshake();
    assert!(handshake.next_message(Some(b"{}")).is_err());
    assert_eq!(handshake.state(), HandshakeState::Initial);
  }

  #[test]
  fn test_reset_issues_a_new_nonce() {
    let mut handshake = rfc_handshake();
    handshake.next_message(None).unwrap();
    handshake.reset();
    assert_eq!(handshake.state(), HandshakeState::Initial);
    assert_ne!(handshake.client_nonce, CLIENT_NONCE);
  }
}
