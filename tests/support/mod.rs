//! Scripted in-process server for driving the client over a real socket.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Bind an ephemeral port and run `script` against the first connection.
pub async fn server<F, Fut>(script: F) -> (SocketAddr, JoinHandle<()>)
where
  F: FnOnce(TcpStream) -> Fut + Send + 'static,
  Fut: Future<Output = ()> + Send,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let handle = tokio::spawn(async move {
    let (stream, _) = listener.accept().await.unwrap();
    script(stream).await;
  });
  (addr, handle)
}

pub async fn read_nul(stream: &mut TcpStream) -> Vec<u8> {
  let mut buffer = Vec::new();
  loop {
    let byte = stream.read_u8().await.unwrap();
    if byte == 0 {
      return buffer;
    }
    buffer.push(byte);
  }
}

pub async fn write_nul(stream: &mut TcpStream, payload: Value) {
  stream
    .write_all(payload.to_string().as_bytes())
    .await
    .unwrap();
  stream.write_all(&[0]).await.unwrap();
  stream.flush().await.unwrap();
}

/// Play the server side of the SCRAM handshake for `password`.
pub async fn serve_handshake(stream: &mut TcpStream, password: &str) {
  let first = read_nul(stream).await;
  assert_eq!(&first[..4], &[0xc3, 0xbd, 0xc2, 0x34], "bad handshake magic");

  let payload: Value = serde_json::from_slice(&first[4..]).unwrap();
  assert_eq!(payload["authentication_method"], json!("SCRAM-SHA-256"));
  let client_first_bare = payload["authentication"]
    .as_str()
    .unwrap()
    .strip_prefix("n,,")
    .unwrap()
    .to_string();
  let client_nonce = client_first_bare.split("r=").nth(1).unwrap().to_string();

  let server_nonce = format!("{client_nonce}3rfcNHYJY1ZVvWVs7j");
  let salt = b"0123456789abcdef";
  let iterations = 4096u32;
  let server_first = format!(
    "r={server_nonce},s={},i={iterations}",
    BASE64_STANDARD.encode(salt)
  );
  write_nul(
    stream,
    json!({
      "success": true,
      "min_protocol_version": 0,
      "max_protocol_version": 0,
      "authentication": server_first,
    }),
  )
  .await;

  let final_message = read_nul(stream).await;
  let payload: Value = serde_json::from_slice(&final_message).unwrap();
  let authentication = payload["authentication"].as_str().unwrap();
  let client_final_no_proof = authentication.rsplit_once(",p=").unwrap().0;
  let auth_message = format!("{client_first_bare},{server_first},{client_final_no_proof}");

  let salted = pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), salt, iterations);
  let server_key = hmac(&salted, b"Server Key");
  let server_signature = hmac(&server_key, auth_message.as_bytes());
  write_nul(
    stream,
    json!({
      "success": true,
      "authentication": format!("v={}", BASE64_STANDARD.encode(server_signature)),
    }),
  )
  .await;
}

/// Reject the handshake with an authentication error.
pub async fn reject_handshake(stream: &mut TcpStream) {
  let _ = read_nul(stream).await;
  write_nul(
    stream,
    json!({"success": false, "error_code": 12, "error": "Wrong password"}),
  )
  .await;
}

pub async fn read_frame(stream: &mut TcpStream) -> (u64, Value) {
  try_read_frame(stream).await.expect("peer closed the socket")
}

pub async fn try_read_frame(stream: &mut TcpStream) -> Option<(u64, Value)> {
  let mut header = [0u8; 12];
  if stream.read_exact(&mut header).await.is_err() {
    return None;
  }
  let token = u64::from_le_bytes(header[..8].try_into().unwrap());
  let length = u32::from_le_bytes(header[8..].try_into().unwrap()) as usize;
  let mut body = vec![0u8; length];
  stream.read_exact(&mut body).await.unwrap();
  Some((token, serde_json::from_slice(&body).unwrap()))
}

pub async fn write_response(stream: &mut TcpStream, token: u64, body: Value) {
  let body = body.to_string().into_bytes();
  stream.write_all(&token.to_le_bytes()).await.unwrap();
  stream
    .write_all(&(body.len() as u32).to_le_bytes())
    .await
    .unwrap();
  stream.write_all(&body).await.unwrap();
  stream.flush().await.unwrap();
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
  let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
  mac.update(data);
  mac.finalize().into_bytes().into()
}
