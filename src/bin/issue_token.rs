use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use uuid::Uuid;

fn main() {
    let raw_user_id = std::env::args()
        .nth(1)
        .expect("Usage: issue_token <user_id> [ttl_hours]");
    let ttl_hours: u32 = std::env::args()
        .nth(2)
        .map(|s| s.parse().expect("ttl_hours must be a positive integer"))
        .unwrap_or(24);

    let user_id = match parse_user_id(&raw_user_id) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("user_id must be a UUID ({e})");
            std::process::exit(2);
        }
    };

    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let token = URL_SAFE_NO_PAD.encode(bytes);
    let token_hash = hex::encode(Sha256::digest(token.as_bytes()));

    println!("token: {token}");
    println!("{}", session_insert(user_id, &token_hash, ttl_hours));
}

fn parse_user_id(raw: &str) -> Result<Uuid, uuid::Error> {
    Uuid::parse_str(raw.trim())
}

/// Only typed values are interpolated, so the statement cannot carry
/// arbitrary text.
fn session_insert(user_id: Uuid, token_hash: &str, ttl_hours: u32) -> String {
    format!(
        "INSERT INTO sessions (user_id, token_hash, expires_at) \
         VALUES ('{user_id}', '{token_hash}', now() + interval '{ttl_hours} hours');"
    )
}
