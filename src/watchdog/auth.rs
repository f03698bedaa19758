// src/watchdog/auth.rs

//! Shared-key authentication for `ADD_NODE` and internal-only IPC requests
//! (spec §6).

use md5::{Digest, Md5};

/// `authkey = md5(concat("state=<State> wd_port=<WdPort>", configured_authkey))`.
pub fn authkey_hash(state: &str, wd_port: u16, configured_key: &str) -> String {
    let preimage = format!("state={state} wd_port={wd_port}{configured_key}");
    let mut hasher = Md5::new();
    hasher.update(preimage.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify_authkey(candidate: &str, state: &str, wd_port: u16, configured_key: &str) -> bool {
    authkey_hash(state, wd_port, configured_key) == candidate
}
