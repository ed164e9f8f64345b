//! # Warden (credential issuance and exactly-once mutations)
//!
//! `warden` issues and revokes credentials for a multi-tenant API and makes
//! non-idempotent requests safe to retry.
//!
//! ## Tokens
//!
//! Access tokens are compact HS256 JWTs signed by a [`keys::KeyRing`]. Every
//! token carries the `kid` of the key that signed it; verification looks the
//! key up by that id, so rotating the current key never invalidates tokens
//! signed by keys still in the ring.
//!
//! Refresh tokens are opaque and single use. Presenting one rotates it;
//! presenting an already rotated one is treated as theft and revokes every
//! live refresh token of the subject ([`refresh::RefreshLedger`]).
//!
//! Logout and admin revocation put the access token `jti` on a shared
//! denylist until the token would have expired anyway
//! ([`revocation::RevocationStore`]).
//!
//! ## Idempotency
//!
//! Mutations sent with an `Idempotency-Key` header run at most once per key
//! and subject. A retry with the same body replays the stored response; a
//! different body is rejected, and a retry that races the first attempt is
//! told to come back later ([`idempotency::run_idempotent`]).
//!
//! ## Rate limiting
//!
//! - a per-process token bucket per client address,
//! - a shared fixed-window counter per client address, split into an auth
//!   budget and a general one,
//! - a brute-force counter per client address and login identity,
//! - an allow-list of trusted networks that skips the shared limiters.

pub mod api;
pub mod cli;
pub mod clock;
pub mod error;
pub mod idempotency;
pub mod keys;
pub mod limits;
pub mod password;
pub mod refresh;
pub mod revocation;
pub mod store;
pub mod users;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
