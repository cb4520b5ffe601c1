//! Authentication subsystem: token cache, deployment-mode detection, grant
//! flows, vault resolution, and the NTLM challenge-response handshake.

pub(crate) mod cache;
pub(crate) mod grant;
pub(crate) mod health;
pub(crate) mod ntlm;

#[cfg(windows)]
pub(crate) mod sspi;
