//! Hooks Module
//!
//! The single extension point of the connect handshake: a verifier that
//! sees the decoded CONNECT and answers with the CONNACK reason code.

use async_trait::async_trait;

use crate::protocol::{Connect, ReasonCode};


/// Decides whether a CONNECT is accepted.
///
/// Returning anything other than [`ReasonCode::Success`] refuses the client
/// with a CONNACK carrying that code. 3.1.1 clients receive the nearest
/// 3.1.1 return code (see [`ReasonCode::to_v3_connack`]).
///
/// Any `Fn(&Connect) -> ReasonCode` closure is a verifier.
#[async_trait]
pub trait ConnectVerifier: Send + Sync {
    async fn verify(&self, connect: &Connect) -> ReasonCode;
}

/// Accepts every client
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl ConnectVerifier for AllowAll {
    async fn verify(&self, _connect: &Connect) -> ReasonCode {
        ReasonCode::Success
    }
}

#[async_trait]
impl<F> ConnectVerifier for F
where
    F: Fn(&Connect) -> ReasonCode + Send + Sync,
{
    async fn verify(&self, connect: &Connect) -> ReasonCode {
        self(connect)
    }
}

/// Accepts clients presenting one fixed username and password
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    username: String,
    password: Vec<u8>,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl AsRef<[u8]>) -> Self {
        Self {
            username: username.into(),
            password: password.as_ref().to_vec(),
        }
    }
}

#[async_trait]
impl ConnectVerifier for StaticCredentials {
    async fn verify(&self, connect: &Connect) -> ReasonCode {
        let username_ok = connect.username.as_deref() == Some(self.username.as_str());
        let password_ok = connect.password.as_deref() == Some(self.password.as_slice());
        if username_ok && password_ok {
            ReasonCode::Success
        } else {
            ReasonCode::BadUserNameOrPassword
        }
    }
}
