use async_trait::async_trait;
use bytes::Bytes;
use bytestring::ByteString;

use relaymq_net::HttpRequestHead;

use crate::types::{ClientId, Password, UserName};
use crate::Result;

/// Everything the transport and CONNECT packet revealed about the peer.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub client_id: ClientId,
    pub clean_session: bool,
    pub username: Option<UserName>,
    pub password: Option<Password>,
    /// Set iff the connection arrived over WebSocket.
    pub http_head: Option<HttpRequestHead>,
    pub tls: bool,
    /// Peer certificate chain (DER), if one was presented during the TLS
    /// handshake.
    pub peer_certs: Option<Vec<Bytes>>,
}

/// The authenticated identity a connection acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: ByteString,
}

impl Principal {
    pub fn new<N: Into<ByteString>>(name: N) -> Self {
        Self { name: name.into() }
    }
}

/// Pluggable authentication policy.
///
/// `Ok(None)` refuses the connection with CONNACK `NotAuthorized`; `Err`
/// means the authenticator itself failed and the connection is torn down
/// without a CONNACK.
#[async_trait]
pub trait Authenticator: Sync + Send {
    async fn authenticate(&self, req: &AuthRequest) -> Result<Option<Principal>>;
}

/// Default policy: every connection is accepted, named by its client id.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, req: &AuthRequest) -> Result<Option<Principal>> {
        Ok(Some(Principal::new(req.username.clone().unwrap_or_else(|| req.client_id.clone()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        let req = AuthRequest {
            client_id: ClientId::from_static("c1"),
            clean_session: true,
            username: None,
            password: None,
            http_head: None,
            tls: false,
            peer_certs: None,
        };
        let p = AllowAll.authenticate(&req).await.unwrap().unwrap();
        assert_eq!(p.name, "c1");
    }
}
