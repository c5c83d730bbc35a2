use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use relaymq_codec::QoS;

use crate::auth::{AllowAll, Authenticator};
use crate::router::Router;
use crate::shared::Shared;
use crate::store::{MemoryStore, SessionStore};
use crate::utils::Counter;

pub struct ServerContextBuilder {
    max_qos: QoS,
    auth: Arc<dyn Authenticator>,
    store: Arc<dyn SessionStore>,
}

impl Default for ServerContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerContextBuilder {
    pub fn new() -> ServerContextBuilder {
        Self { max_qos: QoS::ExactlyOnce, auth: Arc::new(AllowAll), store: Arc::new(MemoryStore::new()) }
    }

    /// Highest QoS the broker grants; requests above it are downgraded.
    pub fn max_qos(mut self, max_qos: QoS) -> Self {
        self.max_qos = max_qos;
        self
    }

    pub fn authenticator<A: Authenticator + 'static>(mut self, auth: A) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub fn session_store<S: SessionStore + 'static>(mut self, store: S) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn build(self) -> ServerContext {
        let router = Router::new();
        let shared = Shared::new(router.clone(), self.store.clone());
        ServerContext {
            inner: Arc::new(ServerContextInner {
                shared,
                router,
                auth: self.auth,
                max_qos: self.max_qos,
                handshakings: Counter::new(),
                connections: Counter::new(),
            }),
        }
    }
}

/// Broker-wide state: the session registry, the subscription router and the
/// authentication policy. Long-lived for exactly as long as the value is
/// held; there is no hidden global.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub shared: Shared,
    pub router: Router,
    pub auth: Arc<dyn Authenticator>,
    pub max_qos: QoS,

    pub handshakings: Counter,
    pub connections: Counter,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> ServerContextBuilder {
        ServerContextBuilder::new()
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ServerContext sessions: {}, connections: {}, max_qos: {:?}",
            self.shared.sessions_count(),
            self.connections.count(),
            self.max_qos
        )
    }
}
