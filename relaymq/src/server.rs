use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use itertools::Itertools;

use relaymq_net::{Listener, Result, TlsListener};

use crate::context::ServerContext;
use crate::v3;

/// A bound listener tagged with the transport stack it serves.
pub enum Listening {
    Tcp(Listener),
    Tls(TlsListener),
    Ws(Listener),
    Wss(TlsListener),
}

pub struct MqttServerBuilder {
    scx: ServerContext,
    listeners: Vec<Listening>,
}

impl MqttServerBuilder {
    fn new(scx: ServerContext) -> Self {
        Self { scx, listeners: Vec::default() }
    }

    pub fn listener(mut self, listen: Listening) -> Self {
        self.listeners.push(listen);
        self
    }

    pub fn listeners<I: IntoIterator<Item = Listening>>(mut self, listens: I) -> Self {
        self.listeners.extend(listens);
        self
    }

    pub fn build(self) -> MqttServer {
        MqttServer { inner: Arc::new(MqttServerInner { scx: self.scx, listeners: self.listeners }) }
    }
}

#[derive(Clone)]
pub struct MqttServer {
    inner: Arc<MqttServerInner>,
}

pub struct MqttServerInner {
    scx: ServerContext,
    listeners: Vec<Listening>,
}

impl Deref for MqttServer {
    type Target = MqttServerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl MqttServer {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(scx: ServerContext) -> MqttServerBuilder {
        MqttServerBuilder::new(scx)
    }

    pub fn start(self) {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                log::error!("Failed to start the MQTT server! {}", e);
                std::process::exit(1);
            }
        });
    }

    pub async fn run(self) -> Result<()> {
        futures::future::join_all(
            self.listeners
                .iter()
                .map(|l| match l {
                    Listening::Tcp(l) => listen_tcp(self.scx.clone(), l).boxed(),
                    Listening::Tls(l) => listen_tls(self.scx.clone(), l).boxed(),
                    Listening::Ws(l) => listen_ws(self.scx.clone(), l).boxed(),
                    Listening::Wss(l) => listen_wss(self.scx.clone(), l).boxed(),
                })
                .collect_vec(),
        )
        .await;
        Ok(())
    }
}

async fn listen_tcp(scx: ServerContext, l: &Listener) {
    loop {
        match l.accept().await {
            Ok(a) => {
                let scx = scx.clone();
                tokio::spawn(async move {
                    log::debug!("tcp listen addr: {:?}, remote addr: {:?}", a.cfg.laddr, a.remote_addr);
                    if let Err(e) = v3::process(scx, a.tcp()).await {
                        log::warn!("Failed to process mqtt(tcp), {:?}", e);
                    }
                });
            }
            Err(e) => {
                log::warn!("Failed to accept TCP socket connection, {:?}", e);
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }
        }
    }
}

async fn listen_tls(scx: ServerContext, l: &TlsListener) {
    loop {
        match l.accept().await {
            Ok(a) => {
                let scx = scx.clone();
                tokio::spawn(async move {
                    log::debug!("tls listen addr: {:?}, remote addr: {:?}", a.cfg.laddr, a.remote_addr);
                    let s = match a.tls().await {
                        Ok(s) => s,
                        Err(e) => {
                            log::warn!("Failed to mqtt(tls) accept, {:?}", e);
                            return;
                        }
                    };
                    if let Err(e) = v3::process(scx, s).await {
                        log::warn!("Failed to process mqtt(tls), {:?}", e);
                    }
                });
            }
            Err(e) => {
                log::warn!("Failed to accept TLS socket connection, {:?}", e);
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }
        }
    }
}

async fn listen_ws(scx: ServerContext, l: &Listener) {
    loop {
        match l.accept().await {
            Ok(a) => {
                let scx = scx.clone();
                tokio::spawn(async move {
                    log::debug!("ws listen addr: {:?}, remote addr: {:?}", a.cfg.laddr, a.remote_addr);
                    let s = match a.ws().await {
                        Ok(s) => s,
                        Err(e) => {
                            log::warn!("Failed to websocket accept, {:?}", e);
                            return;
                        }
                    };
                    if let Err(e) = v3::process(scx, s).await {
                        log::warn!("Failed to process websocket mqtt, {:?}", e);
                    }
                });
            }
            Err(e) => {
                log::warn!("Failed to websocket accept TCP socket connection, {:?}", e);
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }
        }
    }
}

async fn listen_wss(scx: ServerContext, l: &TlsListener) {
    loop {
        match l.accept().await {
            Ok(a) => {
                let scx = scx.clone();
                tokio::spawn(async move {
                    log::debug!("wss listen addr: {:?}, remote addr: {:?}", a.cfg.laddr, a.remote_addr);
                    let s = match a.wss().await {
                        Ok(s) => s,
                        Err(e) => {
                            log::warn!("Failed to websocket mqtt(tls) accept, {:?}", e);
                            return;
                        }
                    };
                    if let Err(e) = v3::process(scx, s).await {
                        log::warn!("Failed to process websocket mqtt(tls), {:?}", e);
                    }
                });
            }
            Err(e) => {
                log::warn!("Failed to websocket accept TLS socket connection, {:?}", e);
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }
        }
    }
}
