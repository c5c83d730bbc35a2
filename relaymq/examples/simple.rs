use relaymq::context::ServerContext;
use relaymq::net::{Builder, Result};
use relaymq::server::{Listening, MqttServer};

#[tokio::main]
async fn main() -> Result<()> {
    std::env::set_var("RUST_LOG", "simple=debug,relaymq=info,relaymq_net=info");
    env_logger::init();

    let scx = ServerContext::new().build();

    MqttServer::new(scx)
        .listener(Listening::Tcp(
            Builder::new().name("external/tcp").laddr(([0, 0, 0, 0], 1883).into()).bind()?,
        ))
        .build()
        .run()
        .await?;
    Ok(())
}
