use relaymq::context::ServerContext;
use relaymq::net::{Builder, Result};
use relaymq::server::{Listening, MqttServer};

//cargo run --example simple_ws

#[tokio::main]
async fn main() -> Result<()> {
    // std::env::set_var("RUST_LOG", "simple_ws=debug,relaymq=info,relaymq_net=info");
    // env_logger::init();

    let scx = ServerContext::new().build();

    MqttServer::new(scx)
        .listener(Listening::Ws(
            Builder::new().name("external/ws").laddr(([0, 0, 0, 0], 8080).into()).bind()?,
        ))
        .build()
        .run()
        .await?;
    Ok(())
}
