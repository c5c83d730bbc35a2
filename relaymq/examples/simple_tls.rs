use relaymq::context::ServerContext;
use relaymq::net::{Builder, Result};
use relaymq::server::{Listening, MqttServer};

//cargo run --example simple_tls

#[tokio::main]
async fn main() -> Result<()> {
    // std::env::set_var("RUST_LOG", "simple_tls=debug,relaymq=info,relaymq_net=info");
    // env_logger::init();

    let scx = ServerContext::new().build();

    MqttServer::new(scx)
        .listener(Listening::Tls(
            Builder::new()
                .name("external/tls")
                .laddr(([0, 0, 0, 0], 8883).into())
                .tls_key("./relaymq.key")
                .tls_cert("./relaymq.pem")
                .bind()?
                .tls()?,
        ))
        .build()
        .run()
        .await?;
    Ok(())
}
