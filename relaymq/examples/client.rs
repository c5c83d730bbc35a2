use relaymq::client::{ClientOptions, MqttClient};
use relaymq::codec::QoS;
use relaymq::Result;

//cargo run --example client

#[tokio::main]
async fn main() -> Result<()> {
    std::env::set_var("RUST_LOG", "client=debug,relaymq=info");
    env_logger::init();

    let client = MqttClient::connect_tcp(
        ([127, 0, 0, 1], 1883).into(),
        ClientOptions::new("demo").clean_session(false).keep_alive(30),
    );

    client.subscribe(vec![("demo/#".into(), QoS::AtLeastOnce)]).await?;
    let mut messages = client.messages();

    client.publish(QoS::AtLeastOnce, false, "demo/hello", &b"hi"[..]).await?;

    if let Some(m) = messages.recv().await {
        println!("{} => {:?}", m.topic, m.payload);
    }

    client.disconnect();
    Ok(())
}
