//! Basic mixed SOCKS5/HTTP proxy example

use mixsocks::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let server = Server::builder().build();
    println!("Starting mixed proxy on 127.0.0.1:1080");

    server.listen_and_serve("127.0.0.1:1080").await?;
    Ok(())
}
