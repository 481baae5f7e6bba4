//! Mixed proxy with SOCKS5 username/password authentication example

use mixsocks::{Server, auth::UserPass};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let auth = UserPass {
        username: "<user>".to_string(),
        password: "<pass>".to_string(),
    };

    let server = Server::builder().with_auth(Some(auth)).build();

    server.listen_and_serve("127.0.0.1:1080").await?;
    Ok(())
}
