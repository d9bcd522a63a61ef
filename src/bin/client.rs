use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use chat_relay::{CHAT_PORT, client};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), chat_relay::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), CHAT_PORT);
    client::run(addr).await
}
