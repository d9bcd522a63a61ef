//! Interactive chat client.
//!
//! Forwards stdin lines to the server while a background task prints
//! whatever the server sends. No request/response correlation: the two
//! directions never wait on each other.

use std::net::SocketAddr;

use tokio::io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{error, info};

use crate::error::Error;

/// Connects to the server and runs until stdin closes or the connection
/// drops.
pub async fn run(addr: SocketAddr) -> Result<(), Error> {
    let stream = TcpStream::connect(addr).await?;
    info!(%addr, "connected to chat server");
    let (mut reader, mut writer) = stream.into_split();

    // Server bytes are printed as they arrive, independent of the input
    // loop.
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    info!("server closed the connection");
                    break;
                }
                Ok(n) => {
                    print!("{}", String::from_utf8_lossy(&buf[..n]));
                    use std::io::Write as _;
                    let _ = std::io::stdout().flush();
                }
                Err(err) => {
                    error!(?err, "read from server failed");
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        writer.write_all(line.as_bytes()).await?;
    }
    Ok(())
}
